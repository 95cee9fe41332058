use std::fmt::Debug;

/// Errors reported by a single bulk fetch.
///
/// A fetch may fail as a whole, in which case every key of the batch gets the same error, or report failures on a
/// per-key basis. A per-key vector is aligned with the keys passed to the fetcher.
#[derive(Debug, Clone)]
pub enum FetchErrors<E> {
    None,
    Shared(E),
    PerKey(Vec<Option<E>>),
}

impl<E> FetchErrors<E> {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl<E> Default for FetchErrors<E> {
    fn default() -> Self {
        Self::None
    }
}

/// What a [`Fetcher`](crate::traits::Fetcher) hands back for a batch of keys.
///
/// `values` is position-aligned with the keys of the batch. A vector shorter than the key list is tolerated: the
/// missing positions resolve to no value.
#[derive(Debug, Clone)]
pub struct FetchOutcome<V, E> {
    pub values: Vec<Option<V>>,
    pub errors: FetchErrors<E>,
}

impl<V, E> FetchOutcome<V, E> {
    /// All keys were fetched without errors.
    pub fn ok(values: Vec<Option<V>>) -> Self {
        Self {
            values,
            errors: FetchErrors::None,
        }
    }

    /// The fetch failed for the whole batch.
    pub fn failed(error: E) -> Self {
        Self {
            values: Vec::new(),
            errors: FetchErrors::Shared(error),
        }
    }

    pub fn with_errors(values: Vec<Option<V>>, errors: Vec<Option<E>>) -> Self {
        Self {
            values,
            errors: FetchErrors::PerKey(errors),
        }
    }
}

impl<V, E> From<Result<Vec<Option<V>>, E>> for FetchOutcome<V, E> {
    fn from(result: Result<Vec<Option<V>>, E>) -> Self {
        match result {
            Ok(values) => Self::ok(values),
            Err(error) => Self::failed(error),
        }
    }
}
