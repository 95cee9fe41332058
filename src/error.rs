use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of a failed load.
///
/// The loader produces no errors of its own for missing keys. Whatever the fetcher reports is passed through as
/// [`LoadError::Fetch`]; the error is shared behind an `Arc` because a single batch-wide error goes to every caller
/// waiting on that batch.
#[derive(Debug, Error)]
pub enum LoadError<E>
where
    E: Display + Debug,
{
    #[error("{0}")]
    Fetch(Arc<E>),

    /// The task running the fetch died before producing any outcome.
    #[error("batch #{batch} of loader '{loader}' was aborted before producing a result")]
    Aborted { loader: String, batch: u64 },
}

impl<E> LoadError<E>
where
    E: Display + Debug,
{
    /// The fetcher's error, if this is one.
    pub fn fetch_error(&self) -> Option<&Arc<E>> {
        match self {
            Self::Fetch(err) => Some(err),
            Self::Aborted { .. } => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

// Derive would require `E: Clone` while only the `Arc` gets cloned.
impl<E> Clone for LoadError<E>
where
    E: Display + Debug,
{
    fn clone(&self) -> Self {
        match self {
            Self::Fetch(err) => Self::Fetch(Arc::clone(err)),
            Self::Aborted { loader, batch } => Self::Aborted {
                loader: loader.clone(),
                batch:  *batch,
            },
        }
    }
}
