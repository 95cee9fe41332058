use async_trait::async_trait;
use std::fmt::Debug;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::types::FetchOutcome;

// For types that know how to fetch many records at once.
#[async_trait]
pub trait Fetcher: Sized + Send + Sync + 'static {
    /// The key type to be used with methods like [`BatchLoader::load()`](crate::BatchLoader::load) or
    /// [`BatchLoader::prime()`](crate::BatchLoader::prime).
    type Key: Debug + Display + Hash + Clone + Eq + Sized + Send + Sync + 'static;
    type Value: Debug + Clone + Send + Sync + 'static;
    type Error: Display + Debug + Send + Sync + 'static;

    /// Fetch values for a batch of distinct keys.
    ///
    /// The returned values must be aligned with `keys` by position. Errors can be reported either once for the whole
    /// batch or per position; see [`FetchOutcome`].
    async fn fetch_many(&self, keys: &[Self::Key]) -> FetchOutcome<Self::Value, Self::Error>;
}

/// Adapter turning a plain async closure into a [`Fetcher`]. Created with [`fetch_fn()`].
pub struct FnFetcher<K, V, E, Fun> {
    fetch:  Fun,
    _types: PhantomData<fn(K) -> (V, E)>,
}

/// Wrap a closure `Fn(Vec<K>) -> impl Future<Output = FetchOutcome<V, E>>` into a [`Fetcher`].
///
/// ```ignore
/// let loader = BatchLoader::builder()
///     .fetcher(fetch_fn(|ids: Vec<u64>| async move {
///         FetchOutcome::from(db.users_by_ids(&ids).await)
///     }))
///     .build()?;
/// ```
pub fn fetch_fn<K, V, E, Fun, Fut>(fetch: Fun) -> FnFetcher<K, V, E, Fun>
where
    Fun: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome<V, E>> + Send + 'static,
{
    FnFetcher {
        fetch,
        _types: PhantomData,
    }
}

#[async_trait]
impl<K, V, E, Fun, Fut> Fetcher for FnFetcher<K, V, E, Fun>
where
    K: Debug + Display + Hash + Clone + Eq + Sized + Send + Sync + 'static,
    V: Debug + Clone + Send + Sync + 'static,
    E: Display + Debug + Send + Sync + 'static,
    Fun: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchOutcome<V, E>> + Send + 'static,
{
    type Error = E;
    type Key = K;
    type Value = V;

    async fn fetch_many(&self, keys: &[K]) -> FetchOutcome<V, E> {
        (self.fetch)(keys.to_vec()).await
    }
}
