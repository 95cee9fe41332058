use crate::batch::Completion;
use crate::error::LoadError;
use crate::loader::LoaderCore;
use crate::traits::Fetcher;
use std::fmt::Debug;
use std::future::Future;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

pub type LoadResult<F> = Result<Option<<F as Fetcher>::Value>, LoadError<<F as Fetcher>::Error>>;

pub(crate) enum Ticket<F>
where
    F: Fetcher,
{
    Cached(Option<F::Value>),
    Pending {
        batch: u64,
        pos:   usize,
        done:  Completion<F>,
    },
}

/// A key registered for loading but not awaited yet.
///
/// Created by [`BatchLoader::load_deferred()`](crate::BatchLoader::load_deferred). The key is already part of a
/// batch (unless it was served from the cache), so dropping the handle doesn't withdraw it; it only discards the
/// result.
pub struct LoadHandle<F>
where
    F: Fetcher,
{
    core:   Arc<LoaderCore<F>>,
    key:    F::Key,
    ticket: Ticket<F>,
}

impl<F> LoadHandle<F>
where
    F: Fetcher,
{
    pub(crate) fn new(core: Arc<LoaderCore<F>>, key: F::Key, ticket: Ticket<F>) -> Self {
        Self { core, key, ticket }
    }

    pub fn key(&self) -> &F::Key {
        &self.key
    }

    /// `true` if the value came from the cache and resolving won't wait.
    pub fn is_cached(&self) -> bool {
        matches!(self.ticket, Ticket::Cached(_))
    }

    /// Wait for the batch to complete and take this key's share of the outcome.
    pub async fn resolve(self) -> LoadResult<F> {
        let (batch, pos, mut done) = match self.ticket {
            Ticket::Cached(value) => return Ok(value),
            Ticket::Pending { batch, pos, done } => (batch, pos, done),
        };

        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        let Some(outcome) = outcome
        else {
            warn!(
                "[{}] batch #{batch} ended without an outcome; '{}' is not loaded",
                self.core.name, self.key
            );
            return Err(LoadError::Aborted {
                loader: self.core.name.clone(),
                batch,
            });
        };

        let (value, error) = outcome.resolve(pos);
        if let Some(err) = error {
            return Err(LoadError::Fetch(err));
        }

        self.core.store(self.key, value.clone());
        Ok(value)
    }
}

impl<F> IntoFuture for LoadHandle<F>
where
    F: Fetcher,
{
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;
    type Output = LoadResult<F>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.resolve())
    }
}

impl<F> Debug for LoadHandle<F>
where
    F: Fetcher,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("LoadHandle");
        dbg.field("loader", &self.core.name).field("key", &self.key);
        match &self.ticket {
            Ticket::Cached(value) => dbg.field("cached", value),
            Ticket::Pending { batch, pos, .. } => dbg.field("batch", batch).field("pos", pos),
        };
        dbg.finish()
    }
}

/// Handles of many keys resolved together, in the order they were requested.
pub struct LoadManyHandle<F>
where
    F: Fetcher,
{
    handles: Vec<LoadHandle<F>>,
}

impl<F> LoadManyHandle<F>
where
    F: Fetcher,
{
    pub(crate) fn new(handles: Vec<LoadHandle<F>>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    // All keys are registered by now, so awaiting them one by one doesn't delay any batch.
    pub async fn resolve(self) -> Vec<LoadResult<F>> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            results.push(handle.resolve().await);
        }
        results
    }
}

impl<F> IntoFuture for LoadManyHandle<F>
where
    F: Fetcher,
{
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;
    type Output = Vec<LoadResult<F>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.resolve())
    }
}
