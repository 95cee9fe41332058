use crate::batch::BatchSlot;
use crate::batch::ClosedBatch;
use crate::batch::Completion;
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::handle::LoadHandle;
use crate::handle::LoadManyHandle;
use crate::handle::Ticket;
use crate::traits::Fetcher;
use fieldx::error::FieldXError;
use fieldx::fxstruct;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

/// Batching, deduplicating, caching loader.
///
/// Individual key requests coming from any number of concurrent tasks are collected into batches. A batch is closed
/// either when the `wait` period since its first key expires or when it reaches `max_batch` keys, whichever comes
/// first. Each batch results in exactly one [`Fetcher::fetch_many`] call; the outcome is then handed back to every
/// caller waiting on the batch. Successfully loaded values are cached and never go through the batching machinery
/// again until [cleared](BatchLoader::clear).
///
/// ```ignore
/// let loader = BatchLoader::builder()
///     .fetcher(UserFetcher::new(pool))
///     .name("users")
///     .wait(Duration::from_millis(5))
///     .max_batch(100)
///     .build()?;
///
/// // Queue up both keys before waiting for any of them so they end up in the same batch.
/// let alice = loader.load_deferred("alice".into());
/// let bob = loader.load_deferred("bob".into());
/// let (alice, bob) = (alice.await?, bob.await?);
/// ```
#[fxstruct(
    sync,
    rc,
    no_new,
    default(off),
    builder(
        doc("Builder object of [`BatchLoader`].", "", "See [`BatchLoader::builder()`] method."),
        method_doc("Implement builder pattern for [`BatchLoader`]."),
    )
)]
pub struct BatchLoader<F>
where
    F: Fetcher,
{
    #[fieldx(get(vis(pub), clone), builder(vis(pub), required, into))]
    fetcher: Arc<F>,

    /// Loader name. Most useful for debugging and logging.
    #[fieldx(lock, optional, clearer(private), get(off), builder(vis(pub), into))]
    name: String,

    /// How long a batch stays open after its first key arrived.
    #[fieldx(vis(pub), get(copy), default(Duration::from_millis(1)))]
    wait: Duration,

    /// Maximum number of keys in a batch; 0 means no limit.
    #[fieldx(vis(pub), get(copy), default(0))]
    max_batch: usize,

    /// Maximum number of cached entries; 0 means unbounded cache.
    #[fieldx(vis(pub), get(copy), default(0))]
    max_capacity: u64,

    #[fieldx(private, lazy, get(clone), builder(off))]
    core: Arc<LoaderCore<F>>,
}

impl<F> BatchLoader<F>
where
    F: Fetcher,
{
    fn build_core(&self) -> Arc<LoaderCore<F>> {
        let name = self
            .clear_name()
            .unwrap_or_else(|| std::any::type_name::<F::Value>().to_string());

        let mut cache = Cache::builder().name(&name);
        if self.max_capacity() > 0 {
            cache = cache
                .max_capacity(self.max_capacity())
                .eviction_policy(EvictionPolicy::tiny_lfu());
        }

        Arc::new(LoaderCore {
            fetcher: self.fetcher(),
            wait: self.wait(),
            max_batch: self.max_batch(),
            cache: cache.build(),
            slot: Mutex::new(BatchSlot::new()),
            name,
        })
    }

    /// Build a loader from a [`LoaderConfig`].
    pub fn from_config(fetcher: impl Into<Arc<F>>, config: &LoaderConfig) -> Result<Arc<Self>, FieldXError> {
        let mut builder = Self::builder()
            .fetcher(fetcher)
            .wait(config.wait())
            .max_batch(config.max_batch)
            .max_capacity(config.max_capacity);
        if let Some(ref name) = config.name {
            builder = builder.name(name.clone());
        }
        builder.build()
    }

    #[inline]
    pub fn name(&self) -> String {
        self.core().name.clone()
    }

    /// Load a value by key. Batching and caching are applied automatically.
    ///
    /// `Ok(None)` means the fetcher reported no error but had no value for the key either.
    pub async fn load(&self, key: F::Key) -> Result<Option<F::Value>, LoadError<F::Error>> {
        self.load_deferred(key).resolve().await
    }

    /// Register `key` for loading without waiting for the result.
    ///
    /// This is the method to use when a task wants to request many keys, possibly from different loaders, before
    /// blocking on any of them. The returned handle can be awaited directly.
    ///
    /// Must be called within a Tokio runtime since it may start the batch timer.
    pub fn load_deferred(&self, key: F::Key) -> LoadHandle<F> {
        let core = self.core();
        let ticket = core.register(&key);
        LoadHandle::new(core, key, ticket)
    }

    /// Load many keys at once. Results come back in the order of `keys`. Depending on `max_batch` the keys may be
    /// spread over several batches.
    pub async fn load_many<I>(&self, keys: I) -> Vec<Result<Option<F::Value>, LoadError<F::Error>>>
    where
        I: IntoIterator<Item = F::Key>,
    {
        self.load_many_deferred(keys).resolve().await
    }

    pub fn load_many_deferred<I>(&self, keys: I) -> LoadManyHandle<F>
    where
        I: IntoIterator<Item = F::Key>,
    {
        LoadManyHandle::new(keys.into_iter().map(|key| self.load_deferred(key)).collect())
    }

    /// Put a value into the cache. If the key is already cached nothing is changed and `false` is returned.
    ///
    /// To forcefully prime the cache, clear the key first: `loader.clear(&key); loader.prime(key, &value);`
    pub fn prime(&self, key: F::Key, value: &F::Value) -> bool {
        self.core().prime(key, value)
    }

    /// Remove the key from the cache, if it is there. A load of the same key which is already waiting on a batch is
    /// not affected.
    pub fn clear(&self, key: &F::Key) {
        self.core().clear(key)
    }

    pub fn clear_all(&self) {
        self.core().clear_all()
    }

    /// Peek into the cache. The outer `Option` tells if the key is cached at all.
    pub fn cached(&self, key: &F::Key) -> Option<Option<F::Value>> {
        self.core().cache.get(key)
    }

    /// Number of cached entries. Entries dropped with [`clear_all()`](Self::clear_all) may still be counted for a
    /// while.
    pub fn cache_size(&self) -> u64 {
        let core = self.core();
        core.cache.run_pending_tasks();
        core.cache.entry_count()
    }
}

// Everything a load handle or a batch task may need after the caller's reference to the loader is gone.
pub(crate) struct LoaderCore<F>
where
    F: Fetcher,
{
    pub(crate) name: String,
    fetcher:         Arc<F>,
    wait:            Duration,
    max_batch:       usize,
    // Absent values are cached too as long as the fetcher didn't report an error for them.
    cache:           Cache<F::Key, Option<F::Value>>,
    // The lock orders all cache mutations with batch transitions. Never held across an await point.
    slot:            Mutex<BatchSlot<F>>,
}

impl<F> LoaderCore<F>
where
    F: Fetcher,
{
    pub(crate) fn register(self: &Arc<Self>, key: &F::Key) -> Ticket<F> {
        let mut slot = self.slot.lock();

        if let Some(value) = self.cache.get(key) {
            trace!("[{}] cache hit for '{key}'", self.name);
            return Ticket::Cached(value);
        }

        let batch = slot.open();
        let batch_id = batch.id();
        let (pos, added) = batch.key_index(key);
        let done: Completion<F> = batch.subscribe();
        let full = added && self.max_batch > 0 && batch.len() >= self.max_batch;

        if added && pos == 0 {
            self.start_timer(batch_id);
        }

        if full {
            if let Some(closed) = slot.close(batch_id) {
                self.dispatch(closed);
            }
        }

        Ticket::Pending {
            batch: batch_id,
            pos,
            done,
        }
    }

    fn start_timer(self: &Arc<Self>, batch_id: u64) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(core.wait).await;

            let closed = core.slot.lock().close(batch_id);
            match closed {
                Some(batch) => {
                    debug!("[{}] batch #{batch_id} closed by timer", core.name);
                    batch.fetch(&core.fetcher, &core.name).await;
                }
                // Size limit was hit first and the batch is being taken care of already.
                None => trace!("[{}] batch #{batch_id} was closed before its timer expired", core.name),
            }
        });
    }

    fn dispatch(self: &Arc<Self>, batch: ClosedBatch<F>) {
        debug!("[{}] batch #{} reached {} key(s)", self.name, batch.id(), self.max_batch);
        let core = Arc::clone(self);
        tokio::spawn(async move { batch.fetch(&core.fetcher, &core.name).await });
    }

    #[instrument(level = "trace", skip(self, value), fields(loader = %self.name))]
    pub(crate) fn store(&self, key: F::Key, value: Option<F::Value>) {
        let _slot = self.slot.lock();
        self.cache.insert(key, value);
    }

    pub(crate) fn prime(&self, key: F::Key, value: &F::Value) -> bool {
        let _slot = self.slot.lock();
        if self.cache.contains_key(&key) {
            false
        }
        else {
            // Store our own copy; the caller keeps theirs.
            self.cache.insert(key, Some(value.clone()));
            true
        }
    }

    pub(crate) fn clear(&self, key: &F::Key) {
        let _slot = self.slot.lock();
        self.cache.invalidate(key);
    }

    pub(crate) fn clear_all(&self) {
        let _slot = self.slot.lock();
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FetchOutcome;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Fetcher for Echo {
        type Error = String;
        type Key = String;
        type Value = String;

        async fn fetch_many(&self, keys: &[String]) -> FetchOutcome<String, String> {
            FetchOutcome::ok(keys.iter().map(|k| Some(k.to_uppercase())).collect())
        }
    }

    #[tokio::test]
    async fn registration_reuses_open_batch() {
        let loader = BatchLoader::builder()
            .fetcher(Echo)
            .wait(Duration::from_secs(60))
            .build()
            .unwrap();
        let core = loader.core();

        let Ticket::Pending { batch: b1, pos: p1, .. } = core.register(&"a".to_string())
        else {
            panic!("expected a pending ticket");
        };
        let Ticket::Pending { batch: b2, pos: p2, .. } = core.register(&"b".to_string())
        else {
            panic!("expected a pending ticket");
        };
        let Ticket::Pending { batch: b3, pos: p3, .. } = core.register(&"a".to_string())
        else {
            panic!("expected a pending ticket");
        };

        assert_eq!((b1, b2, b3), (1, 1, 1));
        assert_eq!((p1, p2, p3), (0, 1, 0));
        assert!(core.slot.lock().is_open());
    }

    #[tokio::test]
    async fn size_limit_closes_batch() {
        let loader = BatchLoader::builder()
            .fetcher(Echo)
            .wait(Duration::from_secs(60))
            .max_batch(2)
            .build()
            .unwrap();
        let core = loader.core();

        core.register(&"a".to_string());
        assert!(core.slot.lock().is_open());
        core.register(&"b".to_string());
        assert!(!core.slot.lock().is_open());

        let Ticket::Pending { batch, pos, .. } = core.register(&"c".to_string())
        else {
            panic!("expected a pending ticket");
        };
        assert_eq!((batch, pos), (2, 0));
    }

    #[tokio::test]
    async fn cached_key_bypasses_batching() {
        let loader = BatchLoader::builder().fetcher(Echo).build().unwrap();
        assert!(loader.prime("k".to_string(), &"V".to_string()));

        let core = loader.core();
        assert!(matches!(core.register(&"k".to_string()), Ticket::Cached(Some(ref v)) if v == "V"));
        assert!(!core.slot.lock().is_open());
    }

    #[test]
    fn default_name_is_value_type() {
        let loader = BatchLoader::builder().fetcher(Echo).build().unwrap();
        assert_eq!(loader.name(), std::any::type_name::<String>());
    }
}
