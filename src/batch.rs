//! Batch lifecycle.
//!
//! A batch goes through `OPEN → CLOSING → FETCHING → DONE`. Each state is a distinct type here:
//!
//! - [`OpenBatch`] lives in the loader's [`BatchSlot`] and collects keys;
//! - closing moves it out of the slot and turns it into a [`ClosedBatch`], so no more keys can be added;
//! - [`ClosedBatch::fetch`] calls the fetcher once and publishes a [`BatchOutcome`] through the completion channel.
//!
//! The completion channel is a `watch` whose value turns from `None` to `Some` exactly once. If the task running the
//! fetch dies, the sender is dropped along with it and the waiters observe a closed channel instead of hanging.

use crate::traits::Fetcher;
use crate::types::FetchErrors;
use crate::types::FetchOutcome;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

pub(crate) type Completion<F> = watch::Receiver<Option<Arc<BatchOutcome<F>>>>;
type CompletionSender<F> = watch::Sender<Option<Arc<BatchOutcome<F>>>>;

// Holds the only open batch of a loader, if any. Always accessed under the loader lock.
pub(crate) struct BatchSlot<F>
where
    F: Fetcher,
{
    current: Option<OpenBatch<F>>,
    last_id: u64,
}

impl<F> BatchSlot<F>
where
    F: Fetcher,
{
    pub(crate) fn new() -> Self {
        Self {
            current: None,
            last_id: 0,
        }
    }

    /// Returns the open batch, starting a new one if there is none.
    pub(crate) fn open(&mut self) -> &mut OpenBatch<F> {
        let last_id = &mut self.last_id;
        self.current.get_or_insert_with(|| {
            *last_id += 1;
            OpenBatch::new(*last_id)
        })
    }

    /// Close batch `id` if it is still the open one. Both the timer and the size limit end up here; whoever comes
    /// second gets `None`.
    pub(crate) fn close(&mut self, id: u64) -> Option<ClosedBatch<F>> {
        if self.current.as_ref().is_some_and(|batch| batch.id == id) {
            self.current.take().map(OpenBatch::close)
        }
        else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.current.is_some()
    }
}

pub(crate) struct OpenBatch<F>
where
    F: Fetcher,
{
    id:        u64,
    keys:      Vec<F::Key>,
    positions: HashMap<F::Key, usize>,
    done:      CompletionSender<F>,
}

impl<F> OpenBatch<F>
where
    F: Fetcher,
{
    fn new(id: u64) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            id,
            keys: Vec::new(),
            positions: HashMap::new(),
            done,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Position of `key` in the batch. The key is appended if it's not there yet, in which case the second element of
    /// the tuple is `true`.
    pub(crate) fn key_index(&mut self, key: &F::Key) -> (usize, bool) {
        if let Some(pos) = self.positions.get(key) {
            return (*pos, false);
        }

        let pos = self.keys.len();
        self.keys.push(key.clone());
        self.positions.insert(key.clone(), pos);
        (pos, true)
    }

    pub(crate) fn subscribe(&self) -> Completion<F> {
        self.done.subscribe()
    }

    fn close(self) -> ClosedBatch<F> {
        ClosedBatch {
            id:   self.id,
            keys: self.keys,
            done: self.done,
        }
    }
}

pub(crate) struct ClosedBatch<F>
where
    F: Fetcher,
{
    id:   u64,
    keys: Vec<F::Key>,
    done: CompletionSender<F>,
}

impl<F> ClosedBatch<F>
where
    F: Fetcher,
{
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[instrument(level = "trace", skip_all, fields(loader = loader, batch = self.id))]
    pub(crate) async fn fetch(self, fetcher: &F, loader: &str) {
        debug!("[{loader}] fetching batch #{} of {} key(s)", self.id, self.keys.len());

        let outcome = fetcher.fetch_many(&self.keys).await;

        if outcome.values.len() < self.keys.len() && outcome.errors.is_none() {
            warn!(
                "[{loader}] fetcher returned {} value(s) for {} key(s) of batch #{}",
                outcome.values.len(),
                self.keys.len(),
                self.id
            );
        }

        self.done.send_replace(Some(Arc::new(BatchOutcome::from(outcome))));
        debug!("[{loader}] batch #{} done", self.id);
    }
}

// Errors as handed out to the waiters.
enum BatchErrors<E> {
    None,
    Shared(Arc<E>),
    PerKey(Vec<Option<Arc<E>>>),
}

pub(crate) struct BatchOutcome<F>
where
    F: Fetcher,
{
    values: Vec<Option<F::Value>>,
    errors: BatchErrors<F::Error>,
}

impl<F> BatchOutcome<F>
where
    F: Fetcher,
{
    /// Value and error for the key at `pos`. Positions the fetcher didn't cover resolve to nothing.
    pub(crate) fn resolve(&self, pos: usize) -> (Option<F::Value>, Option<Arc<F::Error>>) {
        let value = self.values.get(pos).cloned().flatten();
        let error = match &self.errors {
            BatchErrors::None => None,
            BatchErrors::Shared(err) => Some(Arc::clone(err)),
            BatchErrors::PerKey(errs) => errs.get(pos).cloned().flatten(),
        };
        (value, error)
    }
}

impl<F> From<FetchOutcome<F::Value, F::Error>> for BatchOutcome<F>
where
    F: Fetcher,
{
    fn from(outcome: FetchOutcome<F::Value, F::Error>) -> Self {
        let errors = match outcome.errors {
            FetchErrors::None => BatchErrors::None,
            FetchErrors::Shared(err) => BatchErrors::Shared(Arc::new(err)),
            // A single error is always meant for the whole batch.
            FetchErrors::PerKey(mut errs) if errs.len() == 1 => match errs.pop().flatten() {
                Some(err) => BatchErrors::Shared(Arc::new(err)),
                None => BatchErrors::None,
            },
            FetchErrors::PerKey(errs) => BatchErrors::PerKey(errs.into_iter().map(|e| e.map(Arc::new)).collect()),
        };

        Self {
            values: outcome.values,
            errors,
        }
    }
}

impl<F> Debug for BatchOutcome<F>
where
    F: Fetcher,
{
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let errors = match &self.errors {
            BatchErrors::None => 0,
            BatchErrors::Shared(_) => 1,
            BatchErrors::PerKey(errs) => errs.iter().filter(|e| e.is_some()).count(),
        };
        fmt.debug_struct("BatchOutcome")
            .field("values", &self.values)
            .field("errors", &errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Numbers;

    #[async_trait]
    impl Fetcher for Numbers {
        type Error = String;
        type Key = u32;
        type Value = String;

        async fn fetch_many(&self, keys: &[u32]) -> FetchOutcome<String, String> {
            FetchOutcome::ok(keys.iter().map(|k| Some(format!("#{k}"))).collect())
        }
    }

    #[test]
    fn key_index_dedupes_by_position() {
        let mut slot = BatchSlot::<Numbers>::new();
        let batch = slot.open();

        assert_eq!(batch.key_index(&7), (0, true));
        assert_eq!(batch.key_index(&3), (1, true));
        assert_eq!(batch.key_index(&7), (0, false));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn close_is_single_fire() {
        let mut slot = BatchSlot::<Numbers>::new();
        let id = slot.open().id();

        assert!(slot.close(id + 1).is_none(), "unknown batch id must not close the open batch");
        assert!(slot.is_open());

        let closed = slot.close(id).expect("the open batch must close");
        assert_eq!(closed.id(), id);
        assert!(!slot.is_open());
        assert!(slot.close(id).is_none(), "second close must be a no-op");

        // The next batch gets a fresh id.
        assert_eq!(slot.open().id(), id + 1);
    }

    #[tokio::test]
    async fn fetch_publishes_outcome() {
        let mut slot = BatchSlot::<Numbers>::new();
        let batch = slot.open();
        batch.key_index(&1);
        batch.key_index(&2);
        let id = batch.id();
        let mut done = batch.subscribe();

        slot.close(id).unwrap().fetch(&Numbers, "numbers").await;

        let outcome = done.wait_for(Option::is_some).await.unwrap().clone().unwrap();
        assert_eq!(outcome.resolve(1).0.as_deref(), Some("#2"));
    }

    #[test]
    fn resolve_out_of_range() {
        let outcome = BatchOutcome::<Numbers>::from(FetchOutcome::ok(vec![Some("a".to_string())]));
        assert_eq!(outcome.resolve(0).0.as_deref(), Some("a"));
        let (value, error) = outcome.resolve(5);
        assert!(value.is_none());
        assert!(error.is_none());
    }

    #[test]
    fn resolve_shared_error() {
        let outcome = BatchOutcome::<Numbers>::from(FetchOutcome::failed("boom".to_string()));
        let (_, e0) = outcome.resolve(0);
        let (_, e1) = outcome.resolve(1);
        let (e0, e1) = (e0.unwrap(), e1.unwrap());
        assert!(Arc::ptr_eq(&e0, &e1));
        assert_eq!(e0.as_str(), "boom");
    }

    #[test]
    fn single_per_key_error_applies_to_all() {
        let outcome = BatchOutcome::<Numbers>::from(FetchOutcome::with_errors(
            vec![Some("a".to_string()), Some("b".to_string())],
            vec![Some("bad".to_string())],
        ));
        assert_eq!(outcome.resolve(1).1.as_deref().map(String::as_str), Some("bad"));
    }

    #[test]
    fn per_key_errors() {
        let outcome = BatchOutcome::<Numbers>::from(FetchOutcome::with_errors(
            vec![Some("a".to_string()), None, Some("c".to_string())],
            vec![None, Some("missing".to_string()), None],
        ));
        assert!(outcome.resolve(0).1.is_none());
        assert_eq!(outcome.resolve(1).1.as_deref().map(String::as_str), Some("missing"));
        assert_eq!(outcome.resolve(2).0.as_deref(), Some("c"));
        assert!(outcome.resolve(3).1.is_none());
    }
}
