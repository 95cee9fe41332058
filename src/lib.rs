//! # batch-loader
//!
//! Batching, deduplicating, caching loader for key-indexed records.
//!
//! Think of it as the thing standing between many concurrent "give me the record for this key" requests and a
//! backend that is much happier answering one "give me the records for these keys" request.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Many independent tasks request records by key, often the same keys, at around the same time; e.g. resolvers of a
//!   GraphQL query.
//! - The backend supports bulk fetches and a round-trip is expensive compared to the size of a single record.
//!
//! The loader operates on the following principles:
//!
//! - It is backend-agnostic: the bulk fetch is a capability supplied by the user through the [`Fetcher`] trait,
//!   which also defines the `Key`, `Value` and `Error` types.
//! - Requests are collected into a batch for a short `wait` window or until `max_batch` keys are collected. Each key
//!   appears in a batch once, no matter how many callers asked for it.
//! - Each batch results in exactly one fetch. The outcome is spread back to the callers by key position.
//! - Successfully loaded values are cached in a [moka](https://crates.io/crates/moka) cache; errors are never cached.
//! - Fully async, built on Tokio. The loader lock is never held across an await point, so a slow fetch doesn't stop
//!   other keys from forming the next batch.
//! - As an in-process cache, it doesn't support distributed caching nor does it persist anything.
//!
//! # Fetch Outcome
//!
//! A fetcher returns a [`FetchOutcome`](types::FetchOutcome): values aligned with the keys it was given, and errors
//! which are either absent, shared by the whole batch, or reported per key. A fetcher returning fewer values than keys
//! doesn't break anything; the callers of the uncovered keys simply get no value.
//!
//! ```ignore
//! use batch_loader::prelude::*;
//!
//! let users = BatchLoader::builder()
//!     .fetcher(fetch_fn(move |ids: Vec<u64>| {
//!         let db = db.clone();
//!         async move { FetchOutcome::from(db.users_by_ids(&ids).await) }
//!     }))
//!     .name("users")
//!     .max_batch(100)
//!     .build()?;
//!
//! let user = users.load(42).await?;
//! ```

pub(crate) mod batch;
pub mod config;
pub mod error;
pub mod handle;
pub mod loader;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use error::LoadError;
#[doc(inline)]
pub use loader::BatchLoader;
#[doc(inline)]
pub use traits::Fetcher;

pub mod prelude {
    pub use crate::config::LoaderConfig;
    pub use crate::error::LoadError;
    pub use crate::handle::LoadHandle;
    pub use crate::handle::LoadManyHandle;
    pub use crate::handle::LoadResult;
    pub use crate::loader::BatchLoader;
    pub use crate::traits::fetch_fn;
    pub use crate::traits::Fetcher;
    pub use crate::types::*;
}
