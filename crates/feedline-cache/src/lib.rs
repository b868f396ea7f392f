//! Caching engine for Feedline.
//!
//! ## Features
//!
//! - **Query cache**: keyed async results with stale-while-revalidate,
//!   request deduplication, garbage collection and optimistic mutations
//! - **Persistence**: snapshot restore/checkpoint over a [`KvStore`] with a
//!   cache-version marker
//! - **Media cache**: strict LRU of session-scoped blob handles backed by
//!   persisted bytes and a network [`MediaSource`]
//! - **Codec**: JSON text encoding that keeps 64-bit integers, timestamps and
//!   non-string-keyed maps intact

pub mod clock;
pub mod codec;
pub mod config;
mod error;
mod key;
pub mod media;
pub mod persist;
pub mod query;
pub mod retry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, QueryOptions};
pub use error::{CacheError, CodecError, ErrorKind, QueryError, StoreError};
pub use key::{KeyPart, QueryKey};
pub use media::{
    BlobRegistry, MediaCache, MediaIdentity, MediaSource, MediaState, ResourceHandle, SizeVariant,
};
pub use persist::{PersistedSnapshot, Persister, RestoreOutcome, spawn_checkpointer};
pub use query::{
    CacheValue, Discarded, EntryStatus, FetchFuture, Fetcher, Mutation, QueryCache, QueryEvent,
    QueryObserver, QueryState, fetcher_fn,
};
pub use retry::{RetryOutcome, RetryPolicy, retry_with_backoff};
pub use store::{FileStore, KvStore, MemoryStore};
