//! # stashcache
//!
//! Client-side caching for asynchronous fetchers.
//!
//! ## Caches
//! - [`MemoryCache`]: in-memory, TTL plus stale-while-revalidate
//! - [`PersistentCache`]: entries serialized into a [`stashdb::DurableStore`]
//!   so they survive restarts; expiry checked on read
//! - [`QueryCache`]: shared results with at most one in-flight fetch per key
//!
//! The memory and persistent caches hand out query handles whose
//! [`CacheState`] (`data`, `is_loading`, `error`) can be read or watched.
//! Fetch failures end up in that state; storage and background refresh
//! failures are logged through `tracing` and absorbed.

#![warn(missing_docs)]

mod clock;
mod entry;
mod error;
mod memory;
mod persistent;
mod query;
mod state;
mod stats;
mod ticket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use memory::{MemoryCache, MemoryOptions, MemoryQuery, DEFAULT_MEMORY_TTL};
pub use persistent::{
    PersistentCache, PersistentCacheBuilder, PersistentOptions, PersistentQuery,
    DEFAULT_PERSISTENT_TTL, DEFAULT_PREFIX,
};
pub use query::{QueryCache, QueryOptions, DEFAULT_QUERY_TTL};
pub use state::{CacheState, Fetcher};
pub use stats::CacheStats;
