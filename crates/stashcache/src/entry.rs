//! Cached values and their age

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One fetch result held by a cache
///
/// Entries are replaced wholesale on refresh, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    /// Logical key the entry was fetched for
    pub key: String,
    /// Fetched value
    pub data: T,
    /// Fetch completion time, milliseconds since the epoch
    pub timestamp: u64,
}

impl<T> CacheEntry<T> {
    /// Create an entry stamped at `timestamp`
    pub fn new(key: impl Into<String>, data: T, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            data,
            timestamp,
        }
    }

    /// Milliseconds since the entry was fetched
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    /// Older than `ttl`
    pub fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        self.age(now) > ttl_millis(ttl)
    }

    /// Younger than `ttl`
    pub fn is_fresh(&self, now: u64, ttl: Duration) -> bool {
        self.age(now) < ttl_millis(ttl)
    }
}

/// Serialized form of an entry in a durable store
///
/// The key is implied by the storage key and not written.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredEntry<T> {
    pub data: T,
    pub timestamp: u64,
}

pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}
