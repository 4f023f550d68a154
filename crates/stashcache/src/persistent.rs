//! Persistent keyed cache backed by a durable string store
//!
//! Entries are JSON `{"data": .., "timestamp": ..}` documents stored under
//! `prefix + key`. Expiry is only checked when an entry is read; expired and
//! unreadable entries are misses. Storage failures never reach the caller.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stashdb::DurableStore;
use tokio::sync::watch;
use tracing::debug;

use crate::clock::{self, Clock};
use crate::entry::{CacheEntry, StoredEntry};
use crate::error::CacheError;
use crate::state::{boxed_fetcher, CacheState, Fetcher, StateCell};
use crate::stats::CacheStats;
use crate::ticket::WriteTickets;

/// Default time-to-live for persisted entries
pub const DEFAULT_PERSISTENT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default storage key prefix
pub const DEFAULT_PREFIX: &str = "cache_";

/// Per-query policy for the persistent cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentOptions {
    /// Age after which a stored entry is dropped on read
    pub ttl: Duration,
}

impl Default for PersistentOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_PERSISTENT_TTL,
        }
    }
}

impl PersistentOptions {
    /// Set the time-to-live
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

struct PersistentInner<S> {
    store: S,
    prefix: String,
    clock: Arc<dyn Clock>,
    tickets: WriteTickets,
    stats: CacheStats,
}

/// Keyed cache whose entries live in a [`DurableStore`]
///
/// Cloning is cheap and clones share the same store.
pub struct PersistentCache<S> {
    inner: Arc<PersistentInner<S>>,
}

impl<S> Clone for PersistentCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for PersistentCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCache")
            .field("prefix", &self.inner.prefix)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PersistentCache`]
pub struct PersistentCacheBuilder<S> {
    store: S,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl<S: DurableStore + 'static> PersistentCacheBuilder<S> {
    /// Storage key prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Clock used to stamp and age entries
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the cache
    pub fn build(self) -> PersistentCache<S> {
        PersistentCache {
            inner: Arc::new(PersistentInner {
                store: self.store,
                prefix: self.prefix,
                clock: self.clock,
                tickets: WriteTickets::new(),
                stats: CacheStats::new(),
            }),
        }
    }
}

impl<S: DurableStore + 'static> PersistentCache<S> {
    /// Create a cache over `store` with the default prefix and system clock
    pub fn new(store: S) -> Self {
        Self::builder(store).build()
    }

    /// Start configuring a cache over `store`
    pub fn builder(store: S) -> PersistentCacheBuilder<S> {
        PersistentCacheBuilder {
            store,
            prefix: DEFAULT_PREFIX.to_string(),
            clock: clock::system(),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Storage key used for logical `key`
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.prefix, key)
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Bind `key` and `fetcher` into a query handle
    pub fn query<T, E, F, Fut>(
        &self,
        key: impl Into<String>,
        fetcher: F,
        options: PersistentOptions,
    ) -> PersistentQuery<S, T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + fmt::Display + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        PersistentQuery {
            shared: Arc::new(PersistentShared {
                key: key.into(),
                cache: self.clone(),
                fetcher: boxed_fetcher(fetcher),
                options,
                state: StateCell::new(),
            }),
        }
    }

    /// Read a live entry for `key`
    ///
    /// Missing, unreadable and expired entries all come back as `None`;
    /// expired ones are removed from the store on the way.
    pub fn read<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<CacheEntry<T>> {
        let storage_key = self.storage_key(key);

        let raw = match self.inner.store.get(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.storage_failed(key, e);
                return None;
            }
        };

        let stored: StoredEntry<T> = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                self.storage_failed(key, stashdb::Error::Parse(e.to_string()));
                return None;
            }
        };

        let entry = CacheEntry::new(key, stored.data, stored.timestamp);
        let now = self.inner.clock.now_millis();
        if entry.is_expired(now, ttl) {
            debug!(key, age = entry.age(now), "persistent entry expired");
            self.remove(key);
            return None;
        }

        Some(entry)
    }

    /// Persist `data` for `key`, stamped now
    ///
    /// Best effort: failures are logged and counted, never returned. Fetches
    /// for `key` already in flight will not overwrite it.
    pub fn write<T: Serialize>(&self, key: &str, data: &T) {
        let ticket = self.inner.tickets.issue(key);
        self.settle(key, ticket, data);
    }

    /// Persist `data` under `ticket`
    ///
    /// Returns false, writing nothing, if a newer fetch for `key` started
    /// after this one. A failed store write still counts as settled.
    fn settle<T: Serialize>(&self, key: &str, ticket: u64, data: &T) -> bool {
        let written = self.inner.tickets.settle(key, ticket, || {
            let stored = StoredEntry {
                data,
                timestamp: self.inner.clock.now_millis(),
            };

            let json = match serde_json::to_string(&stored) {
                Ok(json) => json,
                Err(e) => {
                    self.storage_failed(key, stashdb::Error::Parse(e.to_string()));
                    return;
                }
            };

            match self.inner.store.set(&self.storage_key(key), &json) {
                Ok(()) => self.inner.stats.record_insert(),
                Err(e) => self.storage_failed(key, e),
            }
        });

        if !written {
            debug!(key, "dropping result of superseded fetch");
        }
        written
    }

    /// Remove the durable entry for `key`
    pub fn clear_cache(&self, key: &str) {
        match self.inner.store.get(&self.storage_key(key)) {
            Ok(Some(_)) => self.remove(key),
            Ok(None) => {}
            Err(e) => self.storage_failed(key, e),
        }
    }

    /// Remove an entry known to be present
    fn remove(&self, key: &str) {
        match self.inner.store.remove(&self.storage_key(key)) {
            Ok(()) => self.inner.stats.record_eviction(),
            Err(e) => self.storage_failed(key, e),
        }
    }

    fn storage_failed(&self, key: &str, err: stashdb::Error) {
        self.inner.stats.record_error();
        let err: CacheError = CacheError::Storage(err);
        err.report(key);
    }
}

struct PersistentShared<S, T, E> {
    key: String,
    cache: PersistentCache<S>,
    fetcher: Fetcher<T, E>,
    options: PersistentOptions,
    state: StateCell<T, E>,
}

/// A key and fetcher bound to a [`PersistentCache`]
pub struct PersistentQuery<S, T, E> {
    shared: Arc<PersistentShared<S, T, E>>,
}

impl<S, T, E> Clone for PersistentQuery<S, T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, T, E> fmt::Debug for PersistentQuery<S, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentQuery")
            .field("key", &self.shared.key)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl<S, T, E> PersistentQuery<S, T, E>
where
    S: DurableStore + 'static,
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    /// Key this handle reads
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Current state
    pub fn state(&self) -> CacheState<T, E> {
        self.shared.state.snapshot()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<CacheState<T, E>> {
        self.shared.state.subscribe()
    }

    /// Serve a live stored entry, or fetch and persist a new one
    pub async fn load(&self) -> CacheState<T, E> {
        let shared = &self.shared;

        match shared.cache.read::<T>(&shared.key, shared.options.ttl) {
            Some(entry) => {
                shared.cache.stats().record_hit();
                debug!(key = %shared.key, "persistent cache hit");
                shared.state.modify(|state| {
                    state.data = Some(entry.data);
                    state.is_loading = false;
                    state.error = None;
                });
                self.state()
            }
            None => {
                shared.cache.stats().record_miss();
                self.fetch().await
            }
        }
    }

    /// Fetch now, ignoring any stored entry
    pub async fn refetch(&self) -> CacheState<T, E> {
        self.fetch().await
    }

    /// Remove the stored entry and reset exposed data
    pub fn clear_cache(&self) {
        let shared = &self.shared;
        shared.cache.clear_cache(&shared.key);

        let generation = shared.state.begin();
        shared.state.publish(generation, |state| {
            state.data = None;
            state.is_loading = false;
            state.error = None;
        });
    }

    async fn fetch(&self) -> CacheState<T, E> {
        let shared = &self.shared;
        let generation = shared.state.begin();
        let ticket = shared.cache.inner.tickets.issue(&shared.key);
        shared.state.publish(generation, |state| state.is_loading = true);

        match (shared.fetcher)().await {
            Ok(data) => {
                let data = if shared.cache.settle(&shared.key, ticket, &data) {
                    data
                } else {
                    // Prefer what the newer fetch stored, if it already has
                    shared
                        .cache
                        .read::<T>(&shared.key, shared.options.ttl)
                        .map_or(data, |entry| entry.data)
                };
                shared.state.publish(generation, |state| {
                    state.data = Some(data);
                    state.is_loading = false;
                    state.error = None;
                });
            }
            Err(err) => {
                CacheError::Fetch(err.clone()).report(&shared.key);
                let fallback = shared
                    .cache
                    .read::<T>(&shared.key, shared.options.ttl)
                    .map(|entry| entry.data);
                shared.state.publish(generation, |state| {
                    state.data = fallback;
                    state.is_loading = false;
                    state.error = Some(err);
                });
            }
        }

        self.state()
    }
}
