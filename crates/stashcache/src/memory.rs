//! Ephemeral keyed cache with stale-while-revalidate
//!
//! A [`MemoryCache`] owns a map of key -> [`CacheEntry`]. Consumers bind a key
//! and a fetcher to it with [`MemoryCache::query`] and drive the resulting
//! [`MemoryQuery`]: `load` serves from the map when it can, fetches when it
//! must, and refreshes stale entries in the background.
//!
//! Every handle bound to a key is told when that key's entry is replaced,
//! whichever handle did the fetching.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::RandomState;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::clock::{self, Clock};
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::state::{boxed_fetcher, CacheState, Fetcher, StateCell};
use crate::stats::CacheStats;
use crate::ticket::WriteTickets;

/// Default time-to-live for in-memory entries
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(5 * 60);

/// Per-query policy for the memory cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOptions {
    /// Age after which an entry is expired
    pub ttl: Duration,
    /// Serve expired entries while refreshing them in the background
    pub stale_while_revalidate: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_MEMORY_TTL,
            stale_while_revalidate: true,
        }
    }
}

impl MemoryOptions {
    /// Set the time-to-live
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enable or disable stale-while-revalidate
    pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }
}

/// Something that shows a key's data and wants to know when it changes
trait EntryListener<T>: Send + Sync {
    fn entry_replaced(&self, data: &T);
}

type Listeners<T> = HashMap<String, Vec<Weak<dyn EntryListener<T>>>, RandomState>;

struct MemoryInner<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>, RandomState>>,
    /// Query handles per key; dead ones are pruned on the next write
    listeners: Mutex<Listeners<T>>,
    tickets: WriteTickets,
    /// Keys with a background refresh in flight
    refreshing: Mutex<HashSet<String, RandomState>>,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

/// In-memory keyed cache
///
/// Cloning is cheap and clones share the same entries.
pub struct MemoryCache<T> {
    inner: Arc<MemoryInner<T>>,
}

impl<T> Clone for MemoryCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MemoryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("len", &self.inner.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl<T> Default for MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty cache on the system clock
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create an empty cache on the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                entries: Mutex::new(HashMap::with_hasher(RandomState::new())),
                listeners: Mutex::new(HashMap::with_hasher(RandomState::new())),
                tickets: WriteTickets::new(),
                refreshing: Mutex::new(HashSet::with_hasher(RandomState::new())),
                clock,
                stats: CacheStats::new(),
            }),
        }
    }

    /// Bind `key` and `fetcher` into a query handle
    ///
    /// Nothing is fetched until [`MemoryQuery::load`] or
    /// [`MemoryQuery::refetch`] runs.
    pub fn query<E, F, Fut>(
        &self,
        key: impl Into<String>,
        fetcher: F,
        options: MemoryOptions,
    ) -> MemoryQuery<T, E>
    where
        E: Clone + fmt::Display + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = Arc::new(QueryShared {
            key: key.into(),
            cache: self.clone(),
            fetcher: boxed_fetcher(fetcher),
            options,
            state: StateCell::new(),
        });

        let listener: Arc<dyn EntryListener<T>> = shared.clone();
        self.inner
            .listeners
            .lock()
            .entry(shared.key.clone())
            .or_default()
            .push(Arc::downgrade(&listener));

        MemoryQuery { shared }
    }

    /// Current entry for `key`, expired or not
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        self.inner.entries.lock().get(key).cloned()
    }

    /// Replace the entry for `key` with `data` stamped now
    ///
    /// Fetches for `key` already in flight will not overwrite it.
    pub fn insert(&self, key: &str, data: T) {
        let ticket = self.inner.tickets.issue(key);
        self.settle(key, ticket, data);
    }

    /// Drop the entry for `key` only
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().remove(key).is_some();
        if removed {
            self.inner.stats.record_eviction();
            debug!(key, "invalidated memory entry");
        }
        removed
    }

    /// Drop every entry
    pub fn clear_all(&self) {
        let mut entries = self.inner.entries.lock();
        self.inner.stats.record_evictions(entries.len() as u64);
        entries.clear();
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    /// Write `data` under `ticket` and tell every live handle on `key`
    ///
    /// Returns false, writing nothing, if a newer fetch for `key` started
    /// after this one.
    fn settle(&self, key: &str, ticket: u64, data: T) -> bool {
        let inner = &self.inner;
        let written = inner.tickets.settle(key, ticket, || {
            let entry = CacheEntry::new(key, data.clone(), inner.clock.now_millis());
            inner.entries.lock().insert(key.to_string(), entry);
            inner.stats.record_insert();
            self.notify(key, &data);
        });

        if !written {
            debug!(key, "dropping result of superseded fetch");
        }
        written
    }

    fn notify(&self, key: &str, data: &T) {
        let mut listeners = self.inner.listeners.lock();
        let Some(handles) = listeners.get_mut(key) else {
            return;
        };

        handles.retain(|handle| match handle.upgrade() {
            Some(listener) => {
                listener.entry_replaced(data);
                true
            }
            None => false,
        });
        if handles.is_empty() {
            listeners.remove(key);
        }
    }

    /// Returns true if this call claimed the refresh slot for `key`
    fn try_start_refresh(&self, key: &str) -> bool {
        self.inner.refreshing.lock().insert(key.to_string())
    }

    fn finish_refresh(&self, key: &str) {
        self.inner.refreshing.lock().remove(key);
    }
}

/// Releases a key's refresh slot even if the fetcher panics
struct RefreshGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: MemoryCache<T>,
    key: String,
}

impl<T> Drop for RefreshGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cache.finish_refresh(&self.key);
    }
}

struct QueryShared<T, E> {
    key: String,
    cache: MemoryCache<T>,
    fetcher: Fetcher<T, E>,
    options: MemoryOptions,
    state: StateCell<T, E>,
}

impl<T, E> EntryListener<T> for QueryShared<T, E>
where
    T: Clone + Send + Sync,
    E: Send + Sync,
{
    fn entry_replaced(&self, data: &T) {
        self.state.modify(|state| {
            state.data = Some(data.clone());
            state.error = None;
        });
    }
}

/// A key and fetcher bound to a [`MemoryCache`]
///
/// Handles on the same key see each other's results. Dropping every clone
/// of a handle detaches it; fetches it started still land in the cache.
pub struct MemoryQuery<T, E> {
    shared: Arc<QueryShared<T, E>>,
}

impl<T, E> Clone for MemoryQuery<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> fmt::Debug for MemoryQuery<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQuery")
            .field("key", &self.shared.key)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl<T, E> MemoryQuery<T, E>
where
    T: Clone + Send + Sync + 'static,
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

    /// Watch state changes, including background refresh results
    pub fn subscribe(&self) -> watch::Receiver<CacheState<T, E>> {
        self.shared.state.subscribe()
    }

    /// Serve from the cache when possible, fetch otherwise
    ///
    /// A usable entry is published immediately. If it is expired and
    /// stale-while-revalidate is on, one background refresh is spawned;
    /// its result shows up later through [`subscribe`](Self::subscribe).
    pub async fn load(&self) -> CacheState<T, E> {
        let shared = &self.shared;
        let options = shared.options;
        let now = shared.cache.now();

        match shared.cache.get(&shared.key) {
            Some(entry) if options.stale_while_revalidate || !entry.is_expired(now, options.ttl) => {
                shared.cache.stats().record_hit();
                let stale = entry.is_expired(now, options.ttl);
                debug!(key = %shared.key, stale, age = entry.age(now), "memory cache hit");

                shared.state.modify(|state| {
                    state.data = Some(entry.data);
                    state.is_loading = false;
                    state.error = None;
                });

                if stale {
                    self.revalidate();
                }
                self.state()
            }
            _ => {
                shared.cache.stats().record_miss();
                self.fetch().await
            }
        }
    }

    /// Fetch now, ignoring any cached entry
    pub async fn refetch(&self) -> CacheState<T, E> {
        self.fetch().await
    }

    /// Drop this key's entry
    pub fn invalidate(&self) -> bool {
        self.shared.cache.invalidate(&self.shared.key)
    }

    /// Drop every entry in the underlying cache
    pub fn clear_all(&self) {
        self.shared.cache.clear_all();
    }

    async fn fetch(&self) -> CacheState<T, E> {
        let shared = &self.shared;
        let generation = shared.state.begin();
        let ticket = shared.cache.inner.tickets.issue(&shared.key);
        shared.state.publish(generation, |state| state.is_loading = true);

        match (shared.fetcher)().await {
            Ok(data) => {
                // A current write has already published through entry_replaced
                let superseded = !shared.cache.settle(&shared.key, ticket, data.clone());
                shared.state.publish(generation, |state| {
                    if superseded && state.data.is_none() {
                        state.data = Some(data);
                    }
                    state.is_loading = false;
                    state.error = None;
                });
            }
            Err(err) => {
                CacheError::Fetch(err.clone()).report(&shared.key);
                let fallback = shared.cache.get(&shared.key).map(|entry| entry.data);
                shared.state.publish(generation, |state| {
                    state.data = fallback;
                    state.is_loading = false;
                    state.error = Some(err);
                });
            }
        }

        self.state()
    }

    fn revalidate(&self) {
        let shared = &self.shared;
        if !shared.cache.try_start_refresh(&shared.key) {
            debug!(key = %shared.key, "refresh already in flight");
            return;
        }
        shared.cache.stats().record_refresh();

        let ticket = shared.cache.inner.tickets.issue(&shared.key);
        let guard = RefreshGuard {
            cache: shared.cache.clone(),
            key: shared.key.clone(),
        };
        let fetch = (shared.fetcher)();

        tokio::spawn(async move {
            let result = fetch.await;
            let cache = &guard.cache;

            match result {
                Ok(data) => {
                    if cache.settle(&guard.key, ticket, data) {
                        debug!(key = %guard.key, "background refresh complete");
                    }
                }
                Err(err) => {
                    cache.stats().record_error();
                    CacheError::StaleRevalidate(err).report(&guard.key);
                }
            }
        });
    }
}
