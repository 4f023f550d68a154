//! Request de-duplicating query cache
//!
//! [`QueryCache`] keeps two maps: finished results with their fetch time, and
//! fetches still in flight. Concurrent queries for the same key share a single
//! fetch; a fresh result short-circuits the fetch entirely.
//!
//! The cache is a service object: build one at startup and hand out clones.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::{self, Clock};
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::stats::CacheStats;

/// Default freshness window for query results
pub const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(5 * 60);

/// Per-call policy for [`QueryCache::query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// A result younger than this is served without fetching
    pub ttl: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_QUERY_TTL,
        }
    }
}

impl QueryOptions {
    /// Set the freshness window
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

type SharedFetch<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// An in-flight fetch and the registration id it was filed under
struct Pending<T, E> {
    id: u64,
    fetch: SharedFetch<T, E>,
}

struct QueryInner<T, E> {
    // Lock order: pending before results
    pending: Mutex<HashMap<String, Pending<T, E>, RandomState>>,
    results: Mutex<HashMap<String, CacheEntry<T>, RandomState>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl<T, E> QueryInner<T, E>
where
    T: Clone,
{
    /// Record the outcome of fetch `id` for `key`
    ///
    /// Successful results always land in the result map. The pending slot is
    /// only cleared if it still holds this fetch; an invalidate may already
    /// have dropped it and a newer fetch may have taken its place.
    fn settle(&self, key: &str, id: u64, result: &Result<T, E>) {
        let mut pending = self.pending.lock();

        if let Ok(data) = result {
            let entry = CacheEntry::new(key, data.clone(), self.clock.now_millis());
            self.results.lock().insert(key.to_string(), entry);
            self.stats.record_insert();
        }

        let released = Self::release(&mut pending, key, id);
        drop(pending);
        drop(released);
    }

    /// Free the pending slot of fetch `id`, which will never settle
    fn abandon(&self, key: &str, id: u64) {
        let mut pending = self.pending.lock();
        let released = Self::release(&mut pending, key, id);
        drop(pending);
        drop(released);
    }

    /// Take fetch `id` out of the pending map if it is still registered
    ///
    /// The caller drops the returned registration after unlocking; it may be
    /// the last handle on the shared future.
    fn release(
        pending: &mut HashMap<String, Pending<T, E>, RandomState>,
        key: &str,
        id: u64,
    ) -> Option<Pending<T, E>> {
        if pending.get(key).is_some_and(|p| p.id == id) {
            pending.remove(key)
        } else {
            None
        }
    }
}

/// Shared result cache with at most one in-flight fetch per key
pub struct QueryCache<T, E> {
    inner: Arc<QueryInner<T, E>>,
}

impl<T, E> Clone for QueryCache<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for QueryCache<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.pending.lock().len();
        let results = self.inner.results.lock().len();
        f.debug_struct("QueryCache")
            .field("results", &results)
            .field("pending", &pending)
            .finish_non_exhaustive()
    }
}

impl<T, E> Default for QueryCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> QueryCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Display + Send + Sync + 'static,
{
    /// Create an empty cache on the system clock
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create an empty cache on the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                pending: Mutex::new(HashMap::with_hasher(RandomState::new())),
                results: Mutex::new(HashMap::with_hasher(RandomState::new())),
                next_id: AtomicU64::new(0),
                clock,
                stats: CacheStats::new(),
            }),
        }
    }

    /// Resolve `key`, fetching at most once across concurrent callers
    ///
    /// # Arguments
    /// * `key` - Logical resource key
    /// * `fetcher` - Only invoked if there is neither a fresh result nor a
    ///   fetch already in flight
    /// * `options` - Freshness window
    ///
    /// # Returns
    /// * `Result<T, E>` - The fetched or cached value; every caller sharing a
    ///   failed fetch receives the same error
    pub async fn query<F, Fut>(&self, key: &str, fetcher: F, options: QueryOptions) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let fetch = {
            let mut pending = self.inner.pending.lock();

            let now = self.inner.clock.now_millis();
            if let Some(entry) = self.inner.results.lock().get(key) {
                if entry.is_fresh(now, options.ttl) {
                    self.inner.stats.record_hit();
                    debug!(key, age = entry.age(now), "query cache hit");
                    return Ok(entry.data.clone());
                }
            }

            match pending.get(key) {
                Some(existing) => {
                    self.inner.stats.record_deduplicated();
                    debug!(key, "joining in-flight fetch");
                    existing.fetch.clone()
                }
                None => {
                    self.inner.stats.record_miss();
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let fetch = self.start(key, id, fetcher);
                    pending.insert(
                        key.to_string(),
                        Pending {
                            id,
                            fetch: fetch.clone(),
                        },
                    );
                    fetch
                }
            }
        };

        fetch.await
    }

    fn start<F, Fut>(&self, key: &str, id: u64, fetcher: F) -> SharedFetch<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();

        // The fetcher runs on first poll, after the pending lock is released
        async move {
            let result = match AssertUnwindSafe(async move { fetcher().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => {
                    // A poisoned shared future must not stay joinable
                    warn!(key = %key, "fetcher panicked");
                    inner.abandon(&key, id);
                    panic::resume_unwind(payload);
                }
            };

            if let Err(e) = &result {
                CacheError::Fetch(e.clone()).report(&key);
            }
            inner.settle(&key, id, &result);
            result
        }
        .boxed()
        .shared()
    }

    /// Cached result for `key`, fresh or not
    pub fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
        self.inner.results.lock().get(key).cloned()
    }

    /// Check if a fetch for `key` is in flight
    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.lock().contains_key(key)
    }

    /// Forget the result and the in-flight registration for `key`
    ///
    /// An in-flight fetch is not cancelled; when it settles its result is
    /// still stored.
    pub fn invalidate(&self, key: &str) {
        let mut pending = self.inner.pending.lock();
        let released = pending.remove(key);
        if self.inner.results.lock().remove(key).is_some() {
            self.inner.stats.record_eviction();
        }
        drop(pending);
        drop(released);
        debug!(key, "invalidated query");
    }

    /// Forget every result and in-flight registration
    pub fn clear(&self) {
        let mut pending = self.inner.pending.lock();
        let released = std::mem::take(&mut *pending);
        let mut results = self.inner.results.lock();
        self.inner.stats.record_evictions(results.len() as u64);
        results.clear();
        drop(results);
        drop(pending);
        drop(released);
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.inner.results.lock().len()
    }

    /// Check if no results are stored
    pub fn is_empty(&self) -> bool {
        self.inner.results.lock().is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }
}
