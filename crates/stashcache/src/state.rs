//! Consumer-facing query state and fetcher plumbing

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;

/// What a consumer sees for one cached query
#[derive(Debug, Clone, PartialEq)]
pub struct CacheState<T, E> {
    /// Latest value, `None` until the first hit or successful fetch
    pub data: Option<T>,
    /// A foreground fetch is in flight
    pub is_loading: bool,
    /// Error from the last foreground fetch, if it failed
    pub error: Option<E>,
}

impl<T, E> Default for CacheState<T, E> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            error: None,
        }
    }
}

/// A stored, re-invokable fetcher
pub type Fetcher<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

pub(crate) fn boxed_fetcher<T, E, F, Fut>(fetcher: F) -> Fetcher<T, E>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move || fetcher().boxed())
}

/// Exposed state of a query handle plus its fetch generation
///
/// Every fetch takes a new generation when it starts and may only publish
/// while that generation is still the newest.
pub(crate) struct StateCell<T, E> {
    tx: watch::Sender<CacheState<T, E>>,
    generation: Mutex<u64>,
}

impl<T, E> StateCell<T, E> {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(CacheState::default());
        Self {
            tx,
            generation: Mutex::new(0),
        }
    }

    /// Start a new generation, superseding every fetch started before it
    pub(crate) fn begin(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        *generation
    }

    /// Apply `update` only if no newer generation has started
    pub(crate) fn publish(&self, generation: u64, update: impl FnOnce(&mut CacheState<T, E>)) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.tx.send_modify(update);
        true
    }

    /// Apply `update` regardless of generation
    pub(crate) fn modify(&self, update: impl FnOnce(&mut CacheState<T, E>)) {
        let _current = self.generation.lock();
        self.tx.send_modify(update);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<CacheState<T, E>> {
        self.tx.subscribe()
    }
}

impl<T: Clone, E: Clone> StateCell<T, E> {
    pub(crate) fn snapshot(&self) -> CacheState<T, E> {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_generation_wins() {
        let cell: StateCell<u32, String> = StateCell::new();

        let first = cell.begin();
        let second = cell.begin();

        assert!(cell.publish(second, |s| s.data = Some(2)));
        assert!(!cell.publish(first, |s| s.data = Some(1)));
        assert_eq!(cell.snapshot().data, Some(2));
    }

    #[test]
    fn test_subscribers_see_updates() {
        let cell: StateCell<u32, String> = StateCell::new();
        let mut rx = cell.subscribe();

        cell.modify(|s| s.is_loading = true);

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_loading);
    }

    #[tokio::test]
    async fn test_boxed_fetcher_is_reusable() {
        let fetcher: Fetcher<u32, String> = boxed_fetcher(|| async { Ok(7) });

        assert_eq!(fetcher().await, Ok(7));
        assert_eq!(fetcher().await, Ok(7));
    }
}
