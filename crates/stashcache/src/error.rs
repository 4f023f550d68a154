//! Failure taxonomy for the caches
//!
//! None of these reach a caller as an `Err`: fetch failures land in
//! [`CacheState::error`](crate::CacheState), the rest are logged and absorbed.

use std::convert::Infallible;
use std::fmt;

use tracing::{debug, warn};

/// A failure observed by a cache
#[derive(Debug)]
pub enum CacheError<E = Infallible> {
    /// A foreground fetch failed
    Fetch(E),

    /// The durable store could not be read or written
    Storage(stashdb::Error),

    /// A background refresh failed while stale data was being served
    StaleRevalidate(E),
}

impl<E: fmt::Display> CacheError<E> {
    /// Log the failure for `key` at the level its kind deserves
    pub fn report(&self, key: &str) {
        match self {
            CacheError::Fetch(e) => debug!(key, error = %e, "fetch failed"),
            CacheError::Storage(e) => warn!(key, error = %e, "cache storage failed, continuing without it"),
            CacheError::StaleRevalidate(e) => {
                warn!(key, error = %e, "background refresh failed, keeping stale data")
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for CacheError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Fetch(e) => write!(f, "Fetch failed: {}", e),
            CacheError::Storage(e) => write!(f, "Storage error: {}", e),
            CacheError::StaleRevalidate(e) => write!(f, "Background refresh failed: {}", e),
        }
    }
}

impl<E> std::error::Error for CacheError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Fetch(e) | CacheError::StaleRevalidate(e) => Some(e),
            CacheError::Storage(e) => Some(e),
        }
    }
}

impl<E> From<stashdb::Error> for CacheError<E> {
    fn from(err: stashdb::Error) -> Self {
        CacheError::Storage(err)
    }
}
