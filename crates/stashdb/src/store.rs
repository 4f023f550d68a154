//! Durable string key-value store abstraction

use std::sync::Arc;

use crate::error::Result;

/// A string-keyed, string-valued store that outlives the process
///
/// Implementations make no transactional promises; callers serialize their
/// own values and treat every error as recoverable.
pub trait DurableStore: Send + Sync {
    /// Value stored under `key`, or `None` if absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; absent keys are not an error
    fn remove(&self, key: &str) -> Result<()>;
}

impl<S: DurableStore + ?Sized> DurableStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}
