//! In-process store, mainly for tests and short-lived tools

use std::collections::HashMap;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::error::Result;
use crate::store::DurableStore;

/// [`DurableStore`] backed by a plain map; contents die with the value
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String, RandomState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}
