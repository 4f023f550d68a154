//! # stashdb
//!
//! Durable string key-value storage for the Stash caches.
//!
//! ## Design
//! - Append-only log with a small binary header
//! - Whole key space indexed in memory, replayed on open
//! - Basic operations: GET, SET, REMOVE, plus compaction
//! - 1 MB max value, 1 GB max log size

#![warn(missing_docs)]

mod error;
mod memory;
mod parser;
mod storage;
mod store;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use storage::FileStore;
pub use store::DurableStore;
