//! Log-structured storage engine
//!
//! File layout:
//! - `stash.log`: header + append-only set/remove records
//!
//! The whole key space is held in memory; the log is replayed on open and
//! rewritten by [`FileStore::compact`].

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::parser::{
    create_header, parse_header, parse_record, Record, FORMAT_VERSION, HEADER_LEN, STASH_MAGIC,
};
use crate::store::DurableStore;

/// Maximum value size (1 MB)
const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum log size (1 GB)
const MAX_LOG_SIZE: u64 = 1024 * 1024 * 1024;

/// Log file name inside the store directory
const LOG_FILE: &str = "stash.log";

/// Writer-side state, guarded by a single lock so appends stay ordered
struct LogWriter {
    file: File,
    size: u64,
    records: u32,
}

/// FileStore is a durable string key-value store on local disk
pub struct FileStore {
    /// Path to the store directory
    path: PathBuf,

    /// Log file handle and bookkeeping
    log: Mutex<LogWriter>,

    /// In-memory index: key -> current value
    index: RwLock<HashMap<String, String, RandomState>>,

    /// Is the store closed?
    closed: RwLock<bool>,
}

impl FileStore {
    /// Open or create a store at the given directory
    ///
    /// # Arguments
    /// * `path` - Directory path for the log file
    ///
    /// # Returns
    /// * `Result<FileStore>` - Store handle
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let log_path = path.join(LOG_FILE);

        let (writer, index) = if log_path.exists() {
            Self::open_existing(&log_path)?
        } else {
            Self::create_new(&log_path)?
        };

        info!(
            path = %log_path.display(),
            keys = index.len(),
            "opened stash log"
        );

        Ok(FileStore {
            path: path.to_path_buf(),
            log: Mutex::new(writer),
            index: RwLock::new(index),
            closed: RwLock::new(false),
        })
    }

    fn open_existing(log_path: &Path) -> Result<(LogWriter, HashMap<String, String, RandomState>)> {
        let mut file = OpenOptions::new().read(true).write(true).open(log_path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        parse_header(&contents)?;

        let mut index = HashMap::with_hasher(RandomState::new());
        let mut input = &contents[HEADER_LEN..];
        let mut records = 0u32;

        while !input.is_empty() {
            let (rest, raw) = match parse_record(input) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Torn tail from an interrupted append; keep what replayed cleanly
                    warn!(
                        offset = contents.len() - input.len(),
                        error = ?e,
                        "truncating unreadable tail of stash log"
                    );
                    break;
                }
            };

            match Record::decode(raw)? {
                Record::Set { key, value } => {
                    index.insert(key, value);
                }
                Record::Remove { key } => {
                    index.remove(&key);
                }
            }
            records += 1;
            input = rest;
        }

        let size = (contents.len() - input.len()) as u64;
        if !input.is_empty() {
            file.set_len(size)?;
        }
        file.seek(SeekFrom::Start(size))?;

        debug!(records, keys = index.len(), "replayed stash log");

        Ok((LogWriter { file, size, records }, index))
    }

    fn create_new(log_path: &Path) -> Result<(LogWriter, HashMap<String, String, RandomState>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path)?;

        let header = create_header(FORMAT_VERSION, 0);
        file.write_all(&header)?;

        let writer = LogWriter {
            file,
            size: header.len() as u64,
            records: 0,
        };

        Ok((writer, HashMap::with_hasher(RandomState::new())))
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.read() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn append(log: &mut LogWriter, record: &Record) -> Result<()> {
        let line = record.encode();

        if log.size + line.len() as u64 > MAX_LOG_SIZE {
            return Err(Error::StoreFull(log.size));
        }

        log.file.write_all(&line)?;
        log.size += line.len() as u64;
        log.records = log.records.saturating_add(1);

        Ok(())
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.index.read().get(key).cloned())
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;

        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(value.len()));
        }

        // Lock order: index, then log. Both are held so the index always
        // matches the last record appended for a key.
        let mut index = self.index.write();
        let mut log = self.log.lock();
        Self::append(
            &mut log,
            &Record::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
        )?;
        index.insert(key.to_string(), value.to_string());

        Ok(())
    }

    /// Remove `key`; removing an absent key is a no-op
    pub fn remove(&self, key: &str) -> Result<()> {
        self.ensure_open()?;

        let mut index = self.index.write();
        if !index.contains_key(key) {
            return Ok(());
        }

        let mut log = self.log.lock();
        Self::append(
            &mut log,
            &Record::Remove {
                key: key.to_string(),
            },
        )?;
        index.remove(key);

        Ok(())
    }

    /// All live keys, in no particular order
    pub fn keys(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    /// Get the number of live keys
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Current size of the log file in bytes
    pub fn log_size(&self) -> u64 {
        self.log.lock().size
    }

    /// Directory holding the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove every key
    ///
    /// The index is only emptied once the empty log is on disk.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;

        let mut index = self.index.write();
        let mut log = self.log.lock();
        self.rewrite(&mut log, &HashMap::with_hasher(RandomState::new()))?;
        index.clear();

        Ok(())
    }

    /// Rewrite the log so it only holds live keys
    ///
    /// # Returns
    /// * `Result<u64>` - Bytes reclaimed
    pub fn compact(&self) -> Result<u64> {
        self.ensure_open()?;

        let index = self.index.read();
        let mut log = self.log.lock();
        let before = log.size;
        self.rewrite(&mut log, &index)?;
        let after = log.size;

        info!(before, after, "compacted stash log");
        Ok(before.saturating_sub(after))
    }

    /// Replace the log with one holding exactly `live`
    fn rewrite(&self, log: &mut LogWriter, live: &HashMap<String, String, RandomState>) -> Result<()> {
        let tmp_path = self.path.join(format!("{}.tmp", LOG_FILE));
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let count = live.len() as u32;
        let mut size = HEADER_LEN as u64;
        tmp.write_all(&create_header(FORMAT_VERSION, count))?;

        for (key, value) in live.iter() {
            let line = Record::Set {
                key: key.clone(),
                value: value.clone(),
            }
            .encode();
            tmp.write_all(&line)?;
            size += line.len() as u64;
        }
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, self.path.join(LOG_FILE))?;
        tmp.seek(SeekFrom::End(0))?;

        *log = LogWriter {
            file: tmp,
            size,
            records: count,
        };

        Ok(())
    }

    /// Close the store and fsync all changes
    pub fn close(&mut self) -> Result<()> {
        if *self.closed.read() {
            return Ok(());
        }

        let mut log = self.log.lock();
        let records = log.records;

        // Record count lives right after the magic and version
        log.file
            .seek(SeekFrom::Start(STASH_MAGIC.len() as u64 + 4))?;
        log.file.write_all(&records.to_le_bytes())?;
        log.file.sync_all()?;
        let end = log.size;
        log.file.seek(SeekFrom::Start(end))?;

        *self.closed.write() = true;

        Ok(())
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        FileStore::get(self, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        FileStore::set(self, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        FileStore::remove(self, key)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        assert_eq!(store.len(), 0);
        assert!(store.is_empty());

        store.close().unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_set_and_get() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("cache_user", r#"{"data":{"a":1},"timestamp":0}"#).unwrap();

        assert_eq!(
            store.get("cache_user").unwrap().as_deref(),
            Some(r#"{"data":{"a":1},"timestamp":0}"#)
        );
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_overwrite_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("k", "one").unwrap();
        store.set("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
        assert_eq!(store.len(), 1);

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        // Absent keys are fine to remove
        store.remove("k").unwrap();
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.set("a", "1").unwrap();
            store.set("b", "multi\nline\tvalue").unwrap();
            store.set("c", "3").unwrap();
            store.remove("c").unwrap();
            store.close().unwrap();
        }

        {
            let store = FileStore::open(dir.path()).unwrap();
            assert_eq!(store.len(), 2);
            assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
            assert_eq!(store.get("b").unwrap().as_deref(), Some("multi\nline\tvalue"));
            assert_eq!(store.get("c").unwrap(), None);
        }
    }

    #[test]
    fn test_persistence_without_close() {
        let dir = TempDir::new().unwrap();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("a", "1").unwrap();
            // Dropped without an explicit close
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.set("a", "1").unwrap();
            store.close().unwrap();
        }

        let log_path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(b"S\tb\thalf-writ").unwrap();
        drop(file);

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").unwrap(), None);

        // Appends after recovery land on a clean record boundary
        store.set("b", "2").unwrap();
        drop(store);

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_invalid_magic() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOG_FILE), b"NOTSTASH\0\0\0\0\0\0\0\0").unwrap();

        assert!(matches!(FileStore::open(dir.path()), Err(Error::Parse(_))));
    }

    #[test]
    fn test_value_too_large() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let large = "x".repeat(MAX_VALUE_SIZE + 1);
        assert!(matches!(store.set("k", &large), Err(Error::ValueTooLarge(_))));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_compact() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        for i in 0..50 {
            store.set("hot", &format!("value {}", i)).unwrap();
        }
        store.set("cold", "kept").unwrap();

        let reclaimed = store.compact().unwrap();
        assert!(reclaimed > 0);
        assert_eq!(store.get("hot").unwrap().as_deref(), Some("value 49"));

        store.set("after", "compaction").unwrap();
        drop(store);

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.get("cold").unwrap().as_deref(), Some("kept"));
        assert_eq!(store.get("after").unwrap().as_deref(), Some("compaction"));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.clear().unwrap();

        assert!(store.is_empty());
        drop(store);

        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_clear_keeps_index() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("a", "1").unwrap();

        // A directory where the rewrite wants its temp file makes clear fail
        std::fs::create_dir(dir.path().join("stash.log.tmp")).unwrap();

        assert!(store.clear().is_err());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_concurrent_writers_agree_with_log() {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        store.set("k", &format!("{}-{}", t, i)).unwrap();
                        if i % 10 == 0 {
                            store.remove("gone").unwrap();
                            store.set("gone", "x").unwrap();
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let live_k = store.get("k").unwrap();
        let live_gone = store.get("gone").unwrap();
        drop(store);

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("k").unwrap(), live_k);
        assert_eq!(store.get("gone").unwrap(), live_gone);
    }

    #[test]
    fn test_close_twice() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        store.close().unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_set_after_close() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        store.close().unwrap();

        assert!(matches!(store.set("k", "v"), Err(Error::Closed)));
        assert!(matches!(store.get("k"), Err(Error::Closed)));
    }
}
