//! Subcommand execution

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use stashcache::{Clock, PersistentCache, PersistentOptions, SystemClock};
use stashdb::FileStore;
use tokio::process::Command as Process;
use tracing::{debug, info};

use crate::Command;

/// Why a cached command could not produce output
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    /// The process could not be started
    Spawn(String),

    /// The process exited unsuccessfully
    Failed {
        /// Exit code, if it exited normally
        status: Option<i32>,
        /// Captured stderr
        stderr: String,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn(msg) => write!(f, "failed to start command: {}", msg),
            CommandError::Failed {
                status: Some(code),
                stderr,
            } => write!(f, "command exited with status {}: {}", code, stderr.trim_end()),
            CommandError::Failed { status: None, stderr } => {
                write!(f, "command terminated by signal: {}", stderr.trim_end())
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// Run `argv` and capture its stdout
async fn run_command(argv: &[String]) -> Result<String, CommandError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CommandError::Spawn("empty command".to_string()))?;

    debug!(program = %program, "running command");
    let output = Process::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError::Spawn(e.to_string()))?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Serialize)]
struct EntryReport {
    key: String,
    age_ms: Option<u64>,
    bytes: usize,
}

#[derive(Debug, Serialize)]
struct StatsReport {
    path: String,
    log_bytes: u64,
    keys: usize,
    entries: Vec<EntryReport>,
}

/// Executes subcommands against one store
pub struct Runner {
    store: Arc<FileStore>,
    cache: PersistentCache<Arc<FileStore>>,
    prefix: String,
}

impl Runner {
    pub fn new(store: Arc<FileStore>, prefix: &str) -> Self {
        let cache = PersistentCache::builder(Arc::clone(&store))
            .prefix(prefix)
            .build();

        Self {
            store,
            cache,
            prefix: prefix.to_string(),
        }
    }

    /// Run one subcommand, returning what should go to stdout
    pub async fn run(&self, command: Command) -> Result<String> {
        match command {
            Command::Fetch { key, ttl, cmd } => self.fetch(key, ttl, cmd).await,
            Command::Peek { key, ttl } => self.peek(&key, ttl),
            Command::Invalidate { key } => self.invalidate(&key),
            Command::Clear => self.clear(),
            Command::Compact => self.compact(),
            Command::Stats { json } => self.stats(json),
        }
    }

    async fn fetch(&self, key: String, ttl: u64, cmd: Vec<String>) -> Result<String> {
        let argv = Arc::new(cmd);
        let options = PersistentOptions::default().with_ttl(Duration::from_secs(ttl));

        let query = self.cache.query(
            key.clone(),
            move || {
                let argv = Arc::clone(&argv);
                async move { run_command(&argv).await }
            },
            options,
        );

        let hits_before = self.cache.stats().hits();
        let state = query.load().await;
        let hit = self.cache.stats().hits() > hits_before;
        info!(key = %key, hit, "fetch complete");

        match (state.data, state.error) {
            (_, Some(err)) => Err(err).with_context(|| format!("Failed to fetch '{}'", key)),
            (Some(data), None) => Ok(data),
            (None, None) => bail!("No output for '{}'", key),
        }
    }

    fn peek(&self, key: &str, ttl: u64) -> Result<String> {
        match self.cache.read::<String>(key, Duration::from_secs(ttl)) {
            Some(entry) => Ok(entry.data),
            None => bail!("No fresh entry for '{}'", key),
        }
    }

    fn invalidate(&self, key: &str) -> Result<String> {
        self.cache.clear_cache(key);
        Ok("OK\n".to_string())
    }

    fn prefixed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&self.prefix))
            .collect();
        keys.sort();
        keys
    }

    fn clear(&self) -> Result<String> {
        let keys = self.prefixed_keys();
        for storage_key in &keys {
            self.store
                .remove(storage_key)
                .with_context(|| format!("Failed to remove '{}'", storage_key))?;
        }
        info!(removed = keys.len(), "cleared cache entries");
        Ok(format!("Removed {} entries\n", keys.len()))
    }

    fn compact(&self) -> Result<String> {
        let reclaimed = self.store.compact().context("Failed to compact store")?;
        Ok(format!("Reclaimed {} bytes\n", reclaimed))
    }

    fn stats(&self, json: bool) -> Result<String> {
        let now = SystemClock.now_millis();

        let entries = self
            .prefixed_keys()
            .into_iter()
            .map(|storage_key| -> stashdb::Result<EntryReport> {
                let raw = self.store.get(&storage_key)?.unwrap_or_default();
                let age_ms = serde_json::from_str::<serde_json::Value>(&raw)
                    .ok()
                    .and_then(|v| v.get("timestamp").and_then(|t| t.as_u64()))
                    .map(|ts| now.saturating_sub(ts));
                Ok(EntryReport {
                    key: storage_key[self.prefix.len()..].to_string(),
                    age_ms,
                    bytes: raw.len(),
                })
            })
            .collect::<stashdb::Result<Vec<_>>>()
            .context("Failed to read store")?;

        let report = StatsReport {
            path: self.store.path().display().to_string(),
            log_bytes: self.store.log_size(),
            keys: self.store.len(),
            entries,
        };

        if json {
            return Ok(serde_json::to_string_pretty(&report)? + "\n");
        }

        let mut out = format!(
            "# Store\npath:{}\nlog_bytes:{}\nkeys:{}\n\n# Entries\n",
            report.path, report.log_bytes, report.keys
        );
        for entry in &report.entries {
            let age = entry
                .age_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "unreadable".to_string());
            out.push_str(&format!("{} age:{} bytes:{}\n", entry.key, age, entry.bytes));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(dir: &TempDir) -> Runner {
        let store = FileStore::open(dir.path()).unwrap();
        Runner::new(Arc::new(store), "cache_")
    }

    fn echo(key: &str, text: &str) -> Command {
        Command::Fetch {
            key: key.to_string(),
            ttl: 60,
            cmd: vec!["echo".to_string(), text.to_string()],
        }
    }

    #[tokio::test]
    async fn test_fetch_caches_output() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);

        assert_eq!(runner.run(echo("greeting", "hello")).await.unwrap(), "hello\n");

        // Second fetch is served from the store, the new command never runs
        assert_eq!(runner.run(echo("greeting", "changed")).await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_fetch_survives_restart() {
        let dir = TempDir::new().unwrap();
        runner(&dir).run(echo("k", "persisted")).await.unwrap();

        let runner = runner(&dir);
        let out = runner
            .run(Command::Peek {
                key: "k".to_string(),
                ttl: 60,
            })
            .await
            .unwrap();
        assert_eq!(out, "persisted\n");
    }

    #[tokio::test]
    async fn test_failed_command_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);

        let failing = Command::Fetch {
            key: "k".to_string(),
            ttl: 60,
            cmd: vec!["false".to_string()],
        };
        let err = runner.run(failing).await.unwrap_err();
        assert!(err.to_string().contains("Failed to fetch 'k'"));

        let peek = runner
            .run(Command::Peek {
                key: "k".to_string(),
                ttl: 60,
            })
            .await;
        assert!(peek.is_err());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = run_command(&["definitely-not-a-real-binary-xyz".to_string()]).await;
        assert!(matches!(result, Err(CommandError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);

        runner.run(echo("a", "1")).await.unwrap();
        runner.run(echo("b", "2")).await.unwrap();
        runner.store.set("unrelated", "kept").unwrap();

        runner
            .run(Command::Invalidate {
                key: "a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(runner.prefixed_keys(), vec!["cache_b".to_string()]);

        let out = runner.run(Command::Clear).await.unwrap();
        assert_eq!(out, "Removed 1 entries\n");
        assert_eq!(runner.store.get("unrelated").unwrap().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_stats_json() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);

        runner.run(echo("a", "1")).await.unwrap();
        runner.store.set("cache_broken", "not json").unwrap();

        let out = runner.run(Command::Stats { json: true }).await.unwrap();
        let report: serde_json::Value = serde_json::from_str(&out).unwrap();

        assert_eq!(report["keys"], 2);
        assert_eq!(report["entries"][0]["key"], "a");
        assert!(report["entries"][0]["age_ms"].is_u64());
        assert_eq!(report["entries"][1]["key"], "broken");
        assert!(report["entries"][1]["age_ms"].is_null());
    }

    #[tokio::test]
    async fn test_compact() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);

        for _ in 0..5 {
            runner.run(echo("k", "x")).await.unwrap();
            runner
                .run(Command::Invalidate {
                    key: "k".to_string(),
                })
                .await
                .unwrap();
        }

        let out = runner.run(Command::Compact).await.unwrap();
        assert!(out.starts_with("Reclaimed "));
        assert!(runner.store.is_empty());
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::Failed {
            status: Some(2),
            stderr: "no such file\n".to_string(),
        };
        assert_eq!(err.to_string(), "command exited with status 2: no such file");
    }
}
