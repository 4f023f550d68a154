//! Stash CLI - caches command output in a durable store

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stashcache::DEFAULT_PREFIX;
use stashdb::FileStore;
use tracing::info;

use crate::commands::Runner;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short, long, env = "STASH_DATA", default_value = "./data")]
    data: PathBuf,

    /// Storage key prefix for cached entries
    #[arg(short, long, env = "STASH_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print cached output for KEY, running the command on a miss
    Fetch {
        /// Cache key
        #[arg(short, long)]
        key: String,

        /// Seconds before a cached result expires
        #[arg(short, long, default_value_t = 1800)]
        ttl: u64,

        /// Command and arguments, after `--`
        #[arg(required = true, last = true)]
        cmd: Vec<String>,
    },

    /// Print cached output for KEY without running anything
    Peek {
        /// Cache key
        #[arg(short, long)]
        key: String,

        /// Seconds before a cached result expires
        #[arg(short, long, default_value_t = 1800)]
        ttl: u64,
    },

    /// Drop the cached output for KEY
    Invalidate {
        /// Cache key
        #[arg(short, long)]
        key: String,
    },

    /// Drop every cached entry under the prefix
    Clear,

    /// Rewrite the log file without dead records
    Compact,

    /// Show store statistics
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!("Stash v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", args.data.display());

    let store = FileStore::open(&args.data)
        .with_context(|| format!("Failed to open store at {}", args.data.display()))?;

    let runner = Runner::new(Arc::new(store), &args.prefix);
    let output = runner.run(args.command).await?;
    print!("{}", output);

    Ok(())
}
