use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tierdb", about = "TierDB storage engine CLI", version)]
pub struct Cli {
    /// Database directory
    #[arg(short, long, default_value = "data")]
    pub database: PathBuf,

    /// JSON file with database options
    #[arg(short, long)]
    pub options: Option<PathBuf>,

    /// Column family to operate on
    #[arg(long, default_value = "default")]
    pub cf: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a value
    Put {
        key: String,
        value: String,
        /// Sync the WAL before returning
        #[arg(long)]
        sync: bool,
    },
    /// Print the value stored under a key
    Get { key: String },
    /// Delete a key
    Delete {
        key: String,
        #[arg(long)]
        sync: bool,
    },
    /// List keys in order
    Scan {
        /// First key to list
        #[arg(short, long)]
        start: Option<String>,
        /// Only list keys with this prefix
        #[arg(short, long)]
        prefix: Option<String>,
        /// Stop after this many entries
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,
    },
    /// Write the memtables to level 0
    Flush,
    /// Compact a key range (the whole keyspace by default)
    Compact {
        #[arg(long)]
        begin: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Move the result to this level
        #[arg(long)]
        target_level: Option<usize>,
    },
    /// Show engine properties
    Stats,
    /// Random write then read workload
    Bench {
        /// Number of keys to write
        #[arg(short = 'n', long, default_value = "100000")]
        num: usize,
        /// Value size in bytes
        #[arg(long, default_value = "100")]
        value_size: usize,
        /// Concurrent writer threads
        #[arg(short, long, default_value = "4")]
        threads: usize,
        /// Random point reads after the load
        #[arg(long, default_value = "10000")]
        reads: usize,
    },
}
