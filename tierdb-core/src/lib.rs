//! TierDB Core - Embedded Leveled LSM Key-Value Engine
//!
//! A single-process storage engine exposed through a blocking call API:
//! - Group-committed writes ordered by sequence number
//! - Multi-version reads through snapshots and atomically swapped superversions
//! - Background flush and leveled compaction on dedicated thread pools
//! - Sharded LRU caching of table readers and decoded blocks
//!
//! # Architecture
//!
//! - **Write path**: writers queue in the write coordinator; the queue leader
//!   appends one group record to the WAL and applies it to the active memtable
//! - **Versions**: every flush or compaction is a `VersionEdit` logged to the
//!   MANIFEST and applied to produce a new immutable `Version`
//! - **Background work**: flushes turn immutable memtables into level-0 tables,
//!   compactions merge tables down the levels
//! - **Obsolete files**: tables and logs no live version references are purged
//!   outside the global lock

pub mod cache;
pub mod compaction;
pub mod db;
pub mod filename;
pub mod iterator;
pub mod log;
pub mod memtable;
pub mod options;
pub mod table;
pub mod version;

mod error;
mod get_context;
mod types;

pub use db::{ColumnFamilyHandle, Db, DbIterator, Snapshot, WriteBatch};
pub use error::{Result, TierError};
pub use options::{
    ColumnFamilyDescriptor, ColumnFamilyOptions, CompactRangeOptions, CompactionFilter,
    FilterDecision, FlushOptions, MergeOperator, Options, ReadOptions, WriteOptions,
};
pub use types::*;

/// TierDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Memtable size limit before it is switched out (4MB)
    pub const WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

    /// Active plus immutable memtables before writes stall
    pub const MAX_WRITE_BUFFER_NUMBER: usize = 2;

    /// Levels in the tree
    pub const NUM_LEVELS: usize = 7;

    /// Table block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// L0 files before compaction is triggered
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// L0 files before writes are slowed down
    pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 20;

    /// L0 files before writes are stopped
    pub const L0_STOP_WRITES_TRIGGER: usize = 24;

    /// Target size of level 1 (10MB)
    pub const MAX_BYTES_FOR_LEVEL_BASE: u64 = 10 * 1024 * 1024;

    /// Size ratio between levels
    pub const LEVEL_SIZE_RATIO: u64 = 10;

    /// Target table size at level 1 (2MB)
    pub const TARGET_FILE_SIZE_BASE: u64 = 2 * 1024 * 1024;

    /// Bloom filter bits per key
    pub const BLOOM_BITS_PER_KEY: usize = 10;

    /// Manifest size before rollover (64MB)
    pub const MAX_MANIFEST_FILE_SIZE: u64 = 64 * 1024 * 1024;

    /// Table readers held open by the table cache
    pub const MAX_OPEN_FILES: usize = 1000;

    /// Block cache capacity (8MB)
    pub const BLOCK_CACHE_CAPACITY: usize = 8 * 1024 * 1024;

    /// log2 of the default number of cache shards
    pub const CACHE_SHARD_BITS: u32 = 4;

    /// Minimum seconds between full obsolete-file directory scans
    pub const DELETE_OBSOLETE_FILES_PERIOD_SECS: u64 = 6 * 60 * 60;

    /// Largest write group in bytes
    pub const MAX_WRITE_GROUP_BYTES: usize = 1024 * 1024;

    /// Leader batches below this size only fold this much more data
    pub const SMALL_WRITE_GROUP_SLACK: usize = 128 * 1024;
}
