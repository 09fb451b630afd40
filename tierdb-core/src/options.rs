//! Database, column family, read and write options

use crate::cache::MAX_SHARD_BITS;
use crate::types::SequenceNumber;
use crate::{Result, TierError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of storage paths addressable by the 2-bit path id
pub const MAX_DB_PATHS: usize = 4;

/// Combines merge operands with an optional base value.
pub trait MergeOperator: Send + Sync {
    /// Name recorded in logs
    fn name(&self) -> &str;

    /// Merge `operands` (oldest first) on top of `existing`.
    ///
    /// Returning `None` reports the merge as failed; the read surfaces corruption.
    fn full_merge(&self, key: &[u8], existing: Option<&[u8]>, operands: &[Vec<u8>]) -> Option<Vec<u8>>;
}

impl fmt::Debug for dyn MergeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergeOperator({})", self.name())
    }
}

/// Decision returned by a compaction filter for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Keep the entry unchanged
    Keep,
    /// Drop the entry (it is rewritten as a deletion)
    Remove,
    /// Keep the key with a replacement value
    ChangeValue(Vec<u8>),
}

/// User hook consulted for every put entry that no snapshot can still see.
pub trait CompactionFilter: Send + Sync {
    /// Name recorded in logs
    fn name(&self) -> &str;

    /// Decide what happens to `key`/`value` while compacting into `level`
    fn filter(&self, level: usize, key: &[u8], value: &[u8]) -> FilterDecision;
}

impl fmt::Debug for dyn CompactionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompactionFilter({})", self.name())
    }
}

/// Per column family configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnFamilyOptions {
    /// Memtable size in bytes before it is switched out
    pub write_buffer_size: usize,
    /// Active plus immutable memtables allowed before writes stall.
    ///
    /// Reaching it blocks writers until a flush finishes. It never adds a
    /// per-write delay.
    pub max_write_buffer_number: usize,
    /// Number of levels in the tree
    pub num_levels: usize,
    /// L0 file count that makes L0 eligible for compaction
    pub level0_file_num_compaction_trigger: usize,
    /// L0 file count at which writes start being delayed.
    ///
    /// The delay is driven by the number of level-0 files, not by the
    /// immutable memtable count. It ramps up from this count to its maximum
    /// at `level0_stop_writes_trigger` (see [`crate::db::slowdown_amount`]).
    pub level0_slowdown_writes_trigger: usize,
    /// L0 file count at which writes stop until compaction catches up
    pub level0_stop_writes_trigger: usize,
    /// Target total size of level 1
    pub max_bytes_for_level_base: u64,
    /// Size ratio between consecutive levels
    pub max_bytes_for_level_multiplier: u64,
    /// Target table size at level 1
    pub target_file_size_base: u64,
    /// Table size ratio between consecutive levels
    pub target_file_size_multiplier: u64,
    /// Table data block size in bytes
    pub block_size: usize,
    /// Bloom filter bits per key (0 disables the filter)
    pub bloom_bits_per_key: usize,
    /// Never schedule automatic compactions for this family
    pub disable_auto_compactions: bool,
    /// Merge operator for `merge` writes
    #[serde(skip)]
    pub merge_operator: Option<Arc<dyn MergeOperator>>,
    /// Compaction filter consulted while rewriting tables
    #[serde(skip)]
    pub compaction_filter: Option<Arc<dyn CompactionFilter>>,
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: crate::config::WRITE_BUFFER_SIZE,
            max_write_buffer_number: crate::config::MAX_WRITE_BUFFER_NUMBER,
            num_levels: crate::config::NUM_LEVELS,
            level0_file_num_compaction_trigger: crate::config::L0_COMPACTION_TRIGGER,
            level0_slowdown_writes_trigger: crate::config::L0_SLOWDOWN_WRITES_TRIGGER,
            level0_stop_writes_trigger: crate::config::L0_STOP_WRITES_TRIGGER,
            max_bytes_for_level_base: crate::config::MAX_BYTES_FOR_LEVEL_BASE,
            max_bytes_for_level_multiplier: crate::config::LEVEL_SIZE_RATIO,
            target_file_size_base: crate::config::TARGET_FILE_SIZE_BASE,
            target_file_size_multiplier: 1,
            block_size: crate::config::BLOCK_SIZE,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
            disable_auto_compactions: false,
            merge_operator: None,
            compaction_filter: None,
        }
    }
}

impl ColumnFamilyOptions {
    /// Target total bytes for `level` (level 0 is governed by file count instead)
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut bytes = self.max_bytes_for_level_base;
        for _ in 1..level.max(1) {
            bytes = bytes.saturating_mul(self.max_bytes_for_level_multiplier);
        }
        bytes
    }

    /// Output table size limit for compactions into `level`
    pub fn max_file_size_for_level(&self, level: usize) -> u64 {
        let mut size = self.target_file_size_base;
        for _ in 1..level.max(1) {
            size = size.saturating_mul(self.target_file_size_multiplier);
        }
        size
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.num_levels < 2 {
            return Err(TierError::InvalidArgument(
                "num_levels must be at least 2".into(),
            ));
        }
        if self.max_write_buffer_number < 2 {
            return Err(TierError::InvalidArgument(
                "max_write_buffer_number must be at least 2".into(),
            ));
        }
        if self.level0_slowdown_writes_trigger < self.level0_file_num_compaction_trigger
            || self.level0_stop_writes_trigger < self.level0_slowdown_writes_trigger
        {
            return Err(TierError::InvalidArgument(
                "level0 triggers must satisfy compaction <= slowdown <= stop".into(),
            ));
        }
        if self.write_buffer_size == 0 || self.block_size == 0 {
            return Err(TierError::InvalidArgument(
                "write_buffer_size and block_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Create the database directory and manifest when absent
    pub create_if_missing: bool,
    /// Fail `open` when a database already exists
    pub error_if_exists: bool,
    /// Latch background errors and verify log checksums strictly
    pub paranoid_checks: bool,
    /// Threads in the high-priority flush pool (0 runs flushes in the compaction pool)
    pub max_background_flushes: usize,
    /// Threads in the compaction pool
    pub max_background_compactions: usize,
    /// Minimum interval between full directory scans for obsolete files
    pub delete_obsolete_files_period: Duration,
    /// Manifest size that triggers a rollover into a fresh snapshot
    pub max_manifest_file_size: u64,
    /// Table readers kept in the table cache (`None` pins every reader)
    pub max_open_files: Option<usize>,
    /// Block cache capacity in bytes
    pub block_cache_capacity: usize,
    /// log2 of the number of block cache shards
    pub block_cache_shard_bits: u32,
    /// log2 of the number of table cache shards
    pub table_cache_shard_bits: u32,
    /// Extra storage paths for table files, addressed by path id
    pub db_paths: Vec<PathBuf>,
    /// Options for the default column family
    pub column_family: ColumnFamilyOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: true,
            max_background_flushes: 1,
            max_background_compactions: 1,
            delete_obsolete_files_period: Duration::from_secs(
                crate::config::DELETE_OBSOLETE_FILES_PERIOD_SECS,
            ),
            max_manifest_file_size: crate::config::MAX_MANIFEST_FILE_SIZE,
            max_open_files: Some(crate::config::MAX_OPEN_FILES),
            block_cache_capacity: crate::config::BLOCK_CACHE_CAPACITY,
            block_cache_shard_bits: crate::config::CACHE_SHARD_BITS,
            table_cache_shard_bits: crate::config::CACHE_SHARD_BITS,
            db_paths: Vec::new(),
            column_family: ColumnFamilyOptions::default(),
        }
    }
}

impl Options {
    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.db_paths.len() > MAX_DB_PATHS {
            return Err(TierError::InvalidArgument(format!(
                "at most {} db_paths are supported",
                MAX_DB_PATHS
            )));
        }
        if self.max_background_compactions == 0 {
            return Err(TierError::InvalidArgument(
                "max_background_compactions must be at least 1".into(),
            ));
        }
        if self.block_cache_shard_bits > MAX_SHARD_BITS
            || self.table_cache_shard_bits > MAX_SHARD_BITS
        {
            return Err(TierError::InvalidArgument(format!(
                "cache shard bits must be at most {}",
                MAX_SHARD_BITS
            )));
        }
        self.column_family.validate()
    }
}

/// A named column family and its options, as passed to `open`
#[derive(Debug, Clone)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub options: ColumnFamilyOptions,
}

impl ColumnFamilyDescriptor {
    /// Create a new descriptor
    pub fn new(name: impl Into<String>, options: ColumnFamilyOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// Options for reads
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Read as of this sequence number instead of the latest one
    pub snapshot: Option<SequenceNumber>,
    /// Verify block checksums on every read
    pub verify_checksums: bool,
    /// Insert blocks read by this call into the block cache
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            verify_checksums: true,
            fill_cache: true,
        }
    }
}

impl ReadOptions {
    /// Read as of `snapshot`
    pub fn with_snapshot(mut self, snapshot: &crate::db::Snapshot) -> Self {
        self.snapshot = Some(snapshot.sequence());
        self
    }
}

/// Options for writes
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Sync the WAL before acknowledging the write
    pub sync: bool,
    /// Skip the WAL entirely (data is lost on crash until flushed)
    pub disable_wal: bool,
    /// Give up with `Timeout` if the write has not started before this elapses
    pub timeout: Option<Duration>,
}

/// Options for manual flushes
#[derive(Debug, Clone)]
pub struct FlushOptions {
    /// Block until the flush has been committed
    pub wait: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self { wait: true }
    }
}

/// Options for manual range compactions
#[derive(Debug, Clone, Default)]
pub struct CompactRangeOptions {
    /// Move the compacted files to `target_level` afterwards
    pub change_level: bool,
    /// Level to move to when `change_level` is set (`None` = lowest fitting level)
    pub target_level: Option<usize>,
    /// Storage path for compaction outputs
    pub target_path_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_targets() {
        let opts = ColumnFamilyOptions {
            max_bytes_for_level_base: 100,
            max_bytes_for_level_multiplier: 10,
            target_file_size_base: 8,
            target_file_size_multiplier: 2,
            ..Default::default()
        };
        assert_eq!(opts.max_bytes_for_level(1), 100);
        assert_eq!(opts.max_bytes_for_level(2), 1_000);
        assert_eq!(opts.max_bytes_for_level(3), 10_000);
        assert_eq!(opts.max_file_size_for_level(1), 8);
        assert_eq!(opts.max_file_size_for_level(3), 32);
    }

    #[test]
    fn test_validate() {
        assert!(Options::default().validate().is_ok());

        let mut opts = Options::default();
        opts.column_family.level0_stop_writes_trigger = 1;
        assert!(matches!(opts.validate(), Err(TierError::InvalidArgument(_))));

        let mut opts = Options::default();
        opts.db_paths = vec![PathBuf::from("p"); 5];
        assert!(opts.validate().is_err());

        let mut opts = Options::default();
        opts.block_cache_shard_bits = MAX_SHARD_BITS;
        assert!(opts.validate().is_ok());
        opts.table_cache_shard_bits = MAX_SHARD_BITS + 1;
        assert!(matches!(opts.validate(), Err(TierError::InvalidArgument(_))));
    }

    #[test]
    fn test_options_json_roundtrip() {
        let mut opts = Options::default();
        opts.column_family.write_buffer_size = 1234;
        opts.max_open_files = None;

        let json = serde_json::to_string(&opts).unwrap();
        let parsed: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.column_family.write_buffer_size, 1234);
        assert_eq!(parsed.max_open_files, None);

        // Missing fields fall back to defaults
        let partial: Options = serde_json::from_str(r#"{"paranoid_checks": false}"#).unwrap();
        assert!(!partial.paranoid_checks);
        assert_eq!(partial.column_family.num_levels, crate::config::NUM_LEVELS);
    }
}
