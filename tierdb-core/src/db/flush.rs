//! Writing memtables out as level-0 tables

use crate::compaction::CompactionIterator;
use crate::iterator::{BoxedIterator, MergingIterator};
use crate::memtable::MemTable;
use crate::options::ColumnFamilyOptions;
use crate::table::{TableBuilder, TableCache};
use crate::types::SequenceNumber;
use crate::version::{FileDescriptor, FileMetaData};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Merge `mems` into table `number` on path 0.
///
/// Entries no snapshot can tell apart collapse as they would in a compaction,
/// but tombstones are always kept: older tables may still hold the key.
/// Returns `None` when there was nothing to write.
pub(crate) fn write_level0_table(
    table_cache: &TableCache,
    options: &ColumnFamilyOptions,
    mems: &[Arc<MemTable>],
    number: u64,
    snapshots: Vec<SequenceNumber>,
) -> Result<Option<FileMetaData>> {
    let start = Instant::now();
    let children: Vec<BoxedIterator> = mems
        .iter()
        .map(|m| Box::new(m.iter()) as BoxedIterator)
        .collect();
    let mut iter = CompactionIterator::new(
        Box::new(MergingIterator::new(children)),
        snapshots,
        0,
        Box::new(|_: &[u8]| false),
    )
    .with_merge_operator(options.merge_operator.clone());
    iter.seek_to_first()?;

    let fd = FileDescriptor::new(number, 0, 0);
    let mut builder = TableBuilder::create(
        table_cache.table_path(&fd),
        options.block_size,
        options.bloom_bits_per_key,
    )?;

    let mut add_all = || -> Result<()> {
        while let Some((key, value)) = iter.next_entry()? {
            builder.add(&key, &value)?;
        }
        Ok(())
    };
    if let Err(e) = add_all() {
        if let Err(abandon_err) = builder.abandon() {
            warn!(error = %abandon_err, "Failed to remove partial flush output");
        }
        return Err(e);
    }

    if builder.num_entries() == 0 {
        builder.abandon()?;
        return Ok(None);
    }

    let props = builder.finish()?;
    let meta = FileMetaData::from_properties(number, 0, &props)?;
    // open it once so a bad table fails the flush rather than a later read
    if let Err(e) = table_cache.find_table(&meta.fd) {
        let _ = std::fs::remove_file(table_cache.table_path(&meta.fd));
        return Err(e);
    }

    let stats = iter.stats();
    info!(
        file = number,
        memtables = mems.len(),
        entries = meta.num_entries,
        bytes = meta.file_size(),
        shadowed = stats.shadowed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Flushed memtables to level-0 table"
    );
    Ok(Some(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::collect_entries;
    use crate::table::TableReadOptions;
    use crate::types::ValueType;
    use tempfile::TempDir;

    #[test]
    fn test_flush_collapses_and_keeps_tombstones() {
        let dir = TempDir::new().unwrap();
        let cache = TableCache::new(dir.path(), Vec::new(), Some(100), 2, None);

        let older = Arc::new(MemTable::new(1));
        older.add(1, ValueType::Value, b"a", b"a1");
        older.add(2, ValueType::Value, b"b", b"b1");
        let newer = Arc::new(MemTable::new(2));
        newer.add(3, ValueType::Value, b"a", b"a2");
        newer.add(4, ValueType::Deletion, b"b", b"");

        let meta = write_level0_table(
            &cache,
            &ColumnFamilyOptions::default(),
            &[older, newer],
            7,
            Vec::new(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(meta.number(), 7);
        assert_eq!(meta.smallest_seq, 3);
        assert_eq!(meta.largest_seq, 4);

        let mut iter = cache
            .new_iterator(&meta.fd, TableReadOptions::default())
            .unwrap();
        iter.seek_to_first().unwrap();
        let entries = collect_entries(iter.as_mut()).unwrap();
        let summary: Vec<(Vec<u8>, u64, ValueType)> = entries
            .into_iter()
            .map(|(k, _)| (k.user_key, k.sequence, k.value_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                (b"a".to_vec(), 3, ValueType::Value),
                (b"b".to_vec(), 4, ValueType::Deletion),
            ]
        );
    }

    #[test]
    fn test_flush_of_empty_memtable_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = TableCache::new(dir.path(), Vec::new(), Some(100), 2, None);
        let empty = Arc::new(MemTable::new(1));
        let out = write_level0_table(
            &cache,
            &ColumnFamilyOptions::default(),
            &[empty],
            9,
            Vec::new(),
        )
        .unwrap();
        assert!(out.is_none());
        assert!(!cache.table_path(&FileDescriptor::new(9, 0, 0)).exists());
    }
}
