//! Runs one compaction: merge the inputs, write the survivors into new tables

use super::{Compaction, CompactionIterStats, CompactionIterator};
use crate::iterator::{BoxedIterator, LevelIterator, MergingIterator};
use crate::options::ColumnFamilyOptions;
use crate::table::{TableBuilder, TableCache, TableIterSource, TableReadOptions};
use crate::types::SequenceNumber;
use crate::version::{FileDescriptor, FileMetaData};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a running job needs from the engine around it
pub trait CompactionEnv {
    /// Allocate a number for the next output table and protect it from deletion
    fn new_file_number(&self) -> u64;

    /// Checked before each output file is opened; an error aborts the job
    fn should_stop(&self) -> Result<()>;

    /// Is a memtable waiting to be flushed with no flush thread to take it?
    fn flush_pending(&self) -> bool {
        false
    }

    /// Flush the waiting memtables inline
    fn run_pending_flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Outputs of a finished job, not yet installed
#[derive(Debug, Default)]
pub struct CompactionResult {
    pub outputs: Vec<FileMetaData>,
    pub stats: CompactionIterStats,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub struct CompactionJob<'a> {
    compaction: &'a Compaction,
    table_cache: &'a Arc<TableCache>,
    options: &'a ColumnFamilyOptions,
    snapshots: Vec<SequenceNumber>,
    env: &'a dyn CompactionEnv,
}

impl<'a> CompactionJob<'a> {
    pub fn new(
        compaction: &'a Compaction,
        table_cache: &'a Arc<TableCache>,
        options: &'a ColumnFamilyOptions,
        snapshots: Vec<SequenceNumber>,
        env: &'a dyn CompactionEnv,
    ) -> Self {
        Self {
            compaction,
            table_cache,
            options,
            snapshots,
            env,
        }
    }

    fn input_iterator(&self) -> Result<BoxedIterator> {
        let opts = TableReadOptions {
            verify_checksums: true,
            fill_cache: false,
        };
        let mut children: Vec<BoxedIterator> = Vec::new();
        let source = Arc::new(TableIterSource::new(Arc::clone(self.table_cache), opts));
        for (which, level) in [self.compaction.start_level, self.compaction.output_level]
            .into_iter()
            .enumerate()
        {
            let files = &self.compaction.inputs[which];
            if files.is_empty() {
                continue;
            }
            if level == 0 {
                for file in files {
                    children.push(self.table_cache.new_iterator(&file.fd, opts)?);
                }
            } else {
                children.push(Box::new(LevelIterator::new(files.clone(), source.clone())));
            }
        }
        Ok(Box::new(MergingIterator::new(children)))
    }

    fn open_output(&self) -> Result<(u64, TableBuilder)> {
        self.env.should_stop()?;
        let number = self.env.new_file_number();
        let fd = FileDescriptor::new(number, self.compaction.output_path_id, 0);
        let builder = TableBuilder::create(
            self.table_cache.table_path(&fd),
            self.options.block_size,
            self.options.bloom_bits_per_key,
        )?;
        Ok((number, builder))
    }

    fn finish_output(&self, number: u64, builder: TableBuilder, result: &mut CompactionResult) -> Result<()> {
        let props = builder.finish()?;
        let meta = FileMetaData::from_properties(number, self.compaction.output_path_id, &props)?;
        // open it once so a corrupt output fails the job instead of a later read
        self.table_cache.find_table(&meta.fd)?;
        result.bytes_written += meta.file_size();
        debug!(
            file = number,
            entries = meta.num_entries,
            bytes = meta.file_size(),
            "Finished compaction output"
        );
        result.outputs.push(meta);
        Ok(())
    }

    /// Run to completion. On error, every output written so far is removed.
    pub fn run(&self) -> Result<CompactionResult> {
        let start = Instant::now();
        let mut result = CompactionResult {
            bytes_read: self.compaction.input_bytes(),
            ..Default::default()
        };
        let mut current: Option<(u64, TableBuilder)> = None;

        let outcome = self.write_outputs(&mut result, &mut current);
        if let Err(e) = outcome {
            if let Some((_, builder)) = current.take() {
                if let Err(abandon_err) = builder.abandon() {
                    warn!(error = %abandon_err, "Failed to remove partial compaction output");
                }
            }
            for meta in result.outputs.drain(..) {
                self.table_cache.evict(meta.number());
                let _ = std::fs::remove_file(self.table_cache.table_path(&meta.fd));
            }
            return Err(e);
        }

        info!(
            cf = self.compaction.cf_id(),
            summary = %self.compaction.summary(),
            outputs = result.outputs.len(),
            bytes_read = result.bytes_read,
            bytes_written = result.bytes_written,
            records_in = result.stats.records_in,
            records_out = result.stats.records_out,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Compaction finished"
        );
        Ok(result)
    }

    fn write_outputs(
        &self,
        result: &mut CompactionResult,
        current: &mut Option<(u64, TableBuilder)>,
    ) -> Result<()> {
        let compaction = self.compaction;
        let mut iter = CompactionIterator::new(
            self.input_iterator()?,
            self.snapshots.clone(),
            compaction.output_level,
            Box::new(move |key: &[u8]| compaction.key_not_exists_beyond_output_level(key)),
        )
        .with_merge_operator(self.options.merge_operator.clone())
        .with_compaction_filter(self.options.compaction_filter.clone());
        iter.seek_to_first()?;

        let mut last_user_key: Option<Vec<u8>> = None;
        while let Some((key, value)) = iter.next_entry()? {
            if self.env.flush_pending() {
                self.env.run_pending_flush()?;
            }

            let new_user_key = last_user_key.as_deref() != Some(key.user_key.as_slice());
            // one user key never spans two output files
            if new_user_key {
                let full = current
                    .as_ref()
                    .map_or(false, |(_, b)| b.file_size() >= compaction.max_output_file_size);
                if full {
                    if let Some((number, builder)) = current.take() {
                        self.finish_output(number, builder, result)?;
                    }
                }
                last_user_key = Some(key.user_key.clone());
            }

            if current.is_none() {
                *current = Some(self.open_output()?);
            }
            if let Some((_, builder)) = current.as_mut() {
                builder.add(&key, &value)?;
            }
        }

        if let Some((number, builder)) = current.take() {
            self.finish_output(number, builder, result)?;
        }
        result.stats = iter.stats();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::{compact_range, ManualPick};
    use crate::iterator::collect_entries;
    use crate::types::{InternalKey, ValueType};
    use crate::version::Version;
    use crate::TierError;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct TestEnv {
        next: Cell<u64>,
        stop_after: Option<u64>,
        flushes: Cell<u32>,
    }

    impl TestEnv {
        fn new(first: u64) -> Self {
            Self {
                next: Cell::new(first),
                stop_after: None,
                flushes: Cell::new(0),
            }
        }
    }

    impl CompactionEnv for TestEnv {
        fn new_file_number(&self) -> u64 {
            let n = self.next.get();
            self.next.set(n + 1);
            n
        }

        fn should_stop(&self) -> Result<()> {
            match self.stop_after {
                Some(limit) if self.next.get() >= limit => Err(TierError::ShutdownInProgress),
                _ => Ok(()),
            }
        }

        fn flush_pending(&self) -> bool {
            self.flushes.get() == 0
        }

        fn run_pending_flush(&self) -> Result<()> {
            self.flushes.set(self.flushes.get() + 1);
            Ok(())
        }
    }

    fn write_table(cache: &TableCache, number: u64, entries: &[(&str, u64, ValueType)]) -> Arc<FileMetaData> {
        let fd = FileDescriptor::new(number, 0, 0);
        let mut builder = TableBuilder::create(cache.table_path(&fd), 4096, 10).unwrap();
        for (key, seq, vt) in entries {
            let value = if *vt == ValueType::Deletion { Vec::new() } else { format!("{}@{}", key, seq).into_bytes() };
            builder
                .add(&InternalKey::new(key.as_bytes().to_vec(), *seq, *vt), &value)
                .unwrap();
        }
        let props = builder.finish().unwrap();
        Arc::new(FileMetaData::from_properties(number, 0, &props).unwrap())
    }

    fn setup() -> (TempDir, Arc<TableCache>) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TableCache::new(dir.path(), Vec::new(), Some(100), 2, None));
        (dir, cache)
    }

    #[test]
    fn test_merges_levels_and_drops_shadowed() {
        let (_dir, cache) = setup();
        let l1 = write_table(
            &cache,
            1,
            &[("a", 10, ValueType::Value), ("b", 11, ValueType::Deletion), ("c", 12, ValueType::Value)],
        );
        let l2 = write_table(&cache, 2, &[("a", 1, ValueType::Value), ("b", 2, ValueType::Value)]);
        let version = Arc::new(Version::from_levels(0, 1, vec![vec![], vec![l1], vec![l2], vec![]]));
        let options = ColumnFamilyOptions {
            num_levels: 4,
            ..Default::default()
        };
        let compaction = match compact_range(&version, &options, 1, 2, 0, None, None) {
            ManualPick::Ready(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        assert!(compaction.is_bottommost());

        let env = TestEnv::new(10);
        let job = CompactionJob::new(&compaction, &cache, &options, vec![], &env);
        let result = job.run().unwrap();
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.stats.records_in, 5);
        assert_eq!(result.stats.tombstones_elided, 1);
        assert_eq!(env.flushes.get(), 1);

        let out = &result.outputs[0];
        assert_eq!(out.number(), 10);
        let mut iter = cache.new_iterator(&out.fd, TableReadOptions::default()).unwrap();
        iter.seek_to_first().unwrap();
        let keys: Vec<(Vec<u8>, u64)> = collect_entries(iter.as_mut())
            .unwrap()
            .into_iter()
            .map(|(k, _)| (k.user_key, k.sequence))
            .collect();
        assert_eq!(keys, vec![(b"a".to_vec(), 10), (b"c".to_vec(), 12)]);
        compaction.mark_files_being_compacted(false);
    }

    #[test]
    fn test_output_rollover_keeps_user_keys_whole() {
        let (_dir, cache) = setup();
        let mut entries = Vec::new();
        let names: Vec<String> = (0..200).map(|i| format!("key{:04}", i)).collect();
        for name in &names {
            entries.push((name.as_str(), 5, ValueType::Value));
        }
        let l1 = write_table(&cache, 1, &entries);
        let version = Arc::new(Version::from_levels(0, 1, vec![vec![], vec![l1], vec![], vec![]]));
        let options = ColumnFamilyOptions {
            num_levels: 4,
            target_file_size_base: 1024,
            block_size: 256,
            ..Default::default()
        };
        let compaction = match compact_range(&version, &options, 1, 2, 0, None, None) {
            ManualPick::Ready(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        let env = TestEnv::new(10);
        let result = CompactionJob::new(&compaction, &cache, &options, vec![], &env)
            .run()
            .unwrap();
        assert!(result.outputs.len() > 1);
        for pair in result.outputs.windows(2) {
            assert!(pair[0].largest_user_key() < pair[1].smallest_user_key());
        }
        let total: u64 = result.outputs.iter().map(|f| f.num_entries).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn test_stop_removes_partial_outputs() {
        let (dir, cache) = setup();
        let keys: Vec<String> = (0..200).map(|i| format!("key{:04}", i)).collect();
        let entries: Vec<(&str, u64, ValueType)> =
            keys.iter().map(|k| (k.as_str(), 5, ValueType::Value)).collect();
        let l1 = write_table(&cache, 1, &entries);
        let version = Arc::new(Version::from_levels(0, 1, vec![vec![], vec![l1], vec![], vec![]]));
        let options = ColumnFamilyOptions {
            num_levels: 4,
            target_file_size_base: 1024,
            block_size: 256,
            ..Default::default()
        };
        let compaction = match compact_range(&version, &options, 1, 2, 0, None, None) {
            ManualPick::Ready(c) => c,
            other => panic!("unexpected {:?}", other),
        };
        let mut env = TestEnv::new(10);
        env.stop_after = Some(11);
        let err = CompactionJob::new(&compaction, &cache, &options, vec![], &env)
            .run()
            .unwrap_err();
        assert!(matches!(err, TierError::ShutdownInProgress));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "000001.sst")
            .collect();
        assert!(leftovers.is_empty());
    }
}
