//! The database: write path, read path and column family management
//!
//! One engine lock ([`state::EngineState`]) guards versions, memtable lists,
//! snapshots and scheduling counters. It is never held across I/O: WAL
//! appends, table writes and manifest writes all run with it released.
//! Readers do not take it at all; they load a column family's superversion.

mod background;
mod column_family;
mod db_iter;
mod flush;
mod obsolete;
mod recovery;
mod snapshot;
mod state;
mod write_batch;
mod write_thread;

pub use column_family::ColumnFamilyHandle;
pub use db_iter::DbIterator;
pub use snapshot::Snapshot;
pub use state::BackgroundState;
pub use write_batch::{BatchRecord, WriteBatch};
pub use write_thread::slowdown_amount;

use background::ThreadPool;
use state::EngineState;
use write_thread::{Joined, WriteThread, Writer};

use crate::filename::log_file_name;
use crate::get_context::{GetContext, GetState};
use crate::log::LogWriter;
use crate::memtable::MemTable;
use crate::options::{
    ColumnFamilyDescriptor, ColumnFamilyOptions, CompactRangeOptions, FlushOptions, Options,
    ReadOptions, WriteOptions,
};
use crate::table::{BlockCache, TableCache, TableReadOptions};
use crate::types::{
    ColumnFamilyId, InternalKey, SequenceNumber, DEFAULT_COLUMN_FAMILY_ID,
    DEFAULT_COLUMN_FAMILY_NAME,
};
use crate::{Result, TierError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Prefix of the per-level file count property
const NUM_FILES_AT_LEVEL_PREFIX: &str = "tierdb.num-files-at-level";

/// Shared engine internals; background tasks hold their own reference
pub(crate) struct DbInner {
    pub(crate) db_dir: PathBuf,
    pub(crate) options: Options,
    pub(crate) state: Mutex<EngineState>,
    /// Signalled whenever background work finishes or a manifest write ends
    pub(crate) bg_cv: Condvar,
    pub(crate) write_thread: WriteThread,
    /// Current WAL; only the write-group leader touches it
    pub(crate) log: Mutex<LogWriter>,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) block_cache: Option<Arc<BlockCache>>,
    /// Last sequence number visible to readers
    pub(crate) last_sequence: Arc<AtomicU64>,
    shutting_down: AtomicBool,
    /// Set while a flush waits for a compaction-pool thread
    pub(crate) flush_in_compaction_pool: AtomicBool,
    pub(crate) flush_pool: Option<ThreadPool>,
    pub(crate) compaction_pool: ThreadPool,
    _lock_file: File,
}

/// What the write leader must do before its group can go in
enum RoomAction {
    Ready,
    Delay(Duration),
    Wait(String),
    Switch(ColumnFamilyId),
}

impl DbInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn write_impl(self: &Arc<Self>, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.is_shutting_down() {
            return Err(TierError::ShutdownInProgress);
        }
        {
            let state = self.state.lock();
            state.bg_error.check()?;
            for cf in batch.column_families() {
                state.family(cf)?;
            }
        }

        let writer = self.write_thread.new_writer(
            Some(batch),
            options.sync,
            options.disable_wal,
            options.timeout,
        );
        if let Joined::Done(result) = self.write_thread.join(&writer) {
            return result;
        }

        let mut state = self.state.lock();
        if let Err(e) = self.make_room_for_write(&mut state, writer.deadline) {
            drop(state);
            return self.write_thread.exit(&[writer], Err(e));
        }
        let group = self.write_thread.build_group(&writer);
        let result = self.write_group(&mut state, &group);
        drop(state);
        self.write_thread.exit(&group, result)
    }

    /// Append the group to the WAL as one record, then apply it to the memtables
    fn write_group(&self, state: &mut MutexGuard<'_, EngineState>, group: &[Arc<Writer>]) -> Result<()> {
        state.bg_error.check()?;
        let leader = &group[0];
        let batches: Vec<&WriteBatch> = group.iter().filter_map(|w| w.batch.as_ref()).collect();
        let count: u64 = batches.iter().map(|b| b.count() as u64).sum();
        if count == 0 {
            return Ok(());
        }
        let first = self.last_sequence.load(Ordering::Acquire) + 1;
        let mems: HashMap<ColumnFamilyId, Arc<MemTable>> = state
            .families
            .iter()
            .map(|(id, cfd)| (*id, Arc::clone(&cfd.mem)))
            .collect();

        let logged = MutexGuard::unlocked(state, || -> Result<()> {
            if leader.disable_wal {
                return Ok(());
            }
            let record = WriteBatch::encode_group(first, batches.iter().copied())?;
            let mut log = self.log.lock();
            log.add_record(&record)?;
            if leader.sync {
                log.sync()
            } else {
                log.flush()
            }
        });
        if let Err(e) = logged {
            warn!("WAL append failed: {}", e);
            if self.options.paranoid_checks {
                state.bg_error.latch(e.duplicate());
            }
            return Err(e);
        }

        MutexGuard::unlocked(state, || {
            let mut sequence = first;
            for batch in &batches {
                for record in batch.records() {
                    // a family dropped after the batch was checked takes no data
                    if let Some(mem) = mems.get(&record.cf) {
                        mem.add(sequence, record.value_type, &record.key, &record.value);
                    }
                    sequence += 1;
                }
            }
        });
        self.last_sequence
            .store(first + count - 1, Ordering::Release);
        if group.len() > 1 {
            debug!(writers = group.len(), entries = count, "Committed write group");
        }
        Ok(())
    }

    /// Make sure every full memtable is switched out, stalling the writer
    /// while flushes or level-0 compactions fall behind.
    fn make_room_for_write(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, EngineState>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut allow_delay = true;
        loop {
            if self.is_shutting_down() {
                return Err(TierError::ShutdownInProgress);
            }
            state.bg_error.check()?;

            let mut action = RoomAction::Ready;
            for cfd in state.families.values() {
                let opts = cfd.options();
                let compacting = !opts.disable_auto_compactions;
                let l0 = state
                    .versions
                    .current(cfd.id())
                    .map_or(0, |v| v.num_level_files(0));
                if allow_delay && compacting && l0 >= opts.level0_slowdown_writes_trigger {
                    action = RoomAction::Delay(slowdown_amount(
                        l0,
                        opts.level0_slowdown_writes_trigger,
                        opts.level0_stop_writes_trigger,
                    ));
                    break;
                }
                if !cfd.mem.should_flush(opts.write_buffer_size) {
                    continue;
                }
                if cfd.imm.len() + 1 >= opts.max_write_buffer_number {
                    action = RoomAction::Wait(format!(
                        "column family {} has {} memtables waiting for flush",
                        cfd.name(),
                        cfd.imm.len()
                    ));
                } else if compacting && l0 >= opts.level0_stop_writes_trigger {
                    action = RoomAction::Wait(format!(
                        "column family {} has {} level-0 files",
                        cfd.name(),
                        l0
                    ));
                } else {
                    action = RoomAction::Switch(cfd.id());
                }
                break;
            }

            match action {
                RoomAction::Ready => return Ok(()),
                RoomAction::Delay(delay) => {
                    debug!(delay_us = delay.as_micros() as u64, "Delaying write");
                    MutexGuard::unlocked(state, || thread::sleep(delay));
                    allow_delay = false;
                }
                RoomAction::Wait(reason) => {
                    info!("Stalling writes: {}", reason);
                    self.maybe_schedule_flush_or_compaction(state);
                    match deadline {
                        Some(deadline) => {
                            if self.bg_cv.wait_until(state, deadline).timed_out() {
                                return Err(TierError::Timeout);
                            }
                        }
                        None => self.bg_cv.wait(state),
                    }
                }
                RoomAction::Switch(cf) => {
                    self.switch_memtable(state, cf)?;
                }
            }
        }
    }

    /// Move `cf`'s active memtable to its immutable list behind a fresh WAL.
    ///
    /// Called only by the write leader. Returns the switched-out memtable.
    fn switch_memtable(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, EngineState>,
        cf: ColumnFamilyId,
    ) -> Result<Arc<MemTable>> {
        let number = state.versions.new_file_number();
        let path = log_file_name(&self.db_dir, number);
        let new_log = MutexGuard::unlocked(state, || LogWriter::create(&path, number))?;
        {
            let mut log = self.log.lock();
            log.flush()?;
            *log = new_log;
        }
        state.log_number = number;

        let id = state.new_memtable_id();
        let cfd = state
            .families
            .get_mut(&cf)
            .ok_or_else(|| TierError::ColumnFamilyNotFound(cf.to_string()))?;
        let old = std::mem::replace(&mut cfd.mem, Arc::new(MemTable::new(id)));
        old.set_next_log_number(number);
        cfd.imm.add(Arc::clone(&old));
        info!(
            cf,
            memtable = old.id(),
            entries = old.num_entries(),
            bytes = old.approximate_memory_usage(),
            log = number,
            "Switched memtable"
        );
        state.install_super_version(cf);
        self.maybe_schedule_flush_or_compaction(state);
        Ok(old)
    }

    /// Flush `cf`'s memtables, optionally waiting until they are in level 0
    fn flush(self: &Arc<Self>, options: &FlushOptions, cf: ColumnFamilyId) -> Result<()> {
        let writer = self.write_thread.new_writer(None, false, false, None);
        if let Joined::Done(result) = self.write_thread.join(&writer) {
            return result;
        }
        let mut state = self.state.lock();
        let target = self.memtable_to_flush(&mut state, cf);
        drop(state);
        let _ = self.write_thread.exit(&[writer], Ok(()));

        let Some(mem) = target? else {
            return Ok(());
        };
        if !options.wait {
            return Ok(());
        }
        let mut state = self.state.lock();
        while !mem.flush_completed() {
            if self.is_shutting_down() {
                return Err(TierError::ShutdownInProgress);
            }
            state.bg_error.check()?;
            if !state.families.contains_key(&cf) {
                return Ok(());
            }
            self.bg_cv.wait(&mut state);
        }
        Ok(())
    }

    /// Switch out `cf`'s memtable if it holds data and return the newest
    /// memtable a flush must write
    fn memtable_to_flush(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, EngineState>,
        cf: ColumnFamilyId,
    ) -> Result<Option<Arc<MemTable>>> {
        state.bg_error.check()?;
        let cfd = state.family(cf)?;
        if !cfd.mem.is_empty() {
            return self.switch_memtable(state, cf).map(Some);
        }
        let newest = cfd.imm.memtables().first().cloned();
        if newest.is_some() {
            if let Some(cfd) = state.families.get_mut(&cf) {
                cfd.imm.request_flush();
            }
            self.maybe_schedule_flush_or_compaction(state);
        }
        Ok(newest)
    }

    fn get(&self, options: &ReadOptions, cf: &ColumnFamilyHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let sequence = self.read_sequence(options);
        let sv = cf.super_version();
        let mut ctx = GetContext::new(key, sv.options.merge_operator.as_deref());
        if !sv.mem.get(key, sequence, &mut ctx) && !sv.imm.iter().any(|m| m.get(key, sequence, &mut ctx)) {
            let lookup = InternalKey::lookup(key, sequence);
            sv.current
                .get(&self.table_cache, &lookup, &mut ctx, TableReadOptions::from(options))?;
        }
        ctx.finish()
    }

    fn key_may_exist(&self, options: &ReadOptions, cf: &ColumnFamilyHandle, key: &[u8]) -> bool {
        let sequence = self.read_sequence(options);
        let sv = cf.super_version();
        let mut ctx = GetContext::new(key, sv.options.merge_operator.as_deref());
        if sv.mem.get(key, sequence, &mut ctx) || sv.imm.iter().any(|m| m.get(key, sequence, &mut ctx)) {
            return ctx.state() != GetState::Deleted;
        }
        if ctx.state() == GetState::Merge {
            return true;
        }
        sv.current
            .key_may_exist(&self.table_cache, key)
            .unwrap_or(true)
    }

    fn read_sequence(&self, options: &ReadOptions) -> SequenceNumber {
        options
            .snapshot
            .unwrap_or_else(|| self.last_sequence.load(Ordering::Acquire))
    }

    fn property(&self, cf: ColumnFamilyId, name: &str) -> Option<String> {
        let state = self.state.lock();
        let cfd = state.families.get(&cf)?;
        let version = state.versions.current(cf)?;

        if let Some(level) = name.strip_prefix(NUM_FILES_AT_LEVEL_PREFIX) {
            let level: usize = level.parse().ok()?;
            return (level < version.num_levels()).then(|| version.num_level_files(level).to_string());
        }
        match name {
            "tierdb.num-immutable-mem-table" => Some(cfd.imm.len().to_string()),
            "tierdb.cur-size-active-mem-table" => Some(cfd.mem.approximate_memory_usage().to_string()),
            "tierdb.background-errors" => Some(state.bg_error_count.to_string()),
            "tierdb.block-cache-usage" => Some(
                self.block_cache
                    .as_ref()
                    .map_or(0, |cache| cache.usage())
                    .to_string(),
            ),
            "tierdb.levelstats" => {
                let mut out = String::from("Level Files Size(MB)\n--------------------\n");
                for level in 0..version.num_levels() {
                    let _ = writeln!(
                        out,
                        "{:>5} {:>5} {:>8.1}",
                        level,
                        version.num_level_files(level),
                        version.level_bytes(level) as f64 / 1_048_576.0
                    );
                }
                Some(out)
            }
            _ => None,
        }
    }

    /// Stop background work and make buffered WAL data durable
    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_manual_compaction();
        {
            let mut state = self.state.lock();
            self.bg_cv.notify_all();
            while state.bg_flush_scheduled > 0 || state.bg_compaction_scheduled > 0 {
                self.bg_cv.wait(&mut state);
            }
        }
        if let Err(e) = self.log.lock().sync() {
            warn!("Failed to sync WAL on close: {}", e);
        }
        if let Some(pool) = &self.flush_pool {
            pool.shutdown();
        }
        self.compaction_pool.shutdown();
        info!("Closed database {:?}", self.db_dir);
    }
}

/// An open TierDB database
pub struct Db {
    inner: Arc<DbInner>,
    default_cf: ColumnFamilyHandle,
}

impl Db {
    /// Open the database at `path` with only the default column family
    /// requested (other families on disk are opened with default options)
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Self> {
        Self::open_cf(options, path, Vec::new()).map(|(db, _)| db)
    }

    /// Open the database at `path`, returning a handle per descriptor in the
    /// same order.
    ///
    /// Every named family must exist. Families on disk that are not named
    /// are opened too, with the default column family options.
    pub fn open_cf(
        options: Options,
        path: impl AsRef<Path>,
        descriptors: Vec<ColumnFamilyDescriptor>,
    ) -> Result<(Self, Vec<ColumnFamilyHandle>)> {
        let db_dir = path.as_ref().to_path_buf();
        let mut options = options;
        if let Some(default) = descriptors
            .iter()
            .find(|d| d.name == DEFAULT_COLUMN_FAMILY_NAME)
        {
            options.column_family = default.options.clone();
        }

        let block_cache = (options.block_cache_capacity > 0).then(|| {
            Arc::new(BlockCache::new(
                options.block_cache_capacity,
                options.block_cache_shard_bits,
            ))
        });
        let table_cache = Arc::new(TableCache::new(
            db_dir.clone(),
            options.db_paths.clone(),
            options.max_open_files,
            options.table_cache_shard_bits,
            block_cache.clone(),
        ));

        let recovered = recovery::recover(&db_dir, &options, &descriptors, &table_cache)?;
        let last_sequence = recovered.state.versions.sequence_counter();
        let flush_pool = if options.max_background_flushes > 0 {
            Some(ThreadPool::new("tierdb-flush", options.max_background_flushes)?)
        } else {
            None
        };
        let compaction_pool =
            ThreadPool::new("tierdb-compact", options.max_background_compactions)?;

        let inner = Arc::new(DbInner {
            db_dir,
            options,
            state: Mutex::new(recovered.state),
            bg_cv: Condvar::new(),
            write_thread: WriteThread::new(),
            log: Mutex::new(recovered.log),
            table_cache,
            block_cache,
            last_sequence,
            shutting_down: AtomicBool::new(false),
            flush_in_compaction_pool: AtomicBool::new(false),
            flush_pool,
            compaction_pool,
            _lock_file: recovered.lock,
        });

        let (default_cf, handles, candidates) = {
            let mut state = inner.state.lock();
            let default_cf = state.family(DEFAULT_COLUMN_FAMILY_ID)?.handle();
            let handles = descriptors
                .iter()
                .map(|d| {
                    state
                        .families
                        .values()
                        .find(|cfd| cfd.name() == d.name)
                        .map(|cfd| cfd.handle())
                        .ok_or_else(|| TierError::ColumnFamilyNotFound(d.name.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            let candidates = inner.find_obsolete_files(&mut state, true, false);
            (default_cf, handles, candidates)
        };
        inner.purge_obsolete_files(candidates);
        inner.maybe_schedule_flush_or_compaction(&mut inner.state.lock());

        Ok((Self { inner, default_cf }, handles))
    }

    /// Directory the database lives in
    pub fn path(&self) -> &Path {
        &self.inner.db_dir
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn default_column_family(&self) -> &ColumnFamilyHandle {
        &self.default_cf
    }

    /// Handle to the open family called `name`
    pub fn column_family(&self, name: &str) -> Option<ColumnFamilyHandle> {
        let state = self.inner.state.lock();
        state
            .families
            .values()
            .find(|cfd| cfd.name() == name)
            .map(|cfd| cfd.handle())
    }

    /// Handles to every open family, ordered by id
    pub fn column_families(&self) -> Vec<ColumnFamilyHandle> {
        let state = self.inner.state.lock();
        state.families.values().map(|cfd| cfd.handle()).collect()
    }

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(options, &self.default_cf, key, value)
    }

    pub fn put_cf(&self, options: &WriteOptions, cf: &ColumnFamilyHandle, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf, key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        self.delete_cf(options, &self.default_cf, key)
    }

    pub fn delete_cf(&self, options: &WriteOptions, cf: &ColumnFamilyHandle, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf, key);
        self.write(options, batch)
    }

    /// Record a merge operand for `key`; the family needs a merge operator
    pub fn merge(&self, options: &WriteOptions, key: &[u8], operand: &[u8]) -> Result<()> {
        self.merge_cf(options, &self.default_cf, key, operand)
    }

    pub fn merge_cf(&self, options: &WriteOptions, cf: &ColumnFamilyHandle, key: &[u8], operand: &[u8]) -> Result<()> {
        if cf.options().merge_operator.is_none() {
            return Err(TierError::NotSupported(format!(
                "column family {} has no merge operator",
                cf.name()
            )));
        }
        let mut batch = WriteBatch::new();
        batch.merge_cf(cf, key, operand);
        self.write(options, batch)
    }

    /// Apply every record of `batch` atomically
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write_impl(options, batch)
    }

    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, &self.default_cf, key)
    }

    pub fn get_cf(&self, options: &ReadOptions, cf: &ColumnFamilyHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, cf, key)
    }

    /// False only when `key` certainly has no live value in `cf`.
    ///
    /// Consults memtables and table bloom filters; never reads a data block.
    pub fn key_may_exist(&self, options: &ReadOptions, cf: &ColumnFamilyHandle, key: &[u8]) -> bool {
        self.inner.key_may_exist(options, cf, key)
    }

    /// Look up several default-family keys at one sequence number
    pub fn multi_get(&self, options: &ReadOptions, keys: &[&[u8]]) -> Vec<Result<Option<Vec<u8>>>> {
        let keys: Vec<(&ColumnFamilyHandle, &[u8])> =
            keys.iter().map(|k| (&self.default_cf, *k)).collect();
        self.multi_get_cf(options, &keys)
    }

    /// Look up several keys, possibly across families, at one sequence number
    pub fn multi_get_cf(
        &self,
        options: &ReadOptions,
        keys: &[(&ColumnFamilyHandle, &[u8])],
    ) -> Vec<Result<Option<Vec<u8>>>> {
        let pinned = ReadOptions {
            snapshot: Some(self.inner.read_sequence(options)),
            ..options.clone()
        };
        keys.iter()
            .map(|(cf, key)| self.inner.get(&pinned, cf, key))
            .collect()
    }

    /// Iterator over the default family
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator> {
        self.iter_cf(options, &self.default_cf)
    }

    /// Iterator over `cf` at the snapshot in `options`, or at the latest
    /// sequence number when there is none
    pub fn iter_cf(&self, options: &ReadOptions, cf: &ColumnFamilyHandle) -> Result<DbIterator> {
        let sequence = self.inner.read_sequence(options);
        DbIterator::new(
            cf.super_version(),
            &self.inner.table_cache,
            sequence,
            TableReadOptions::from(options),
        )
    }

    pub fn create_column_family(&self, name: &str, options: ColumnFamilyOptions) -> Result<ColumnFamilyHandle> {
        options.validate()?;
        let mut state = self.inner.state.lock();
        let log_number = state.log_number;
        let family_options = options.clone();
        let cf = self.inner.commit_manifest(&mut state, |versions| {
            versions.prepare_create_column_family(name, family_options, log_number)
        })?;
        let current = state
            .versions
            .current(cf)
            .ok_or_else(|| TierError::Internal(format!("column family {} missing after create", cf)))?;
        let mem = Arc::new(MemTable::new(state.new_memtable_id()));
        let cfd = column_family::ColumnFamilyData::new(cf, name.to_string(), options, mem, current);
        let handle = cfd.handle();
        state.families.insert(cf, cfd);
        Ok(handle)
    }

    /// Drop a family. Handles stay readable; writes through them fail.
    pub fn drop_column_family(&self, cf: &ColumnFamilyHandle) -> Result<()> {
        let id = cf.id();
        let mut state = self.inner.state.lock();
        self.inner
            .commit_manifest(&mut state, |versions| versions.prepare_drop_column_family(id))?;
        if let Some(cfd) = state.families.remove(&id) {
            cfd.mark_dropped();
        }
        let candidates = self.inner.find_obsolete_files(&mut state, false, true);
        drop(state);
        self.inner.purge_obsolete_files(candidates);
        Ok(())
    }

    /// Pin the current state for consistent reads
    pub fn get_snapshot(&self) -> Snapshot {
        let mut state = self.inner.state.lock();
        let sequence = self.inner.last_sequence.load(Ordering::Acquire);
        state.snapshots.acquire(sequence);
        Snapshot::new(sequence, Arc::downgrade(&self.inner))
    }

    /// Release a snapshot (dropping it does the same)
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    pub fn compact_range(&self, options: &CompactRangeOptions, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.compact_range_cf(options, &self.default_cf, begin, end)
    }

    /// Compact every level's files overlapping `[begin, end]` down the tree.
    ///
    /// The memtable is flushed first. With `change_level` set the result is
    /// then moved to `target_level`.
    pub fn compact_range_cf(
        &self,
        options: &CompactRangeOptions,
        cf: &ColumnFamilyHandle,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let num_levels = cf.options().num_levels;
        if let Some(target) = options.target_level {
            if target >= num_levels {
                return Err(TierError::InvalidArgument(format!(
                    "target level {} is beyond the last level {}",
                    target,
                    num_levels - 1
                )));
            }
        }
        if options.target_path_id as usize >= self.inner.options.db_paths.len().max(1) {
            return Err(TierError::InvalidArgument(format!(
                "no storage path with id {}",
                options.target_path_id
            )));
        }

        self.inner.flush(&FlushOptions { wait: true }, cf.id())?;
        let version = self
            .inner
            .state
            .lock()
            .versions
            .current(cf.id())
            .ok_or_else(|| TierError::ColumnFamilyNotFound(cf.name().to_string()))?;

        if let Some(max_level) = version.max_level_with_files() {
            for level in 0..=max_level {
                let output_level = if (level > 0 && level == max_level) || level + 1 >= num_levels {
                    level
                } else {
                    level + 1
                };
                self.inner.run_manual_compaction(
                    cf.id(),
                    level,
                    output_level,
                    options.target_path_id,
                    begin,
                    end,
                )?;
            }
        }
        if options.change_level {
            self.inner.refit_level(cf.id(), options.target_level)?;
        }
        Ok(())
    }

    /// Stop the running manual compaction at its next file boundary
    pub fn cancel_manual_compaction(&self) {
        self.inner.cancel_manual_compaction();
    }

    pub fn flush(&self, options: &FlushOptions) -> Result<()> {
        self.flush_cf(options, &self.default_cf)
    }

    /// Write `cf`'s memtables to level 0
    pub fn flush_cf(&self, options: &FlushOptions, cf: &ColumnFamilyHandle) -> Result<()> {
        self.inner.flush(options, cf.id())
    }

    /// Read an engine property of the default family, e.g.
    /// `tierdb.num-files-at-level0`
    pub fn property(&self, name: &str) -> Option<String> {
        self.property_cf(&self.default_cf, name)
    }

    pub fn property_cf(&self, cf: &ColumnFamilyHandle, name: &str) -> Option<String> {
        self.inner.property(cf.id(), name)
    }

    /// Sequence number of the last committed write
    pub fn latest_sequence_number(&self) -> SequenceNumber {
        self.inner.last_sequence.load(Ordering::Acquire)
    }

    /// Current background health
    pub fn background_state(&self) -> BackgroundState {
        self.inner.state.lock().bg_error.clone()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.db_dir)
            .field("last_sequence", &self.latest_sequence_number())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::get_context::tests::ConcatMerge;
    use tempfile::TempDir;

    fn small_options() -> Options {
        let mut options = Options::default();
        options.column_family.write_buffer_size = 4 * 1024;
        options
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let w = WriteOptions::default();
        let r = ReadOptions::default();

        db.put(&w, b"alpha", b"1").unwrap();
        db.put(&w, b"beta", b"2").unwrap();
        assert_eq!(db.get(&r, b"alpha").unwrap(), Some(b"1".to_vec()));
        db.delete(&w, b"alpha").unwrap();
        assert_eq!(db.get(&r, b"alpha").unwrap(), None);
        assert_eq!(db.latest_sequence_number(), 3);
        assert!(!db.key_may_exist(&r, db.default_column_family(), b"alpha"));
        assert!(db.key_may_exist(&r, db.default_column_family(), b"beta"));
    }

    #[test]
    fn test_batch_takes_consecutive_sequences() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        db.write(&WriteOptions::default(), batch).unwrap();
        assert_eq!(db.latest_sequence_number(), 3);

        let r = ReadOptions::default();
        let results = db.multi_get(&r, &[b"a", b"b", b"c"]);
        let values: Vec<Option<Vec<u8>>> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![None, Some(b"2".to_vec()), None]);
    }

    #[test]
    fn test_snapshot_reads() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let w = WriteOptions::default();

        db.put(&w, b"k", b"old").unwrap();
        let snapshot = db.get_snapshot();
        db.put(&w, b"k", b"new").unwrap();

        let at_snapshot = ReadOptions::default().with_snapshot(&snapshot);
        assert_eq!(db.get(&at_snapshot, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(db.inner.state.lock().snapshots.len(), 1);
        db.release_snapshot(snapshot);
        assert_eq!(db.inner.state.lock().snapshots.len(), 0);
    }

    #[test]
    fn test_flush_moves_data_to_level0() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let w = WriteOptions::default();
        for i in 0..100u32 {
            db.put(&w, format!("key{:03}", i).as_bytes(), b"value").unwrap();
        }
        db.flush(&FlushOptions::default()).unwrap();

        assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("1"));
        assert_eq!(db.property("tierdb.num-immutable-mem-table").as_deref(), Some("0"));
        assert_eq!(db.property("tierdb.cur-size-active-mem-table").as_deref(), Some("0"));
        assert_eq!(
            db.get(&ReadOptions::default(), b"key042").unwrap(),
            Some(b"value".to_vec())
        );
        assert!(db.property("tierdb.levelstats").unwrap().contains("Level"));
        assert_eq!(db.property("tierdb.no-such-property"), None);
    }

    #[test]
    fn test_flush_in_compaction_pool() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default();
        options.max_background_flushes = 0;
        let db = Db::open(options, dir.path()).unwrap();
        db.put(&WriteOptions::default(), b"k", b"v").unwrap();
        db.flush(&FlushOptions::default()).unwrap();
        assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("1"));
    }

    #[test]
    fn test_memtable_switches_when_full() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(small_options(), dir.path()).unwrap();
        let w = WriteOptions::default();
        let value = vec![b'x'; 256];
        for i in 0..200u32 {
            db.put(&w, format!("key{:04}", i).as_bytes(), &value).unwrap();
        }
        for i in (0..200u32).step_by(17) {
            assert_eq!(
                db.get(&ReadOptions::default(), format!("key{:04}", i).as_bytes())
                    .unwrap(),
                Some(value.clone())
            );
        }
    }

    #[test]
    fn test_merge_through_memtable_and_table() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default();
        options.column_family.merge_operator = Some(Arc::new(ConcatMerge));
        let db = Db::open(options, dir.path()).unwrap();
        let w = WriteOptions::default();

        db.put(&w, b"list", b"a").unwrap();
        db.merge(&w, b"list", b"b").unwrap();
        db.flush(&FlushOptions::default()).unwrap();
        db.merge(&w, b"list", b"c").unwrap();
        assert_eq!(
            db.get(&ReadOptions::default(), b"list").unwrap(),
            Some(b"a,b,c".to_vec())
        );
    }

    #[test]
    fn test_merge_without_operator_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let err = db.merge(&WriteOptions::default(), b"k", b"v").unwrap_err();
        assert!(matches!(err, TierError::NotSupported(_)));
    }

    #[test]
    fn test_column_family_lifecycle() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let w = WriteOptions::default();
        let r = ReadOptions::default();

        let logs = db
            .create_column_family("logs", ColumnFamilyOptions::default())
            .unwrap();
        db.put_cf(&w, &logs, b"k", b"in-logs").unwrap();
        db.put(&w, b"k", b"in-default").unwrap();
        assert_eq!(db.get_cf(&r, &logs, b"k").unwrap(), Some(b"in-logs".to_vec()));
        assert_eq!(db.get(&r, b"k").unwrap(), Some(b"in-default".to_vec()));
        assert!(db
            .create_column_family("logs", ColumnFamilyOptions::default())
            .is_err());

        db.drop_column_family(&logs).unwrap();
        assert!(logs.is_dropped());
        assert!(db.column_family("logs").is_none());
        let err = db.put_cf(&w, &logs, b"k", b"again").unwrap_err();
        assert!(matches!(err, TierError::ColumnFamilyNotFound(_)));
        assert!(db.drop_column_family(db.default_column_family()).is_err());
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let _db = Db::open(Options::default(), dir.path()).unwrap();
        let err = Db::open(Options::default(), dir.path()).unwrap_err();
        assert!(matches!(err, TierError::Busy(_)));
    }

    #[test]
    fn test_open_flags() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default();
        options.create_if_missing = false;
        assert!(Db::open(options, dir.path().join("missing")).is_err());

        drop(Db::open(Options::default(), dir.path()).unwrap());
        let mut options = Options::default();
        options.error_if_exists = true;
        assert!(Db::open(options, dir.path()).is_err());
        assert!(dir.path().join("IDENTITY").exists());
    }

    #[test]
    fn test_compact_range_moves_everything_down() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let w = WriteOptions::default();
        for round in 0..3u32 {
            for i in 0..50u32 {
                db.put(&w, format!("key{:03}", i).as_bytes(), format!("v{}", round).as_bytes())
                    .unwrap();
            }
            db.flush(&FlushOptions::default()).unwrap();
        }
        assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("3"));

        db.compact_range(&CompactRangeOptions::default(), None, None).unwrap();
        assert_eq!(db.property("tierdb.num-files-at-level0").as_deref(), Some("0"));
        assert_eq!(
            db.get(&ReadOptions::default(), b"key007").unwrap(),
            Some(b"v2".to_vec())
        );
    }

    #[test]
    fn test_compact_range_rejects_bad_targets() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();
        let options = CompactRangeOptions {
            change_level: true,
            target_level: Some(99),
            target_path_id: 0,
        };
        assert!(db.compact_range(&options, None, None).is_err());
        let options = CompactRangeOptions {
            target_path_id: 2,
            ..Default::default()
        };
        assert!(db.compact_range(&options, None, None).is_err());
    }

    #[test]
    fn test_writes_with_deadline_ride_out_stalls() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(small_options(), dir.path()).unwrap();

        // every switch waits for the previous memtable's flush
        let w = WriteOptions {
            timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        for i in 0..50u32 {
            db.put(&w, format!("k{}", i).as_bytes(), &[0u8; 200]).unwrap();
        }
    }
}
