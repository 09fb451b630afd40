//! Background flushes and compactions
//!
//! Work runs on two thread pools fed by `crossbeam-channel`: a flush pool and
//! a compaction pool. `maybe_schedule_flush_or_compaction` is the only place
//! that queues work; it runs after every memtable switch and every finished
//! background job. Jobs take the engine lock to pick their inputs and to
//! commit, and release it for all table I/O.

use super::flush::write_level0_table;
use super::state::EngineState;
use super::DbInner;
use crate::compaction::{
    compact_range, needs_compaction, pick_compaction, Compaction, CompactionEnv, CompactionJob,
    ManualCompaction, ManualPick,
};
use crate::types::ColumnFamilyId;
use crate::version::{FileMetaData, ManifestWrite, VersionEdit, VersionSet};
use crate::{Result, TierError};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pause before retrying after a background failure that was not latched
const BACKGROUND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Fixed set of named worker threads draining one task channel
pub(crate) struct ThreadPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    for task in receiver.iter() {
                        task();
                    }
                })?;
            workers.push(handle);
        }
        debug!(pool = name, threads = workers.len(), "Started background pool");
        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task; false once the pool is shut down
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting work, let queued tasks finish and join the workers
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let me = thread::current().id();
        for worker in workers {
            // the last engine reference may be dropped by one of our own tasks
            if worker.thread().id() == me {
                continue;
            }
            if worker.join().is_err() {
                warn!(pool = %self.name, "Background worker panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Engine hooks handed to a running compaction job
struct JobEnv<'a> {
    db: &'a Arc<DbInner>,
    manual: bool,
    outputs: RefCell<Vec<u64>>,
}

impl CompactionEnv for JobEnv<'_> {
    fn new_file_number(&self) -> u64 {
        let number = self.db.state.lock().new_pending_output();
        self.outputs.borrow_mut().push(number);
        number
    }

    fn should_stop(&self) -> Result<()> {
        if self.db.is_shutting_down() {
            return Err(TierError::ShutdownInProgress);
        }
        if self.manual {
            let state = self.db.state.lock();
            if state.manual_compaction.as_ref().map_or(true, |m| m.done) {
                return Err(TierError::Busy("manual compaction cancelled".into()));
            }
        }
        Ok(())
    }

    fn flush_pending(&self) -> bool {
        self.db.flush_in_compaction_pool.load(Ordering::Acquire)
    }

    fn run_pending_flush(&self) -> Result<()> {
        let mut state = self.db.state.lock();
        if let Err(e) = self.db.background_flush(&mut state) {
            self.db.handle_background_error(&mut state, "flush", e);
        }
        let still_pending = state.any_flush_pending();
        self.db
            .flush_in_compaction_pool
            .store(still_pending, Ordering::Release);
        Ok(())
    }
}

impl DbInner {
    /// Queue whatever flush and compaction work the current state calls for
    pub(crate) fn maybe_schedule_flush_or_compaction(self: &Arc<Self>, state: &mut EngineState) {
        if self.is_shutting_down() || state.bg_error.is_degraded() {
            return;
        }

        let pending_flushes = state
            .families
            .values()
            .filter(|cfd| cfd.imm.is_flush_pending())
            .count();
        match &self.flush_pool {
            Some(pool) => {
                let running = state
                    .families
                    .values()
                    .filter(|cfd| cfd.imm.memtables().iter().any(|m| m.flush_in_progress()))
                    .count();
                let wanted = self.options.max_background_flushes.min(pending_flushes + running);
                while state.bg_flush_scheduled < wanted {
                    let db = Arc::clone(self);
                    if !pool.schedule(move || db.background_call_flush()) {
                        break;
                    }
                    state.bg_flush_scheduled += 1;
                }
            }
            None => self
                .flush_in_compaction_pool
                .store(pending_flushes > 0, Ordering::Release),
        }

        let manual_waiting = state
            .manual_compaction
            .as_ref()
            .map_or(false, |m| !m.done && !m.in_progress);
        let automatic = state.bg_manual_only == 0
            && state.families.values().any(|cfd| {
                state
                    .versions
                    .current(cfd.id())
                    .map_or(false, |v| needs_compaction(&v, cfd.options()))
            });
        let flush_here = self.flush_pool.is_none() && pending_flushes > 0;
        if (manual_waiting || automatic || flush_here)
            && state.bg_compaction_scheduled < self.options.max_background_compactions
        {
            self.schedule_compaction_task(state);
        }
    }

    fn schedule_compaction_task(self: &Arc<Self>, state: &mut EngineState) {
        let db = Arc::clone(self);
        if self
            .compaction_pool
            .schedule(move || db.background_call_compaction())
        {
            state.bg_compaction_scheduled += 1;
        }
    }

    fn background_call_flush(self: Arc<Self>) {
        let mut state = self.state.lock();
        if !self.is_shutting_down() {
            if let Err(e) = self.background_flush(&mut state) {
                self.handle_background_error(&mut state, "flush", e);
            }
        }
        state.bg_flush_scheduled -= 1;
        self.maybe_schedule_flush_or_compaction(&mut state);
        self.bg_cv.notify_all();

        let candidates = self.find_obsolete_files(&mut state, false, false);
        drop(state);
        self.purge_obsolete_files(candidates);
    }

    fn background_call_compaction(self: Arc<Self>) {
        let mut state = self.state.lock();
        let mut made_progress = false;
        if !self.is_shutting_down() {
            match self.background_compaction(&mut state) {
                Ok(progress) => made_progress = progress,
                Err(e) => self.handle_background_error(&mut state, "compaction", e),
            }
        }
        state.bg_compaction_scheduled -= 1;
        // a job that found nothing to do must not requeue itself
        if made_progress {
            self.maybe_schedule_flush_or_compaction(&mut state);
        }
        self.bg_cv.notify_all();

        let candidates = self.find_obsolete_files(&mut state, false, false);
        drop(state);
        self.purge_obsolete_files(candidates);
    }

    /// Log a failed background job and decide what happens next.
    ///
    /// A paranoid engine latches the error; otherwise the job is retried
    /// after a pause.
    pub(crate) fn handle_background_error(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        what: &str,
        err: TierError,
    ) {
        match err {
            TierError::ShutdownInProgress
            | TierError::ColumnFamilyNotFound(_)
            | TierError::Busy(_) => {
                debug!("Background {} stopped: {}", what, err);
            }
            err => {
                warn!("Background {} failed: {}", what, err);
                if !state.record_background_error(err, self.options.paranoid_checks) {
                    MutexGuard::unlocked(state, || thread::sleep(BACKGROUND_RETRY_DELAY));
                }
            }
        }
    }

    /// Flush the queued memtables of one family.
    ///
    /// Returns false when no family had a flush waiting.
    pub(crate) fn background_flush(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, EngineState>,
    ) -> Result<bool> {
        if self.is_shutting_down() {
            return Ok(false);
        }
        let Some(cf) = state
            .families
            .values()
            .find(|cfd| cfd.imm.is_flush_pending())
            .map(|cfd| cfd.id())
        else {
            return Ok(false);
        };

        let (mems, options) = {
            let cfd = state
                .families
                .get_mut(&cf)
                .ok_or_else(|| TierError::ColumnFamilyNotFound(cf.to_string()))?;
            (cfd.imm.pick_memtables_to_flush(), Arc::clone(cfd.options()))
        };
        let Some(newest) = mems.last().cloned() else {
            return Ok(false);
        };
        let number = state.new_pending_output();
        let snapshots = state.snapshots.sequences();
        info!(
            cf,
            memtables = mems.len(),
            file = number,
            "Flushing memtables"
        );

        let written = MutexGuard::unlocked(state, || {
            write_level0_table(&self.table_cache, &options, &mems, number, snapshots)
        });
        let result = written.and_then(|meta| {
            let mut edit = VersionEdit::new();
            if let Some(meta) = meta {
                edit.add_file(0, meta);
            }
            // every WAL before the one opened at the newest switch is now redundant
            edit.set_log_number(newest.next_log_number());
            self.apply_edit(state, cf, edit)
        });
        state.pending_outputs.remove(&number);

        match result {
            Ok(()) => {
                if let Some(cfd) = state.families.get_mut(&cf) {
                    cfd.imm.remove_flushed(&mems, number);
                }
                state.install_super_version(cf);
                Ok(true)
            }
            Err(e) => {
                if let Some(cfd) = state.families.get_mut(&cf) {
                    cfd.imm.rollback_flush(&mems);
                }
                Err(e)
            }
        }
    }

    /// Pick and run one compaction; false when there was nothing to do
    fn background_compaction(self: &Arc<Self>, state: &mut MutexGuard<'_, EngineState>) -> Result<bool> {
        // flushes go first when they share this pool
        if self.flush_pool.is_none() {
            while state.any_flush_pending() {
                if !self.background_flush(state)? {
                    break;
                }
            }
        }

        let st: &mut EngineState = &mut **state;
        let compaction = if let Some(manual) = st
            .manual_compaction
            .as_mut()
            .filter(|m| !m.done && !m.in_progress)
        {
            let cf = manual.cf_id;
            let (Some(version), Some(cfd)) = (st.versions.current(cf), st.families.get(&cf)) else {
                manual.done = true;
                manual.status = Some(TierError::ColumnFamilyNotFound(cf.to_string()));
                return Ok(true);
            };
            match compact_range(
                &version,
                cfd.options(),
                manual.input_level,
                manual.output_level,
                manual.output_path_id,
                manual.begin.as_deref(),
                manual.end.as_deref(),
            ) {
                ManualPick::Empty => {
                    manual.done = true;
                    return Ok(true);
                }
                ManualPick::Conflict => return Ok(false),
                ManualPick::Ready(c) => {
                    manual.in_progress = true;
                    c
                }
            }
        } else if st.bg_manual_only > 0 {
            return Ok(false);
        } else {
            let picked = st.families.values().find_map(|cfd| {
                st.versions
                    .current(cfd.id())
                    .and_then(|v| pick_compaction(&v, cfd.options()))
            });
            match picked {
                Some(c) => c,
                None => return Ok(false),
            }
        };

        let result = self.run_compaction(state, &compaction);
        compaction.mark_files_being_compacted(false);

        if compaction.is_manual {
            if let Some(manual) = state.manual_compaction.as_mut() {
                manual.in_progress = false;
                match &result {
                    Err(e) => {
                        if manual.status.is_none() {
                            manual.status = Some(e.duplicate());
                        }
                        manual.done = true;
                    }
                    Ok(()) if manual.done => {}
                    Ok(()) => match &compaction.manual_end {
                        Some(end) => manual.begin = Some(end.clone()),
                        None => manual.done = true,
                    },
                }
            }
        }
        result.map(|_| true)
    }

    fn run_compaction(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, EngineState>,
        compaction: &Compaction,
    ) -> Result<()> {
        let cf = compaction.cf_id();
        let options = Arc::clone(state.family(cf)?.options());

        if compaction.is_trivial_move() {
            let file = &compaction.inputs[0][0];
            let mut edit = VersionEdit::new();
            edit.delete_file(compaction.start_level, file.number());
            edit.add_file(compaction.output_level, FileMetaData::clone(file));
            self.apply_edit(state, cf, edit)?;
            state.install_super_version(cf);
            info!(
                cf,
                file = file.number(),
                from = compaction.start_level,
                to = compaction.output_level,
                bytes = file.file_size(),
                "Moved table to the next level"
            );
            return Ok(());
        }

        let snapshots = state.snapshots.sequences();
        let env = JobEnv {
            db: self,
            manual: compaction.is_manual,
            outputs: RefCell::new(Vec::new()),
        };
        let job_result = MutexGuard::unlocked(state, || {
            CompactionJob::new(compaction, &self.table_cache, &options, snapshots, &env).run()
        });
        let result = job_result.and_then(|output| {
            let mut edit = VersionEdit::new();
            compaction.add_input_deletions(&mut edit);
            for meta in output.outputs {
                edit.add_file(compaction.output_level, meta);
            }
            self.apply_edit(state, cf, edit)
        });
        for number in env.outputs.into_inner() {
            state.pending_outputs.remove(&number);
        }
        if result.is_ok() {
            state.install_super_version(cf);
        }
        result
    }

    /// Commit a file edit for `cf` to the manifest and install the new version.
    ///
    /// The manifest append runs with the lock released; other commits wait
    /// their turn on the background condition variable.
    pub(crate) fn apply_edit(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        cf: ColumnFamilyId,
        edit: VersionEdit,
    ) -> Result<()> {
        self.commit_manifest(state, |versions| versions.prepare_apply(cf, edit))
            .map(|_| ())
    }

    /// Run a prepared manifest change through write and install.
    ///
    /// Returns the column family the change applied to.
    pub(crate) fn commit_manifest(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        prepare: impl FnOnce(&mut VersionSet) -> Result<ManifestWrite>,
    ) -> Result<ColumnFamilyId> {
        while state.versions.manifest_busy() {
            self.bg_cv.wait(state);
        }
        let mut write = prepare(&mut state.versions)?;
        let cf = write.cf_id();
        let written = MutexGuard::unlocked(state, || write.write());
        let result = state.versions.finish_apply(write, written);
        self.bg_cv.notify_all();
        result.map(|_| cf)
    }

    /// Compact `[begin, end]` from `input_level` into `output_level`,
    /// blocking until every round is done.
    ///
    /// Automatic compactions are held back for the duration.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run_manual_compaction(
        self: &Arc<Self>,
        cf: ColumnFamilyId,
        input_level: usize,
        output_level: usize,
        output_path_id: u32,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        while state.manual_compaction.is_some() && !self.is_shutting_down() {
            self.bg_cv.wait(&mut state);
        }
        if self.is_shutting_down() {
            return Err(TierError::ShutdownInProgress);
        }
        state.bg_manual_only += 1;
        while state.bg_compaction_scheduled > 0 {
            self.bg_cv.wait(&mut state);
        }

        info!(cf, input_level, output_level, "Manual compaction starting");
        state.manual_compaction = Some(ManualCompaction::new(
            cf,
            input_level,
            output_level,
            output_path_id,
            begin,
            end,
        ));

        let mut status = Ok(());
        loop {
            if state.manual_compaction.as_ref().map_or(true, |m| m.done) {
                break;
            }
            if self.is_shutting_down() {
                status = Err(TierError::ShutdownInProgress);
                break;
            }
            if let Err(e) = state.bg_error.check() {
                status = Err(e);
                break;
            }
            if state.bg_compaction_scheduled == 0 {
                self.schedule_compaction_task(&mut state);
            }
            self.bg_cv.wait(&mut state);
        }

        if status.is_err() {
            if let Some(manual) = state.manual_compaction.as_mut() {
                manual.cancel();
            }
        }
        // a cancelled round may still be running
        while state.manual_compaction.as_ref().map_or(false, |m| m.in_progress) {
            self.bg_cv.wait(&mut state);
        }
        if let Some(manual) = state.manual_compaction.take() {
            if let Some(e) = manual.status {
                if status.is_ok() {
                    status = Err(e);
                }
            }
        }
        state.bg_manual_only -= 1;
        self.maybe_schedule_flush_or_compaction(&mut state);
        self.bg_cv.notify_all();
        info!(cf, input_level, output_level, ok = status.is_ok(), "Manual compaction finished");
        status
    }

    /// Cancel the running manual compaction, if any, at its next file boundary
    pub(crate) fn cancel_manual_compaction(&self) {
        let mut state = self.state.lock();
        if let Some(manual) = state.manual_compaction.as_mut() {
            manual.cancel();
            if manual.status.is_none() {
                manual.status = Some(TierError::Busy("manual compaction cancelled".into()));
            }
            self.bg_cv.notify_all();
        }
    }

    /// Move every file of the deepest non-empty level to `target`, or to the
    /// shallowest level that can hold it when `target` is `None`
    pub(crate) fn refit_level(self: &Arc<Self>, cf: ColumnFamilyId, target: Option<usize>) -> Result<()> {
        let mut state = self.state.lock();
        state.bg_manual_only += 1;
        while state.bg_compaction_scheduled > 0 {
            self.bg_cv.wait(&mut state);
        }
        let result = self.refit_level_locked(&mut state, cf, target);
        state.bg_manual_only -= 1;
        self.maybe_schedule_flush_or_compaction(&mut state);
        result
    }

    fn refit_level_locked(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        cf: ColumnFamilyId,
        target: Option<usize>,
    ) -> Result<()> {
        let options = Arc::clone(state.family(cf)?.options());
        let version = state
            .versions
            .current(cf)
            .ok_or_else(|| TierError::ColumnFamilyNotFound(cf.to_string()))?;
        let Some(level) = version.max_level_with_files() else {
            return Ok(());
        };
        let to = target.unwrap_or_else(|| version.find_minimum_empty_level_fitting(level, &options));
        if to == level {
            return Ok(());
        }
        if !version.can_refit_level(level, to) {
            return Err(TierError::InvalidArgument(format!(
                "cannot move level {} to level {}",
                level, to
            )));
        }

        let mut edit = VersionEdit::new();
        for file in version.files(level) {
            edit.delete_file(level, file.number());
            edit.add_file(to, FileMetaData::clone(file));
        }
        self.apply_edit(state, cf, edit)?;
        state.install_super_version(cf);
        info!(cf, from = level, to, "Refitted level");
        Ok(())
    }
}
