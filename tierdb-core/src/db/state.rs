//! Engine state guarded by the single engine lock

use super::column_family::ColumnFamilyData;
use super::snapshot::SnapshotList;
use crate::compaction::ManualCompaction;
use crate::types::ColumnFamilyId;
use crate::version::VersionSet;
use crate::{Result, TierError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Health of background work.
///
/// Once degraded the engine stays degraded until it is reopened; every write
/// returns the latched error.
#[derive(Debug, Clone, Default)]
pub enum BackgroundState {
    #[default]
    Healthy,
    Degraded(Arc<TierError>),
}

impl BackgroundState {
    /// Fail with the latched error, if any
    pub fn check(&self) -> Result<()> {
        match self {
            BackgroundState::Healthy => Ok(()),
            BackgroundState::Degraded(e) => Err(TierError::Background(Arc::clone(e))),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, BackgroundState::Degraded(_))
    }

    /// Latch `err` unless an earlier error is already latched
    pub fn latch(&mut self, err: TierError) {
        if let BackgroundState::Healthy = self {
            error!("Background error latched, writes are refused until reopen: {}", err);
            *self = BackgroundState::Degraded(Arc::new(err));
        }
    }
}

/// Everything the engine lock protects
pub(crate) struct EngineState {
    pub versions: VersionSet,
    pub families: BTreeMap<ColumnFamilyId, ColumnFamilyData>,
    /// Number of the WAL receiving writes
    pub log_number: u64,
    pub snapshots: SnapshotList,
    pub bg_error: BackgroundState,
    /// Background failures seen, latched or not
    pub bg_error_count: u64,
    pub bg_flush_scheduled: usize,
    pub bg_compaction_scheduled: usize,
    /// Automatic compactions are held back while this is non-zero
    pub bg_manual_only: usize,
    pub manual_compaction: Option<ManualCompaction>,
    /// File numbers handed out to jobs that have not been committed yet
    pub pending_outputs: HashSet<u64>,
    pub last_full_scan: Option<Instant>,
    next_memtable_id: u64,
}

impl EngineState {
    pub fn new(versions: VersionSet, log_number: u64) -> Self {
        Self {
            versions,
            families: BTreeMap::new(),
            log_number,
            snapshots: SnapshotList::default(),
            bg_error: BackgroundState::Healthy,
            bg_error_count: 0,
            bg_flush_scheduled: 0,
            bg_compaction_scheduled: 0,
            bg_manual_only: 0,
            manual_compaction: None,
            pending_outputs: HashSet::new(),
            last_full_scan: None,
            next_memtable_id: 1,
        }
    }

    pub fn new_memtable_id(&mut self) -> u64 {
        let id = self.next_memtable_id;
        self.next_memtable_id += 1;
        id
    }

    /// Allocate a file number and protect it until the caller commits or drops it
    pub fn new_pending_output(&mut self) -> u64 {
        let number = self.versions.new_file_number();
        self.pending_outputs.insert(number);
        number
    }

    pub fn family(&self, cf: ColumnFamilyId) -> Result<&ColumnFamilyData> {
        self.families
            .get(&cf)
            .ok_or_else(|| TierError::ColumnFamilyNotFound(cf.to_string()))
    }

    /// Republish `cf`'s superversion from its memtables and current version
    pub fn install_super_version(&self, cf: ColumnFamilyId) {
        if let (Some(cfd), Some(current)) = (self.families.get(&cf), self.versions.current(cf)) {
            cfd.install_super_version(current);
        }
    }

    /// Oldest WAL some family still needs for unflushed data.
    ///
    /// Families with empty memtables hold nothing in any WAL, whatever their
    /// recorded log number says.
    pub fn min_log_number_to_keep(&self) -> u64 {
        self.families
            .values()
            .filter(|cfd| cfd.has_unflushed_data())
            .filter_map(|cfd| self.versions.family(cfd.id()).map(|f| f.log_number))
            .chain(std::iter::once(self.log_number))
            .min()
            .unwrap_or(self.log_number)
    }

    pub fn any_flush_pending(&self) -> bool {
        self.families.values().any(|cfd| cfd.imm.is_flush_pending())
    }

    /// Record a background failure. Returns true when it was latched.
    pub fn record_background_error(&mut self, err: TierError, paranoid: bool) -> bool {
        self.bg_error_count += 1;
        if paranoid {
            self.bg_error.latch(err);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_state_latches_first_error() {
        let mut state = BackgroundState::Healthy;
        assert!(state.check().is_ok());

        state.latch(TierError::Corruption("first".into()));
        state.latch(TierError::Corruption("second".into()));
        assert!(state.is_degraded());
        let err = state.check().unwrap_err();
        assert!(err.to_string().contains("first"));
        assert!(err.is_corruption());
    }
}
