//! Snapshots: pinned read sequence numbers

use super::DbInner;
use crate::types::SequenceNumber;
use std::collections::BTreeMap;
use std::sync::Weak;

/// A consistent read view as of one sequence number.
///
/// Compactions keep every version of a key this snapshot can see until it is
/// released, either through [`crate::Db::release_snapshot`] or by dropping it.
pub struct Snapshot {
    sequence: SequenceNumber,
    db: Weak<DbInner>,
}

impl Snapshot {
    pub(crate) fn new(sequence: SequenceNumber, db: Weak<DbInner>) -> Self {
        Self { sequence, db }
    }

    /// Sequence number this snapshot reads at
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if let Some(db) = self.db.upgrade() {
            db.state.lock().snapshots.release(self.sequence);
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Live snapshot sequence numbers with their multiplicity
#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    sequences: BTreeMap<SequenceNumber, usize>,
}

impl SnapshotList {
    pub fn acquire(&mut self, sequence: SequenceNumber) {
        *self.sequences.entry(sequence).or_insert(0) += 1;
    }

    pub fn release(&mut self, sequence: SequenceNumber) {
        if let Some(count) = self.sequences.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                self.sequences.remove(&sequence);
            }
        }
    }

    /// Distinct live sequences, ascending
    pub fn sequences(&self) -> Vec<SequenceNumber> {
        self.sequences.keys().copied().collect()
    }

    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.sequences.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.sequences.values().sum()
    }
}
