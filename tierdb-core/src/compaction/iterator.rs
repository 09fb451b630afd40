//! Decides which merged entries survive a flush or compaction

use crate::iterator::BoxedIterator;
use crate::options::{CompactionFilter, FilterDecision, MergeOperator};
use crate::types::{InternalKey, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER};
use crate::{Result, TierError};
use std::collections::VecDeque;
use std::sync::Arc;

/// Smallest snapshot that can see `sequence`, plus the greatest snapshot below it.
///
/// `snapshots` must be sorted ascending. With no snapshot at or above
/// `sequence` the entry is only visible to the latest state, reported as
/// [`MAX_SEQUENCE_NUMBER`]. The second value is 0 when no snapshot is older.
///
/// The pair brackets the stripe `(prev, earliest]` holding `sequence`. The
/// greatest snapshot below `sequence` is its lower bound. Two versions of a
/// key share a stripe exactly when no snapshot separates them, and only then
/// is the older one dropped.
pub fn find_earliest_visible_snapshot(
    sequence: SequenceNumber,
    snapshots: &[SequenceNumber],
) -> (SequenceNumber, SequenceNumber) {
    let mut prev = 0;
    for &snapshot in snapshots {
        if snapshot >= sequence {
            return (snapshot, prev);
        }
        prev = snapshot;
    }
    (MAX_SEQUENCE_NUMBER, prev)
}

/// Counters reported when a job finishes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionIterStats {
    pub records_in: u64,
    pub records_out: u64,
    /// Entries hidden by a newer entry in the same snapshot stripe
    pub shadowed: u64,
    pub tombstones_elided: u64,
    pub merges_resolved: u64,
    pub filtered: u64,
}

type Entry = (InternalKey, Vec<u8>);

/// Pulls merged input one user key at a time and yields what must be kept.
///
/// Entries of one user key are split into stripes by the snapshots that can
/// see them. Within a stripe only the newest put or deletion survives, along
/// with any merge operands stacked on it.
pub struct CompactionIterator<'a> {
    input: BoxedIterator,
    snapshots: Vec<SequenceNumber>,
    earliest_snapshot: SequenceNumber,
    latest_snapshot: Option<SequenceNumber>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
    compaction_filter: Option<Arc<dyn CompactionFilter>>,
    output_level: usize,
    /// May a tombstone for this key be dropped outright?
    key_not_exists_beyond: Box<dyn Fn(&[u8]) -> bool + 'a>,
    pending: VecDeque<Entry>,
    stats: CompactionIterStats,
}

impl<'a> CompactionIterator<'a> {
    /// `input` yields internal keys in order; `snapshots` is any order
    pub fn new(
        input: BoxedIterator,
        mut snapshots: Vec<SequenceNumber>,
        output_level: usize,
        key_not_exists_beyond: Box<dyn Fn(&[u8]) -> bool + 'a>,
    ) -> Self {
        snapshots.sort_unstable();
        snapshots.dedup();
        let earliest_snapshot = snapshots.first().copied().unwrap_or(MAX_SEQUENCE_NUMBER);
        let latest_snapshot = snapshots.last().copied();
        Self {
            input,
            snapshots,
            earliest_snapshot,
            latest_snapshot,
            merge_operator: None,
            compaction_filter: None,
            output_level,
            key_not_exists_beyond,
            pending: VecDeque::new(),
            stats: CompactionIterStats::default(),
        }
    }

    pub fn with_merge_operator(mut self, operator: Option<Arc<dyn MergeOperator>>) -> Self {
        self.merge_operator = operator;
        self
    }

    pub fn with_compaction_filter(mut self, filter: Option<Arc<dyn CompactionFilter>>) -> Self {
        self.compaction_filter = filter;
        self
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.pending.clear();
        self.input.seek_to_first()
    }

    pub fn stats(&self) -> CompactionIterStats {
        self.stats
    }

    /// Next surviving entry, or `None` once the input is exhausted
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        while self.pending.is_empty() {
            if !self.input.is_valid() {
                return Ok(None);
            }
            let group = self.read_user_key()?;
            self.process_user_key(group)?;
        }
        let entry = self.pending.pop_front();
        if entry.is_some() {
            self.stats.records_out += 1;
        }
        Ok(entry)
    }

    /// Every entry of the next user key, newest first
    fn read_user_key(&mut self) -> Result<Vec<Entry>> {
        let user_key = self.input.key().user_key.clone();
        let mut group = Vec::new();
        while self.input.is_valid() && self.input.key().user_key == user_key {
            group.push((self.input.key().clone(), self.input.value().to_vec()));
            self.input.next()?;
        }
        self.stats.records_in += group.len() as u64;
        Ok(group)
    }

    fn process_user_key(&mut self, group: Vec<Entry>) -> Result<()> {
        let mut stripe: Option<SequenceNumber> = None;
        let mut sealed = false;
        let mut operands: Vec<Entry> = Vec::new();

        for (key, value) in group {
            let (visible_in, _) = find_earliest_visible_snapshot(key.sequence, &self.snapshots);
            if stripe != Some(visible_in) {
                // operands cannot be folded across a snapshot boundary
                self.pending.extend(operands.drain(..));
                stripe = Some(visible_in);
                sealed = false;
            }
            if sealed {
                self.stats.shadowed += 1;
                continue;
            }

            match key.value_type {
                ValueType::Merge => operands.push((key, value)),
                ValueType::Value => {
                    sealed = true;
                    if operands.is_empty() {
                        self.emit_value(key, value);
                    } else if let Some(merged) = self.resolve(&key.user_key, Some(&value), &operands)? {
                        self.stats.shadowed += 1;
                        self.emit_resolved(&mut operands, merged);
                    } else {
                        self.pending.extend(operands.drain(..));
                        self.pending.push_back((key, value));
                    }
                }
                ValueType::Deletion => {
                    sealed = true;
                    if operands.is_empty() {
                        self.emit_deletion(key);
                    } else if let Some(merged) = self.resolve(&key.user_key, None, &operands)? {
                        self.stats.shadowed += 1;
                        self.emit_resolved(&mut operands, merged);
                    } else {
                        self.pending.extend(operands.drain(..));
                        self.emit_deletion(key);
                    }
                }
            }
        }

        if !operands.is_empty() {
            // No base below the operands: if nothing deeper can hold the key
            // they resolve against nothing.
            let user_key = operands[0].0.user_key.clone();
            let merged = if (self.key_not_exists_beyond)(&user_key) {
                self.resolve(&user_key, None, &operands)?
            } else {
                None
            };
            match merged {
                Some(merged) => self.emit_resolved(&mut operands, merged),
                None => self.pending.extend(operands.drain(..)),
            }
        }
        Ok(())
    }

    /// Fold `operands` (newest first) onto `base` when an operator is configured
    fn resolve(&self, user_key: &[u8], base: Option<&[u8]>, operands: &[Entry]) -> Result<Option<Vec<u8>>> {
        let Some(operator) = &self.merge_operator else {
            return Ok(None);
        };
        let values: Vec<Vec<u8>> = operands.iter().rev().map(|(_, v)| v.clone()).collect();
        operator
            .full_merge(user_key, base, &values)
            .map(Some)
            .ok_or_else(|| {
                TierError::Corruption(format!(
                    "merge operator {} failed for key {:?}",
                    operator.name(),
                    String::from_utf8_lossy(user_key)
                ))
            })
    }

    /// Replace the stripe's operands with one put at the newest operand's sequence
    fn emit_resolved(&mut self, operands: &mut Vec<Entry>, merged: Vec<u8>) {
        let newest = &operands[0].0;
        let key = InternalKey::new(newest.user_key.clone(), newest.sequence, ValueType::Value);
        self.stats.merges_resolved += operands.len() as u64;
        operands.clear();
        self.pending.push_back((key, merged));
    }

    fn emit_value(&mut self, key: InternalKey, value: Vec<u8>) {
        let invisible_to_snapshots = self.latest_snapshot.map_or(true, |s| key.sequence > s);
        let decision = match (&self.compaction_filter, invisible_to_snapshots) {
            (Some(filter), true) => filter.filter(self.output_level, &key.user_key, &value),
            _ => FilterDecision::Keep,
        };
        match decision {
            FilterDecision::Keep => self.pending.push_back((key, value)),
            FilterDecision::ChangeValue(new_value) => {
                self.stats.filtered += 1;
                self.pending.push_back((key, new_value));
            }
            FilterDecision::Remove => {
                self.stats.filtered += 1;
                let tombstone = InternalKey::new(key.user_key, key.sequence, ValueType::Deletion);
                self.emit_deletion(tombstone);
            }
        }
    }

    fn emit_deletion(&mut self, key: InternalKey) {
        if key.sequence <= self.earliest_snapshot && (self.key_not_exists_beyond)(&key.user_key) {
            self.stats.tombstones_elided += 1;
            return;
        }
        self.pending.push_back((key, Vec::new()));
    }
}
