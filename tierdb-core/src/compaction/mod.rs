//! Background compaction for the LSM tree
//!
//! - [`picker`] decides what to compact: the level whose score most exceeds
//!   its target, or an explicit manual range
//! - [`CompactionIterator`] merges the inputs and drops what no reader can see
//! - [`CompactionJob`] writes the surviving entries into new tables
//!
//! The engine installs a job's outputs and deletes its inputs in a single
//! version edit, so readers see either the old files or the new ones.

mod iterator;
mod job;
pub mod picker;

pub use iterator::{find_earliest_visible_snapshot, CompactionIterStats, CompactionIterator};
pub use job::{CompactionEnv, CompactionJob, CompactionResult};
pub use picker::{compact_range, level_scores, needs_compaction, pick_compaction, ManualPick};

use crate::options::ColumnFamilyOptions;
use crate::types::ColumnFamilyId;
use crate::version::{FileMetaData, Version, VersionEdit};
use crate::TierError;
use std::sync::Arc;

/// One unit of compaction work: files from `start_level` plus the files they
/// overlap in `output_level`
pub struct Compaction {
    cf_id: ColumnFamilyId,
    input_version: Arc<Version>,
    pub start_level: usize,
    pub output_level: usize,
    /// `inputs[0]` from the start level, `inputs[1]` from the output level
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
    pub max_output_file_size: u64,
    pub output_path_id: u32,
    pub score: f64,
    pub is_manual: bool,
    /// Where a manual compaction stopped short of its requested end
    pub manual_end: Option<Vec<u8>>,
    bottommost: bool,
}

impl Compaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cf_id: ColumnFamilyId,
        input_version: Arc<Version>,
        start_level: usize,
        output_level: usize,
        start_inputs: Vec<Arc<FileMetaData>>,
        output_inputs: Vec<Arc<FileMetaData>>,
        options: &ColumnFamilyOptions,
        output_path_id: u32,
        score: f64,
        is_manual: bool,
    ) -> Self {
        let mut compaction = Self {
            cf_id,
            input_version,
            start_level,
            output_level,
            inputs: [start_inputs, output_inputs],
            max_output_file_size: options.max_file_size_for_level(output_level),
            output_path_id,
            score,
            is_manual,
            manual_end: None,
            bottommost: false,
        };
        compaction.bottommost = compaction.compute_bottommost();
        compaction
    }

    fn compute_bottommost(&self) -> bool {
        let Some((smallest, largest)) = self.user_key_range() else {
            return true;
        };
        ((self.output_level + 1)..self.input_version.num_levels())
            .all(|level| !self.input_version.overlap_in_level(level, &smallest, &largest))
    }

    pub fn cf_id(&self) -> ColumnFamilyId {
        self.cf_id
    }

    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// True when no deeper level holds data in the compaction's key range
    pub fn is_bottommost(&self) -> bool {
        self.bottommost
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn all_inputs(&self) -> impl Iterator<Item = &Arc<FileMetaData>> {
        self.inputs[0].iter().chain(self.inputs[1].iter())
    }

    pub fn input_bytes(&self) -> u64 {
        self.all_inputs().map(|f| f.file_size()).sum()
    }

    /// Smallest and largest user key across every input
    pub fn user_key_range(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let smallest = self.all_inputs().map(|f| f.smallest_user_key()).min()?;
        let largest = self.all_inputs().map(|f| f.largest_user_key()).max()?;
        Some((smallest.to_vec(), largest.to_vec()))
    }

    /// A single file with nothing to merge against can simply change level
    pub fn is_trivial_move(&self) -> bool {
        !self.is_manual
            && self.start_level != self.output_level
            && self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
    }

    /// Can `user_key` exist in any level below the output level?
    pub fn key_not_exists_beyond_output_level(&self, user_key: &[u8]) -> bool {
        if self.bottommost {
            return true;
        }
        ((self.output_level + 1)..self.input_version.num_levels()).all(|level| {
            !self
                .input_version
                .files(level)
                .iter()
                .any(|f| f.overlaps_user_range(Some(user_key), Some(user_key)))
        })
    }

    /// Record the removal of every input in `edit`
    pub fn add_input_deletions(&self, edit: &mut VersionEdit) {
        for file in &self.inputs[0] {
            edit.delete_file(self.start_level, file.number());
        }
        for file in &self.inputs[1] {
            edit.delete_file(self.output_level, file.number());
        }
    }

    /// Claim (or release) every input so no concurrent compaction picks it
    pub fn mark_files_being_compacted(&self, value: bool) {
        for file in self.all_inputs() {
            debug_assert!(!value || !file.is_being_compacted());
            file.set_being_compacted(value);
        }
    }

    /// `L1 [3 files] -> L2 [2 files]`
    pub fn summary(&self) -> String {
        format!(
            "L{} [{} files] -> L{} [{} files]",
            self.start_level,
            self.inputs[0].len(),
            self.output_level,
            self.inputs[1].len()
        )
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("cf_id", &self.cf_id)
            .field("summary", &self.summary())
            .field("score", &self.score)
            .field("manual", &self.is_manual)
            .finish()
    }
}

/// A caller-requested compaction of one key range from one level
#[derive(Debug)]
pub struct ManualCompaction {
    pub cf_id: ColumnFamilyId,
    pub input_level: usize,
    pub output_level: usize,
    pub output_path_id: u32,
    /// `None` means unbounded
    pub begin: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    pub in_progress: bool,
    pub done: bool,
    pub status: Option<TierError>,
}

impl ManualCompaction {
    pub fn new(
        cf_id: ColumnFamilyId,
        input_level: usize,
        output_level: usize,
        output_path_id: u32,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Self {
        Self {
            cf_id,
            input_level,
            output_level,
            output_path_id,
            begin: begin.map(|b| b.to_vec()),
            end: end.map(|e| e.to_vec()),
            in_progress: false,
            done: false,
            status: None,
        }
    }

    /// Stop the compaction at the next file boundary.
    ///
    /// A round already running keeps `in_progress` until it returns.
    pub fn cancel(&mut self) {
        self.done = true;
    }
}
