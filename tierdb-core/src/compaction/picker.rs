//! Level compaction picking
//!
//! Each level gets a score: file count over the trigger at level 0, bytes over
//! the level target elsewhere. The highest score at or above 1.0 wins, ties
//! going to the shallower level.

use super::Compaction;
use crate::options::ColumnFamilyOptions;
use crate::version::{FileMetaData, Version};
use std::sync::Arc;
use tracing::debug;

/// Outcome of picking a manual compaction round
#[derive(Debug)]
pub enum ManualPick {
    /// Work to run now
    Ready(Compaction),
    /// Nothing in the range at the input level
    Empty,
    /// Some input is claimed by a running compaction; retry later
    Conflict,
}

/// Score every level that can be compacted, highest first
pub fn level_scores(version: &Version, options: &ColumnFamilyOptions) -> Vec<(usize, f64)> {
    let last = version.num_levels().saturating_sub(1);
    let mut scores: Vec<(usize, f64)> = (0..last)
        .map(|level| {
            let score = if level == 0 {
                let files = version
                    .files(0)
                    .iter()
                    .filter(|f| !f.is_being_compacted())
                    .count();
                files as f64 / options.level0_file_num_compaction_trigger.max(1) as f64
            } else {
                let bytes: u64 = version
                    .files(level)
                    .iter()
                    .filter(|f| !f.is_being_compacted())
                    .map(|f| f.file_size())
                    .sum();
                bytes as f64 / options.max_bytes_for_level(level).max(1) as f64
            };
            (level, score)
        })
        .collect();
    // stable sort keeps the shallower level first on ties
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scores
}

/// Is any level over its target?
pub fn needs_compaction(version: &Version, options: &ColumnFamilyOptions) -> bool {
    if options.disable_auto_compactions {
        return false;
    }
    level_scores(version, options)
        .first()
        .map_or(false, |&(_, score)| score >= 1.0)
}

/// Pick the next automatic compaction, claiming its inputs.
///
/// Returns `None` when no level is over target or every candidate conflicts
/// with a running compaction.
pub fn pick_compaction(version: &Arc<Version>, options: &ColumnFamilyOptions) -> Option<Compaction> {
    if options.disable_auto_compactions {
        return None;
    }
    for (level, score) in level_scores(version, options) {
        if score < 1.0 {
            break;
        }
        let picked = if level == 0 {
            pick_level0(version, options, score)
        } else {
            pick_level(version, options, level, score)
        };
        if let Some(compaction) = picked {
            compaction.mark_files_being_compacted(true);
            debug!(
                cf = compaction.cf_id(),
                score,
                summary = %compaction.summary(),
                "Picked compaction"
            );
            return Some(compaction);
        }
    }
    None
}

/// Candidates at `level`, largest compensated size first
fn files_by_compensated_size(version: &Version, level: usize) -> Vec<Arc<FileMetaData>> {
    let mut files: Vec<Arc<FileMetaData>> = version
        .files(level)
        .iter()
        .filter(|f| !f.is_being_compacted())
        .cloned()
        .collect();
    files.sort_by(|a, b| b.compensated_size.cmp(&a.compensated_size));
    files
}

fn user_key_range(files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
    let smallest = files
        .iter()
        .map(|f| f.smallest_user_key())
        .min()
        .unwrap_or_default();
    let largest = files
        .iter()
        .map(|f| f.largest_user_key())
        .max()
        .unwrap_or_default();
    (smallest.to_vec(), largest.to_vec())
}

fn any_being_compacted(files: &[Arc<FileMetaData>]) -> bool {
    files.iter().any(|f| f.is_being_compacted())
}

fn pick_level0(version: &Arc<Version>, options: &ColumnFamilyOptions, score: f64) -> Option<Compaction> {
    // level 0 files overlap, so only one level 0 compaction runs at a time
    if any_being_compacted(version.files(0)) {
        return None;
    }
    let seed = files_by_compensated_size(version, 0).into_iter().next()?;
    let inputs = version.overlapping_inputs(
        0,
        Some(seed.smallest_user_key()),
        Some(seed.largest_user_key()),
    );
    let (smallest, largest) = user_key_range(&inputs);
    let outputs = version.overlapping_inputs(1, Some(&smallest), Some(&largest));
    if any_being_compacted(&outputs) {
        return None;
    }
    Some(Compaction::new(
        version.cf_id(),
        Arc::clone(version),
        0,
        1,
        inputs,
        outputs,
        options,
        0,
        score,
        false,
    ))
}

fn pick_level(
    version: &Arc<Version>,
    options: &ColumnFamilyOptions,
    level: usize,
    score: f64,
) -> Option<Compaction> {
    for file in files_by_compensated_size(version, level) {
        let outputs = version.overlapping_inputs(
            level + 1,
            Some(file.smallest_user_key()),
            Some(file.largest_user_key()),
        );
        if any_being_compacted(&outputs) {
            continue;
        }
        return Some(Compaction::new(
            version.cf_id(),
            Arc::clone(version),
            level,
            level + 1,
            vec![file],
            outputs,
            options,
            0,
            score,
            false,
        ));
    }
    None
}

/// Pick one round of a manual compaction over `[begin, end]`.
///
/// Above level 0 the round stops once its inputs reach one output file's
/// worth of data. The returned compaction's `manual_end` is then the smallest
/// key of the first file left out, where the next round begins. Files in a
/// level never share a user key, so every round moves strictly forward.
#[allow(clippy::too_many_arguments)]
pub fn compact_range(
    version: &Arc<Version>,
    options: &ColumnFamilyOptions,
    input_level: usize,
    output_level: usize,
    output_path_id: u32,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
) -> ManualPick {
    let mut inputs = version.overlapping_inputs(input_level, begin, end);
    if inputs.is_empty() {
        return ManualPick::Empty;
    }

    let mut manual_end = None;
    if input_level > 0 {
        let limit = options.max_file_size_for_level(input_level);
        let mut total = 0u64;
        for i in 0..inputs.len() {
            total += inputs[i].file_size();
            if total >= limit && i + 1 < inputs.len() {
                manual_end = Some(inputs[i + 1].smallest_user_key().to_vec());
                inputs.truncate(i + 1);
                break;
            }
        }
    }
    if any_being_compacted(&inputs) {
        return ManualPick::Conflict;
    }

    let outputs = if output_level != input_level {
        let (smallest, largest) = user_key_range(&inputs);
        version.overlapping_inputs(output_level, Some(&smallest), Some(&largest))
    } else {
        Vec::new()
    };
    if any_being_compacted(&outputs) {
        return ManualPick::Conflict;
    }

    let mut compaction = Compaction::new(
        version.cf_id(),
        Arc::clone(version),
        input_level,
        output_level,
        inputs,
        outputs,
        options,
        output_path_id,
        0.0,
        true,
    );
    compaction.manual_end = manual_end;
    compaction.mark_files_being_compacted(true);
    ManualPick::Ready(compaction)
}
