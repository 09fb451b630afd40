//! Applies edits to a base version to produce the next one

use super::{FileMetaData, Version, VersionEdit};
use crate::{Result, TierError};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added: Vec<Arc<FileMetaData>>,
}

/// Accumulates any number of edits on top of `base`
pub struct VersionBuilder {
    base: Arc<Version>,
    levels: Vec<LevelState>,
}

impl VersionBuilder {
    pub fn new(base: Arc<Version>) -> Self {
        let levels = (0..base.num_levels()).map(|_| LevelState::default()).collect();
        Self { base, levels }
    }

    /// Fold one edit's file changes into the builder
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        let num_levels = self.levels.len();
        for &(level, number) in &edit.deleted_files {
            let state = self.levels.get_mut(level).ok_or_else(|| {
                TierError::Corruption(format!(
                    "edit deletes file {} at level {} beyond {} levels",
                    number, level, num_levels
                ))
            })?;
            state.deleted.insert(number);
            state.added.retain(|f| f.number() != number);
        }

        for (level, file) in &edit.new_files {
            let state = self.levels.get_mut(*level).ok_or_else(|| {
                TierError::Corruption(format!(
                    "edit adds file {} at level {} beyond {} levels",
                    file.number(),
                    level,
                    num_levels
                ))
            })?;
            state.deleted.remove(&file.number());
            // a moved file arrives still claimed by the compaction that moved it
            let file = file.clone();
            file.set_being_compacted(false);
            state.added.push(Arc::new(file));
        }
        Ok(())
    }

    /// Build the resulting version.
    ///
    /// Also returns the base files the new version no longer lists.
    pub fn save(self, version_number: u64) -> Result<(Version, Vec<Arc<FileMetaData>>)> {
        let mut removed = Vec::new();
        let mut files = Vec::with_capacity(self.levels.len());
        // A file deleted at one level and added at another was moved, not removed
        let re_added: HashSet<u64> = self
            .levels
            .iter()
            .flat_map(|s| s.added.iter().map(|f| f.number()))
            .collect();

        for (level, state) in self.levels.into_iter().enumerate() {
            let mut level_files: Vec<Arc<FileMetaData>> = Vec::new();
            for file in self.base.files(level) {
                if state.deleted.contains(&file.number()) {
                    if !re_added.contains(&file.number()) {
                        removed.push(Arc::clone(file));
                    }
                } else {
                    level_files.push(Arc::clone(file));
                }
            }
            level_files.extend(state.added);

            if level == 0 {
                level_files.sort_by(|a, b| {
                    b.largest_seq
                        .cmp(&a.largest_seq)
                        .then_with(|| b.number().cmp(&a.number()))
                });
            } else {
                level_files.sort_by(|a, b| a.smallest.cmp(&b.smallest));
            }
            files.push(level_files);
        }

        let version = Version::from_levels(self.base.cf_id(), version_number, files);
        version.check_consistency()?;
        Ok((version, removed))
    }
}
