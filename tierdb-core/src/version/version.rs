//! Immutable per-level file listing of one column family

use super::FileMetaData;
use crate::get_context::GetContext;
use crate::iterator::{BoxedIterator, LevelIterator};
use crate::options::ColumnFamilyOptions;
use crate::table::{TableCache, TableIterSource, TableReadOptions};
use crate::types::{ColumnFamilyId, InternalKey};
use crate::{Result, TierError};
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

/// One snapshot of the LSM tree's files.
///
/// Level 0 is ordered newest first and may overlap; every deeper level is
/// sorted by smallest key with disjoint user-key ranges.
pub struct Version {
    cf_id: ColumnFamilyId,
    version_number: u64,
    files: Vec<Vec<Arc<FileMetaData>>>,
}

impl Version {
    /// An empty version with `num_levels` levels
    pub fn new(cf_id: ColumnFamilyId, num_levels: usize) -> Self {
        Self {
            cf_id,
            version_number: 0,
            files: vec![Vec::new(); num_levels],
        }
    }

    pub(crate) fn from_levels(
        cf_id: ColumnFamilyId,
        version_number: u64,
        files: Vec<Vec<Arc<FileMetaData>>>,
    ) -> Self {
        Self {
            cf_id,
            version_number,
            files,
        }
    }

    pub fn cf_id(&self) -> ColumnFamilyId {
        self.cf_id
    }

    pub fn version_number(&self) -> u64 {
        self.version_number
    }

    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        self.files.get(level).map(|f| f.as_slice()).unwrap_or(&[])
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.files(level).len()
    }

    pub fn num_files(&self) -> usize {
        self.files.iter().map(|f| f.len()).sum()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files(level).iter().map(|f| f.file_size()).sum()
    }

    /// Deepest level holding any file
    pub fn max_level_with_files(&self) -> Option<usize> {
        (0..self.num_levels()).rev().find(|l| self.num_level_files(*l) > 0)
    }

    /// Add every file number this version references to `live`
    pub fn add_live_files(&self, live: &mut HashSet<u64>) {
        for level in &self.files {
            live.extend(level.iter().map(|f| f.number()));
        }
    }

    /// Look `lookup` up level by level, newest data first.
    ///
    /// Returns `true` when some table resolved the lookup.
    pub fn get(
        &self,
        table_cache: &TableCache,
        lookup: &InternalKey,
        ctx: &mut GetContext<'_>,
        opts: TableReadOptions,
    ) -> Result<bool> {
        let user_key = lookup.user_key.as_slice();

        for file in self.files(0) {
            if user_key < file.smallest_user_key() || user_key > file.largest_user_key() {
                continue;
            }
            if table_cache.get(&file.fd, lookup, ctx, opts)? {
                return Ok(true);
            }
        }

        for level in 1..self.num_levels() {
            let files = self.files(level);
            let index = files.partition_point(|f| f.largest_user_key() < user_key);
            let Some(file) = files.get(index) else {
                continue;
            };
            if user_key < file.smallest_user_key() {
                continue;
            }
            if table_cache.get(&file.fd, lookup, ctx, opts)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Bloom-only check: can any table hold `user_key`?
    pub fn key_may_exist(&self, table_cache: &TableCache, user_key: &[u8]) -> Result<bool> {
        for level in 0..self.num_levels() {
            for file in self.files(level) {
                if file.overlaps_user_range(Some(user_key), Some(user_key))
                    && table_cache.key_may_match(&file.fd, user_key)?
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Push one iterator per level-0 file and one concatenating iterator per deeper level
    pub fn add_iterators(
        &self,
        table_cache: &Arc<TableCache>,
        opts: TableReadOptions,
        out: &mut Vec<BoxedIterator>,
    ) -> Result<()> {
        for file in self.files(0) {
            out.push(table_cache.new_iterator(&file.fd, opts)?);
        }
        let source = Arc::new(TableIterSource::new(Arc::clone(table_cache), opts));
        for level in 1..self.num_levels() {
            if !self.files(level).is_empty() {
                out.push(Box::new(LevelIterator::new(
                    self.files(level).to_vec(),
                    source.clone(),
                )));
            }
        }
        Ok(())
    }

    /// Files at `level` whose user-key range touches `[begin, end]`.
    ///
    /// At level 0 the range grows to cover every overlapping file, since
    /// those files may overlap each other.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let files = self.files(level);

        'restart: loop {
            let mut inputs = Vec::new();
            for file in files {
                if !file.overlaps_user_range(begin.as_deref(), end.as_deref()) {
                    continue;
                }
                if level == 0 {
                    if matches!(&begin, Some(b) if file.smallest_user_key() < b.as_slice()) {
                        begin = Some(file.smallest_user_key().to_vec());
                        continue 'restart;
                    }
                    if matches!(&end, Some(e) if file.largest_user_key() > e.as_slice()) {
                        end = Some(file.largest_user_key().to_vec());
                        continue 'restart;
                    }
                }
                inputs.push(Arc::clone(file));
            }
            return inputs;
        }
    }

    /// Does any file at `level` touch `[smallest, largest]`?
    pub fn overlap_in_level(&self, level: usize, smallest: &[u8], largest: &[u8]) -> bool {
        self.files(level)
            .iter()
            .any(|f| f.overlaps_user_range(Some(smallest), Some(largest)))
    }

    /// Shallowest level above `level` that is empty all the way down and
    /// large enough to take `level`'s bytes
    pub fn find_minimum_empty_level_fitting(
        &self,
        level: usize,
        options: &ColumnFamilyOptions,
    ) -> usize {
        let bytes = self.level_bytes(level);
        let mut minimum = level;
        for candidate in (1..level).rev() {
            if self.num_level_files(candidate) > 0 {
                break;
            }
            if options.max_bytes_for_level(candidate) < bytes {
                break;
            }
            minimum = candidate;
        }
        minimum
    }

    /// Can every file at `from` be moved to `to` without breaking level order?
    pub fn can_refit_level(&self, from: usize, to: usize) -> bool {
        if to >= self.num_levels() || from >= self.num_levels() {
            return false;
        }
        if to == from {
            return true;
        }
        if to == 0 {
            return false;
        }
        // Every level strictly between the two must be empty, and so must the target.
        let (lo, hi) = if from < to { (from + 1, to) } else { (to, from - 1) };
        if (lo..=hi).any(|l| self.num_level_files(l) > 0) {
            return false;
        }
        let mut files: Vec<&Arc<FileMetaData>> = self.files(from).iter().collect();
        files.sort_by(|a, b| a.smallest.cmp(&b.smallest));
        files
            .windows(2)
            .all(|w| w[0].largest_user_key() < w[1].smallest_user_key())
    }

    /// Verify the ordering rules every version must satisfy
    pub fn check_consistency(&self) -> Result<()> {
        for (level, files) in self.files.iter().enumerate() {
            for file in files {
                if file.smallest > file.largest {
                    return Err(TierError::Corruption(format!(
                        "level {} file {} has smallest key after largest",
                        level,
                        file.number()
                    )));
                }
                if file.smallest_seq > file.largest_seq {
                    return Err(TierError::Corruption(format!(
                        "level {} file {} has inverted sequence range",
                        level,
                        file.number()
                    )));
                }
            }
            if level == 0 {
                if files.windows(2).any(|w| w[0].largest_seq < w[1].largest_seq) {
                    return Err(TierError::Corruption(
                        "level 0 files are not ordered newest first".into(),
                    ));
                }
                continue;
            }
            for pair in files.windows(2) {
                if pair[0].largest_user_key() >= pair[1].smallest_user_key() {
                    return Err(TierError::Corruption(format!(
                        "level {} files {} and {} overlap or are out of order",
                        level,
                        pair[0].number(),
                        pair[1].number()
                    )));
                }
            }
        }
        Ok(())
    }

    /// `files[ n0 n1 ... ]`
    pub fn level_summary(&self) -> String {
        let mut out = String::from("files[");
        for level in &self.files {
            let _ = write!(out, " {}", level.len());
        }
        out.push_str(" ]");
        out
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("cf_id", &self.cf_id)
            .field("number", &self.version_number)
            .field("levels", &self.level_summary())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;
    use crate::version::FileDescriptor;

    fn file(number: u64, lo: &str, hi: &str, size: u64) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            FileDescriptor::new(number, 0, size),
            InternalKey::new(lo.as_bytes().to_vec(), number, ValueType::Value),
            InternalKey::new(hi.as_bytes().to_vec(), number, ValueType::Value),
            number,
            number,
        ))
    }

    fn version(levels: Vec<Vec<Arc<FileMetaData>>>) -> Version {
        Version::from_levels(0, 1, levels)
    }

    #[test]
    fn test_overlapping_inputs_expands_level0() {
        let v = version(vec![
            vec![file(3, "c", "e", 1), file(2, "a", "d", 1), file(1, "x", "z", 1)],
            vec![file(4, "a", "b", 1), file(5, "f", "h", 1)],
        ]);
        let inputs = v.overlapping_inputs(0, Some(b"e"), Some(b"e"));
        let mut numbers: Vec<u64> = inputs.iter().map(|f| f.number()).collect();
        numbers.sort();
        assert_eq!(numbers, vec![2, 3]);

        let inputs = v.overlapping_inputs(1, Some(b"c"), Some(b"g"));
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].number(), 5);
        assert_eq!(v.overlapping_inputs(1, None, None).len(), 2);
    }

    #[test]
    fn test_check_consistency() {
        let good = version(vec![vec![], vec![file(1, "a", "c", 1), file(2, "d", "f", 1)]]);
        assert!(good.check_consistency().is_ok());

        let overlapping = version(vec![vec![], vec![file(1, "a", "d", 1), file(2, "d", "f", 1)]]);
        assert!(overlapping.check_consistency().is_err());

        let unordered_l0 = version(vec![vec![file(1, "a", "b", 1), file(2, "a", "b", 1)], vec![]]);
        assert!(unordered_l0.check_consistency().is_err());
    }

    #[test]
    fn test_refit_and_minimum_level() {
        let opts = ColumnFamilyOptions {
            max_bytes_for_level_base: 1000,
            ..Default::default()
        };
        let v = version(vec![
            vec![],
            vec![],
            vec![],
            vec![file(1, "a", "c", 100), file(2, "d", "f", 100)],
            vec![],
        ]);
        assert_eq!(v.find_minimum_empty_level_fitting(3, &opts), 1);
        assert!(v.can_refit_level(3, 1));
        assert!(v.can_refit_level(3, 4));
        assert!(!v.can_refit_level(3, 0));

        let small = ColumnFamilyOptions {
            max_bytes_for_level_base: 50,
            max_bytes_for_level_multiplier: 10,
            ..Default::default()
        };
        assert_eq!(v.find_minimum_empty_level_fitting(3, &small), 2);

        let blocked = version(vec![vec![], vec![file(9, "x", "y", 1)], vec![], vec![file(1, "a", "c", 1)]]);
        assert!(!blocked.can_refit_level(3, 1));
        assert_eq!(blocked.find_minimum_empty_level_fitting(3, &opts), 2);
    }

    #[test]
    fn test_level_summary() {
        let v = version(vec![vec![file(1, "a", "b", 10)], vec![], vec![file(2, "a", "b", 5)]]);
        assert_eq!(v.level_summary(), "files[ 1 0 1 ]");
        assert_eq!(v.level_bytes(0), 10);
        assert_eq!(v.max_level_with_files(), Some(2));
        assert_eq!(v.num_files(), 2);
    }
}
