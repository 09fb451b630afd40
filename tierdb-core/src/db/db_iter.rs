//! User-facing iteration over one column family

use super::column_family::SuperVersion;
use crate::iterator::{BoxedIterator, InternalIterator, MergingIterator};
use crate::table::{TableCache, TableReadOptions};
use crate::types::{InternalKey, SequenceNumber, ValueType};
use crate::{Result, TierError};
use std::sync::Arc;

/// Ordered cursor over the user keys visible at one sequence number.
///
/// Merges the memtables and tables pinned by a superversion; those stay
/// readable for as long as the iterator lives, whatever flushes and
/// compactions do meanwhile. Deleted keys are skipped and merge operands are
/// folded into a single value.
pub struct DbIterator {
    // keeps the memtables and table files under `inner` alive
    _super_version: Arc<SuperVersion>,
    inner: MergingIterator,
    sequence: SequenceNumber,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    status: Option<TierError>,
}

impl DbIterator {
    pub(crate) fn new(
        super_version: Arc<SuperVersion>,
        table_cache: &Arc<TableCache>,
        sequence: SequenceNumber,
        opts: TableReadOptions,
    ) -> Result<Self> {
        let mut children: Vec<BoxedIterator> = Vec::with_capacity(2 + super_version.imm.len());
        children.push(Box::new(super_version.mem.iter()));
        for mem in &super_version.imm {
            children.push(Box::new(mem.iter()));
        }
        super_version
            .current
            .add_iterators(table_cache, opts, &mut children)?;

        Ok(Self {
            _super_version: super_version,
            inner: MergingIterator::new(children),
            sequence,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            status: None,
        })
    }

    /// Sequence number this iterator reads at
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key. Only meaningful while `valid()`.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Current value. Only meaningful while `valid()`.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Position at the first visible key
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.status = None;
        let result = self
            .inner
            .seek_to_first()
            .and_then(|_| self.find_next_user_entry(None));
        self.record(result)
    }

    /// Position at the first visible key >= `target`
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.status = None;
        let lookup = InternalKey::lookup(target, self.sequence);
        let result = self
            .inner
            .seek(&lookup)
            .and_then(|_| self.find_next_user_entry(None));
        self.record(result)
    }

    /// Advance to the next visible key
    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Err(TierError::InvalidArgument(
                "next called on an unpositioned iterator".into(),
            ));
        }
        let skip = std::mem::take(&mut self.key);
        let result = self.find_next_user_entry(Some(skip));
        self.record(result)
    }

    /// The error that stopped iteration, if any
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }

    /// Drain the remaining entries from the current position
    pub fn collect_remaining(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        while self.valid {
            out.push((self.key.clone(), self.value.clone()));
            self.next()?;
        }
        Ok(out)
    }

    fn record(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            self.valid = false;
            self.status = Some(e.duplicate());
        }
        result
    }

    /// Move `inner` to the newest visible entry of the next user key that
    /// is not `skip` and not deleted, and materialize it.
    fn find_next_user_entry(&mut self, mut skip: Option<Vec<u8>>) -> Result<()> {
        self.valid = false;
        while self.inner.is_valid() {
            let key = self.inner.key();
            if key.sequence > self.sequence
                || skip.as_deref() == Some(key.user_key.as_slice())
            {
                self.inner.next()?;
                continue;
            }
            match key.value_type {
                ValueType::Deletion => {
                    skip = Some(key.user_key.clone());
                    self.inner.next()?;
                }
                ValueType::Value => {
                    self.key = key.user_key.clone();
                    self.value = self.inner.value().to_vec();
                    self.valid = true;
                    return Ok(());
                }
                ValueType::Merge => {
                    self.key = key.user_key.clone();
                    self.merge_value()?;
                    self.valid = true;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Fold the merge operands starting at the current entry with the
    /// newest older base value of the same key
    fn merge_value(&mut self) -> Result<()> {
        let operator = self
            ._super_version
            .options
            .merge_operator
            .clone()
            .ok_or_else(|| {
                TierError::InvalidArgument(
                    "merge entry found but no merge operator is configured".into(),
                )
            })?;

        // newest first while collecting
        let mut operands = vec![self.inner.value().to_vec()];
        let mut base = None;
        self.inner.next()?;
        while self.inner.is_valid() {
            let key = self.inner.key();
            if key.user_key != self.key {
                break;
            }
            match key.value_type {
                ValueType::Merge => operands.push(self.inner.value().to_vec()),
                ValueType::Value => {
                    base = Some(self.inner.value().to_vec());
                    break;
                }
                ValueType::Deletion => break,
            }
            self.inner.next()?;
        }
        operands.reverse();

        self.value = operator
            .full_merge(&self.key, base.as_deref(), &operands)
            .ok_or_else(|| {
                TierError::Corruption(format!("merge operator {} failed", operator.name()))
            })?;
        Ok(())
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("sequence", &self.sequence)
            .field("valid", &self.valid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::get_context::tests::ConcatMerge;
    use crate::memtable::MemTable;
    use crate::options::ColumnFamilyOptions;
    use crate::version::Version;
    use tempfile::TempDir;

    fn super_version(mems: Vec<Arc<MemTable>>, options: ColumnFamilyOptions) -> Arc<SuperVersion> {
        let mut mems = mems.into_iter();
        let mem = mems.next().unwrap();
        Arc::new(SuperVersion {
            mem,
            imm: mems.collect(),
            current: Arc::new(Version::new(0, 7)),
            options: Arc::new(options),
            number: 1,
        })
    }

    fn scan(iter: &mut DbIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        iter.seek_to_first().unwrap();
        iter.collect_remaining().unwrap()
    }

    #[test]
    fn test_visibility_and_deletes() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TableCache::new(dir.path(), Vec::new(), Some(10), 1, None));

        let mem = Arc::new(MemTable::new(2));
        mem.add(4, ValueType::Deletion, b"b", b"");
        mem.add(5, ValueType::Value, b"c", b"c5");
        let imm = Arc::new(MemTable::new(1));
        imm.add(1, ValueType::Value, b"a", b"a1");
        imm.add(2, ValueType::Value, b"b", b"b2");
        imm.add(3, ValueType::Value, b"a", b"a3");
        let sv = super_version(vec![mem, imm], ColumnFamilyOptions::default());

        let mut latest = DbIterator::new(Arc::clone(&sv), &cache, 5, TableReadOptions::default()).unwrap();
        assert_eq!(
            scan(&mut latest),
            vec![
                (b"a".to_vec(), b"a3".to_vec()),
                (b"c".to_vec(), b"c5".to_vec()),
            ]
        );

        let mut old = DbIterator::new(sv, &cache, 2, TableReadOptions::default()).unwrap();
        assert_eq!(
            scan(&mut old),
            vec![
                (b"a".to_vec(), b"a1".to_vec()),
                (b"b".to_vec(), b"b2".to_vec()),
            ]
        );

        old.seek(b"b").unwrap();
        assert!(old.valid());
        assert_eq!(old.key(), b"b");
        old.next().unwrap();
        assert!(!old.valid());
    }

    #[test]
    fn test_merge_operands_fold() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TableCache::new(dir.path(), Vec::new(), Some(10), 1, None));

        let mem = Arc::new(MemTable::new(1));
        mem.add(1, ValueType::Value, b"k", b"base");
        mem.add(2, ValueType::Merge, b"k", b"x");
        mem.add(3, ValueType::Merge, b"k", b"y");
        mem.add(4, ValueType::Value, b"z", b"last");
        let options = ColumnFamilyOptions {
            merge_operator: Some(Arc::new(ConcatMerge)),
            ..Default::default()
        };
        let sv = super_version(vec![mem], options);

        let mut iter = DbIterator::new(sv, &cache, 4, TableReadOptions::default()).unwrap();
        assert_eq!(
            scan(&mut iter),
            vec![
                (b"k".to_vec(), b"base,x,y".to_vec()),
                (b"z".to_vec(), b"last".to_vec()),
            ]
        );
    }

    #[test]
    fn test_merge_without_operator_fails() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TableCache::new(dir.path(), Vec::new(), Some(10), 1, None));
        let mem = Arc::new(MemTable::new(1));
        mem.add(1, ValueType::Merge, b"k", b"x");
        let sv = super_version(vec![mem], ColumnFamilyOptions::default());

        let mut iter = DbIterator::new(sv, &cache, 1, TableReadOptions::default()).unwrap();
        assert!(iter.seek_to_first().is_err());
        assert!(!iter.valid());
        assert!(iter.status().is_err());
    }
}
