//! Iteration over internal keys
//!
//! Every sorted source (memtable, table, level, merged view) implements
//! [`InternalIterator`], so merging and compaction take
//! `Vec<Box<dyn InternalIterator>>` regardless of where entries live.

mod level;
mod merging;

pub use level::{LevelIterator, TableIterFactory};
pub use merging::MergingIterator;

use crate::types::InternalKey;
use crate::Result;

/// A positioned cursor over internal keys in ascending internal-key order.
pub trait InternalIterator: Send {
    /// Current key. Only meaningful while `is_valid()`.
    fn key(&self) -> &InternalKey;

    /// Current value. Only meaningful while `is_valid()`.
    fn value(&self) -> &[u8];

    /// True while positioned at an entry
    fn is_valid(&self) -> bool;

    /// Advance to the next entry
    fn next(&mut self) -> Result<()>;

    /// Position at the first entry with key >= `target`
    fn seek(&mut self, target: &InternalKey) -> Result<()>;

    /// Position at the first entry
    fn seek_to_first(&mut self) -> Result<()>;
}

pub type BoxedIterator = Box<dyn InternalIterator>;

/// An iterator over an owned, sorted list of entries
pub struct VecIterator {
    entries: Vec<(InternalKey, Vec<u8>)>,
    pos: usize,
}

impl VecIterator {
    /// `entries` must already be in internal-key order
    pub fn new(entries: Vec<(InternalKey, Vec<u8>)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        let pos = entries.len();
        Self { entries, pos }
    }
}

impl InternalIterator for VecIterator {
    fn key(&self) -> &InternalKey {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }

    fn is_valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn next(&mut self) -> Result<()> {
        if self.is_valid() {
            self.pos += 1;
        }
        Ok(())
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        self.pos = self.entries.partition_point(|(k, _)| k < target);
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }
}

/// Drain an iterator from its current position
pub fn collect_entries(iter: &mut dyn InternalIterator) -> Result<Vec<(InternalKey, Vec<u8>)>> {
    let mut out = Vec::new();
    while iter.is_valid() {
        out.push((iter.key().clone(), iter.value().to_vec()));
        iter.next()?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    #[test]
    fn test_vec_iterator_seek() {
        let entries = vec![
            (InternalKey::new(b"a".to_vec(), 3, ValueType::Value), b"1".to_vec()),
            (InternalKey::new(b"b".to_vec(), 9, ValueType::Value), b"2".to_vec()),
            (InternalKey::new(b"b".to_vec(), 2, ValueType::Deletion), vec![]),
        ];
        let mut iter = VecIterator::new(entries);
        assert!(!iter.is_valid());

        iter.seek(&InternalKey::lookup(b"b", 5)).unwrap();
        assert_eq!(iter.key().sequence, 2);

        iter.seek_to_first().unwrap();
        assert_eq!(collect_entries(&mut iter).unwrap().len(), 3);
    }
}
