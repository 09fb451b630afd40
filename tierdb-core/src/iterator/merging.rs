//! K-way merge of sorted iterators

use super::{BoxedIterator, InternalIterator};
use crate::types::InternalKey;
use crate::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct HeapEntry {
    key: InternalKey,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the max-heap pops the smallest key; the lower child index
    // (newer source) wins ties
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Merges children into one stream in internal-key order.
///
/// Every version of every key is yielded; visibility filtering belongs to
/// the consumer. Children are given newest source first.
pub struct MergingIterator {
    children: Vec<BoxedIterator>,
    heap: BinaryHeap<HeapEntry>,
    current: Option<usize>,
}

impl MergingIterator {
    pub fn new(children: Vec<BoxedIterator>) -> Self {
        let capacity = children.len();
        Self {
            children,
            heap: BinaryHeap::with_capacity(capacity),
            current: None,
        }
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for (index, child) in self.children.iter().enumerate() {
            if child.is_valid() {
                self.heap.push(HeapEntry {
                    key: child.key().clone(),
                    index,
                });
            }
        }
        self.current = self.heap.peek().map(|e| e.index);
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }
}

impl InternalIterator for MergingIterator {
    fn key(&self) -> &InternalKey {
        match self.current {
            Some(i) => self.children[i].key(),
            None => panic!("key() on an exhausted MergingIterator"),
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].value(),
            None => panic!("value() on an exhausted MergingIterator"),
        }
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        let index = match self.current {
            Some(i) => i,
            None => return Ok(()),
        };
        self.heap.pop();
        let child = &mut self.children[index];
        child.next()?;
        if child.is_valid() {
            self.heap.push(HeapEntry {
                key: child.key().clone(),
                index,
            });
        }
        self.current = self.heap.peek().map(|e| e.index);
        Ok(())
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        for child in &mut self.children {
            child.seek(target)?;
        }
        self.rebuild();
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.rebuild();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::{collect_entries, VecIterator};
    use crate::types::ValueType;

    fn source(entries: &[(&str, u64)]) -> BoxedIterator {
        let entries = entries
            .iter()
            .map(|(k, seq)| {
                (
                    InternalKey::new(k.as_bytes().to_vec(), *seq, ValueType::Value),
                    format!("{}@{}", k, seq).into_bytes(),
                )
            })
            .collect();
        Box::new(VecIterator::new(entries))
    }

    #[test]
    fn test_merge_orders_all_versions() {
        let mut merged = MergingIterator::new(vec![
            source(&[("a", 9), ("c", 7)]),
            source(&[("a", 5), ("b", 4)]),
            source(&[]),
            source(&[("c", 2), ("d", 1)]),
        ]);
        merged.seek_to_first().unwrap();

        let keys: Vec<(Vec<u8>, u64)> = collect_entries(&mut merged)
            .unwrap()
            .into_iter()
            .map(|(k, _)| (k.user_key, k.sequence))
            .collect();
        assert_eq!(
            keys,
            vec![
                (b"a".to_vec(), 9),
                (b"a".to_vec(), 5),
                (b"b".to_vec(), 4),
                (b"c".to_vec(), 7),
                (b"c".to_vec(), 2),
                (b"d".to_vec(), 1),
            ]
        );
    }

    #[test]
    fn test_merge_seek() {
        let mut merged = MergingIterator::new(vec![
            source(&[("a", 9), ("c", 7)]),
            source(&[("b", 4), ("c", 3)]),
        ]);
        merged.seek(&InternalKey::lookup(b"c", 5)).unwrap();
        assert!(merged.is_valid());
        assert_eq!(merged.key().sequence, 3);
        merged.next().unwrap();
        assert!(!merged.is_valid());
    }
}
