//! MemTable implementation using a concurrent skip list
//!
//! The MemTable holds recent writes in internal-key order. The active
//! memtable of a column family takes inserts from the write-group leader
//! while readers scan it concurrently; once full it becomes immutable and
//! waits in the [`MemTableList`] until a flush turns it into a level-0 table.

use crate::get_context::GetContext;
use crate::iterator::InternalIterator;
use crate::types::{InternalKey, SequenceNumber, ValueType};
use crate::Result;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-entry bookkeeping overhead added to the memory estimate
const ENTRY_OVERHEAD: usize = 32;

/// MemTable for in-memory writes
pub struct MemTable {
    /// Unique ID for this memtable
    id: u64,
    data: SkipMap<InternalKey, Bytes>,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    num_entries: AtomicU64,
    num_deletes: AtomicU64,
    /// Sequence of the first insert (0 while empty)
    first_sequence: AtomicU64,

    // Flush bookkeeping, changed only under the engine lock
    flush_in_progress: AtomicBool,
    flush_completed: AtomicBool,
    file_number: AtomicU64,
    /// WAL that became current when this memtable was switched out
    next_log_number: AtomicU64,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            id,
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            first_sequence: AtomicU64::new(0),
            flush_in_progress: AtomicBool::new(false),
            flush_completed: AtomicBool::new(false),
            file_number: AtomicU64::new(0),
            next_log_number: AtomicU64::new(0),
        }
    }

    /// Get the MemTable ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert one entry
    pub fn add(&self, sequence: SequenceNumber, value_type: ValueType, key: &[u8], value: &[u8]) {
        let ikey = InternalKey::new(key.to_vec(), sequence, value_type);
        let entry_size = ikey.size() + value.len() + ENTRY_OVERHEAD;

        self.data.insert(ikey, Bytes::copy_from_slice(value));
        self.size_bytes.fetch_add(entry_size, Ordering::Relaxed);
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        if value_type == ValueType::Deletion {
            self.num_deletes.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.first_sequence.compare_exchange(
            0,
            sequence,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Feed every entry for `user_key` visible at `sequence` into `ctx`.
    ///
    /// Returns `true` once the lookup is resolved and older sources can be skipped.
    pub fn get(&self, user_key: &[u8], sequence: SequenceNumber, ctx: &mut GetContext<'_>) -> bool {
        let seek = InternalKey::lookup(user_key, sequence);
        for entry in self.data.range(seek..) {
            let key = entry.key();
            if key.user_key.as_slice() != user_key {
                break;
            }
            if !ctx.save_value(key.value_type, entry.value()) {
                return true;
            }
        }
        false
    }

    /// Iterator over a shared memtable
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: Arc::clone(self),
            current: None,
        }
    }

    /// Check if the MemTable should be switched out
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.approximate_memory_usage() >= size_limit
    }

    /// Get the current size in bytes
    pub fn approximate_memory_usage(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(Ordering::Relaxed)
    }

    pub fn first_sequence(&self) -> SequenceNumber {
        self.first_sequence.load(Ordering::Relaxed)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn flush_in_progress(&self) -> bool {
        self.flush_in_progress.load(Ordering::Acquire)
    }

    pub fn flush_completed(&self) -> bool {
        self.flush_completed.load(Ordering::Acquire)
    }

    /// Table number the flush wrote this memtable into
    pub fn file_number(&self) -> u64 {
        self.file_number.load(Ordering::Acquire)
    }

    pub fn next_log_number(&self) -> u64 {
        self.next_log_number.load(Ordering::Acquire)
    }

    pub fn set_next_log_number(&self, number: u64) {
        self.next_log_number.store(number, Ordering::Release);
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("entries", &self.num_entries())
            .field("bytes", &self.approximate_memory_usage())
            .finish()
    }
}

/// Cursor over a memtable.
///
/// Remembers its current entry by value and re-seeks past it on `next`, so
/// the cursor owns nothing borrowed from the skip list.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    current: Option<(InternalKey, Bytes)>,
}

impl MemTableIterator {
    fn position(&mut self, bound: Bound<&InternalKey>) {
        self.current = self
            .mem
            .data
            .lower_bound(bound)
            .map(|e| (e.key().clone(), e.value().clone()));
    }
}

impl InternalIterator for MemTableIterator {
    fn key(&self) -> &InternalKey {
        match &self.current {
            Some((k, _)) => k,
            None => panic!("key() on an exhausted MemTableIterator"),
        }
    }

    fn value(&self) -> &[u8] {
        match &self.current {
            Some((_, v)) => v.as_ref(),
            None => panic!("value() on an exhausted MemTableIterator"),
        }
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.position(Bound::Excluded(&key));
        }
        Ok(())
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        self.position(Bound::Included(target));
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.current = self
            .mem
            .data
            .front()
            .map(|e| (e.key().clone(), e.value().clone()));
        Ok(())
    }
}

/// Immutable memtables of one column family, newest first
#[derive(Debug, Default, Clone)]
pub struct MemTableList {
    memlist: Vec<Arc<MemTable>>,
    flush_requested: bool,
}

impl MemTableList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a freshly switched-out memtable
    pub fn add(&mut self, mem: Arc<MemTable>) {
        self.memlist.insert(0, mem);
    }

    /// Immutable memtables, newest first
    pub fn memtables(&self) -> &[Arc<MemTable>] {
        &self.memlist
    }

    pub fn len(&self) -> usize {
        self.memlist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memlist.is_empty()
    }

    /// Memtables not yet claimed by a flush
    pub fn num_not_flushed(&self) -> usize {
        self.memlist
            .iter()
            .filter(|m| !m.flush_in_progress())
            .count()
    }

    /// Force a flush of whatever is queued
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    /// True when a flush job should be scheduled for this family
    pub fn is_flush_pending(&self) -> bool {
        !self.memlist.is_empty()
            && !self.memlist.iter().any(|m| m.flush_in_progress())
            && (self.flush_requested || self.num_not_flushed() > 0)
    }

    /// Claim every queued memtable for one flush, oldest first.
    ///
    /// Only one flush per family runs at a time, so commits stay in switch order.
    pub fn pick_memtables_to_flush(&mut self) -> Vec<Arc<MemTable>> {
        if self.memlist.iter().any(|m| m.flush_in_progress()) {
            return Vec::new();
        }
        let picked: Vec<Arc<MemTable>> = self.memlist.iter().rev().cloned().collect();
        for mem in &picked {
            mem.flush_in_progress.store(true, Ordering::Release);
        }
        self.flush_requested = false;
        picked
    }

    /// Return memtables to the queue after a failed flush
    pub fn rollback_flush(&mut self, mems: &[Arc<MemTable>]) {
        for mem in mems {
            mem.flush_in_progress.store(false, Ordering::Release);
            mem.flush_completed.store(false, Ordering::Release);
            mem.file_number.store(0, Ordering::Release);
        }
        self.flush_requested = true;
    }

    /// Drop memtables whose contents are now committed in `file_number`
    pub fn remove_flushed(&mut self, mems: &[Arc<MemTable>], file_number: u64) {
        for mem in mems {
            mem.flush_completed.store(true, Ordering::Release);
            mem.file_number.store(file_number, Ordering::Release);
        }
        self.memlist
            .retain(|m| !mems.iter().any(|flushed| Arc::ptr_eq(m, flushed)));
    }

    /// Search newest to oldest; `true` when the lookup is resolved
    pub fn get(&self, user_key: &[u8], sequence: SequenceNumber, ctx: &mut GetContext<'_>) -> bool {
        self.memlist.iter().any(|mem| mem.get(user_key, sequence, ctx))
    }

    /// Memory held by all queued memtables
    pub fn approximate_memory_usage(&self) -> usize {
        self.memlist.iter().map(|m| m.approximate_memory_usage()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::get_context::tests::ConcatMerge;
    use crate::iterator::collect_entries;

    fn lookup(mem: &MemTable, key: &[u8], seq: SequenceNumber) -> Option<Vec<u8>> {
        let mut ctx = GetContext::new(key, None);
        mem.get(key, seq, &mut ctx);
        ctx.finish().unwrap()
    }

    #[test]
    fn test_memtable_get_at_sequence() {
        let mem = MemTable::new(1);
        mem.add(1, ValueType::Value, b"k", b"v1");
        mem.add(5, ValueType::Value, b"k", b"v5");
        mem.add(7, ValueType::Deletion, b"k", b"");
        mem.add(3, ValueType::Value, b"other", b"o");

        assert_eq!(lookup(&mem, b"k", 0), None);
        assert_eq!(lookup(&mem, b"k", 1), Some(b"v1".to_vec()));
        assert_eq!(lookup(&mem, b"k", 6), Some(b"v5".to_vec()));
        assert_eq!(lookup(&mem, b"k", 100), None);
        assert_eq!(lookup(&mem, b"missing", 100), None);

        assert_eq!(mem.num_entries(), 4);
        assert_eq!(mem.num_deletes(), 1);
        assert_eq!(mem.first_sequence(), 1);
        assert!(mem.approximate_memory_usage() > 0);
    }

    #[test]
    fn test_memtable_merge_lookup() {
        let op = ConcatMerge;
        let mem = MemTable::new(1);
        mem.add(1, ValueType::Value, b"k", b"a");
        mem.add(2, ValueType::Merge, b"k", b"b");
        mem.add(3, ValueType::Merge, b"k", b"c");

        let mut ctx = GetContext::new(b"k", Some(&op));
        assert!(mem.get(b"k", 10, &mut ctx));
        assert_eq!(ctx.finish().unwrap(), Some(b"a,b,c".to_vec()));
    }

    #[test]
    fn test_memtable_iterator() {
        let mem = Arc::new(MemTable::new(1));
        for i in 0..100u64 {
            let key = format!("key{:03}", i);
            mem.add(i + 1, ValueType::Value, key.as_bytes(), b"v");
        }

        let mut iter = mem.iter();
        iter.seek_to_first().unwrap();
        let entries = collect_entries(&mut iter).unwrap();
        assert_eq!(entries.len(), 100);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

        iter.seek(&InternalKey::lookup(b"key050", u64::MAX >> 8)).unwrap();
        assert_eq!(iter.key().user_key, b"key050".to_vec());
    }

    #[test]
    fn test_memtable_list_flush_lifecycle() {
        let mut list = MemTableList::new();
        let m1 = Arc::new(MemTable::new(1));
        let m2 = Arc::new(MemTable::new(2));
        m1.add(1, ValueType::Value, b"a", b"old");
        m2.add(2, ValueType::Value, b"a", b"new");
        list.add(Arc::clone(&m1));
        list.add(Arc::clone(&m2));

        let mut ctx = GetContext::new(b"a", None);
        assert!(list.get(b"a", 10, &mut ctx));
        assert_eq!(ctx.finish().unwrap(), Some(b"new".to_vec()));

        assert!(list.is_flush_pending());
        let picked = list.pick_memtables_to_flush();
        assert_eq!(picked.iter().map(|m| m.id()).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!list.is_flush_pending());
        assert!(list.pick_memtables_to_flush().is_empty());

        list.rollback_flush(&picked);
        assert!(list.is_flush_pending());

        let picked = list.pick_memtables_to_flush();
        list.remove_flushed(&picked, 9);
        assert!(list.is_empty());
        assert!(m1.flush_completed());
        assert_eq!(m2.file_number(), 9);
    }
}
