//! One LRU shard: a slot arena threaded by an open-chaining hash table and a
//! doubly-linked recency list, both addressed by slot index.

use parking_lot::Mutex;
use std::sync::Arc;

use super::Deleter;

const NIL: usize = usize::MAX;
const INITIAL_BUCKETS: usize = 16;

/// Stable address of an entry; the generation detects reuse of a freed slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotId {
    index: usize,
    generation: u32,
}

struct Slot<V> {
    key: Vec<u8>,
    value: Option<Arc<V>>,
    deleter: Option<Deleter<V>>,
    charge: usize,
    hash: u32,
    refs: u32,
    in_cache: bool,
    generation: u32,
    // recency list
    prev: usize,
    next: usize,
    // hash chain
    next_hash: usize,
}

impl<V> Slot<V> {
    fn vacant() -> Self {
        Self {
            key: Vec::new(),
            value: None,
            deleter: None,
            charge: 0,
            hash: 0,
            refs: 0,
            in_cache: false,
            generation: 0,
            prev: NIL,
            next: NIL,
            next_hash: NIL,
        }
    }

    fn is_occupied(&self) -> bool {
        self.value.is_some()
    }
}

/// An entry whose last reference is gone; disposed of after the shard lock is dropped
pub(crate) struct Evicted<V> {
    key: Vec<u8>,
    value: Arc<V>,
    deleter: Option<Deleter<V>>,
}

impl<V> Evicted<V> {
    pub(crate) fn dispose(self) {
        if let Some(deleter) = self.deleter {
            deleter(&self.key, &self.value);
        }
    }
}

struct ShardState<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    buckets: Vec<usize>,
    elems: usize,
    // least recently used end
    lru_head: usize,
    // most recently used end
    lru_tail: usize,
    usage: usize,
}

impl<V> ShardState<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![NIL; INITIAL_BUCKETS],
            elems: 0,
            lru_head: NIL,
            lru_tail: NIL,
            usage: 0,
        }
    }

    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn table_find(&self, key: &[u8], hash: u32) -> Option<usize> {
        let mut cur = self.buckets[self.bucket_of(hash)];
        while cur != NIL {
            let slot = &self.slots[cur];
            if slot.hash == hash && slot.key == key {
                return Some(cur);
            }
            cur = slot.next_hash;
        }
        None
    }

    /// Link `index` into its chain, returning the entry it replaced
    fn table_insert(&mut self, index: usize) -> Option<usize> {
        let hash = self.slots[index].hash;
        let bucket = self.bucket_of(hash);

        let mut prev = NIL;
        let mut cur = self.buckets[bucket];
        while cur != NIL {
            if self.slots[cur].hash == hash && self.slots[cur].key == self.slots[index].key {
                break;
            }
            prev = cur;
            cur = self.slots[cur].next_hash;
        }

        if cur != NIL {
            self.slots[index].next_hash = self.slots[cur].next_hash;
            self.slots[cur].next_hash = NIL;
            if prev == NIL {
                self.buckets[bucket] = index;
            } else {
                self.slots[prev].next_hash = index;
            }
            return Some(cur);
        }

        self.slots[index].next_hash = self.buckets[bucket];
        self.buckets[bucket] = index;
        self.elems += 1;
        if self.elems > self.buckets.len() {
            self.resize();
        }
        None
    }

    /// Unlink `index` from its chain
    fn table_remove_index(&mut self, index: usize) {
        let bucket = self.bucket_of(self.slots[index].hash);
        let mut prev = NIL;
        let mut cur = self.buckets[bucket];
        while cur != NIL && cur != index {
            prev = cur;
            cur = self.slots[cur].next_hash;
        }
        if cur == NIL {
            return;
        }
        let next = self.slots[index].next_hash;
        if prev == NIL {
            self.buckets[bucket] = next;
        } else {
            self.slots[prev].next_hash = next;
        }
        self.slots[index].next_hash = NIL;
        self.elems -= 1;
    }

    fn resize(&mut self) {
        let new_len = self.buckets.len() * 2;
        let mut new_buckets = vec![NIL; new_len];
        for bucket in 0..self.buckets.len() {
            let mut cur = self.buckets[bucket];
            while cur != NIL {
                let next = self.slots[cur].next_hash;
                let target = self.slots[cur].hash as usize & (new_len - 1);
                self.slots[cur].next_hash = new_buckets[target];
                new_buckets[target] = cur;
                cur = next;
            }
        }
        self.buckets = new_buckets;
    }

    fn lru_remove(&mut self, index: usize) {
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.lru_tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
        self.slots[index].prev = NIL;
        self.slots[index].next = NIL;
    }

    fn lru_append(&mut self, index: usize) {
        self.slots[index].prev = self.lru_tail;
        self.slots[index].next = NIL;
        if self.lru_tail == NIL {
            self.lru_head = index;
        } else {
            let tail = self.lru_tail;
            self.slots[tail].next = index;
        }
        self.lru_tail = index;
    }

    fn alloc(&mut self) -> usize {
        match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::vacant());
                self.slots.len() - 1
            }
        }
    }

    fn free_slot(&mut self, index: usize) -> Option<Evicted<V>> {
        let slot = &mut self.slots[index];
        debug_assert!(!slot.in_cache);
        let value = slot.value.take()?;
        let evicted = Evicted {
            key: std::mem::take(&mut slot.key),
            value,
            deleter: slot.deleter.take(),
        };
        slot.generation = slot.generation.wrapping_add(1);
        slot.charge = 0;
        self.free.push(index);
        Some(evicted)
    }

    fn unref(&mut self, index: usize) -> Option<Evicted<V>> {
        let slot = &mut self.slots[index];
        debug_assert!(slot.refs > 0);
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.free_slot(index)
        } else {
            None
        }
    }

    /// Detach an entry that has already left the hash table
    fn remove_from_cache(&mut self, index: usize) {
        self.lru_remove(index);
        let slot = &mut self.slots[index];
        slot.in_cache = false;
        self.usage -= slot.charge;
    }

    /// Evict unpinned entries from the LRU end until usage fits `capacity`
    fn evict(&mut self, capacity: usize, out: &mut Vec<Evicted<V>>) {
        let mut cur = self.lru_head;
        while self.usage > capacity && cur != NIL {
            let next = self.slots[cur].next;
            if self.slots[cur].refs == 1 {
                self.table_remove_index(cur);
                self.remove_from_cache(cur);
                if let Some(evicted) = self.unref(cur) {
                    out.push(evicted);
                }
            }
            cur = next;
        }
    }

    fn id_of(&self, index: usize) -> SlotId {
        SlotId {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn is_live(&self, id: SlotId) -> bool {
        self.slots
            .get(id.index)
            .map(|slot| slot.is_occupied() && slot.generation == id.generation)
            .unwrap_or(false)
    }
}

/// A single cache shard with its own lock and capacity
pub(crate) struct LruShard<V> {
    capacity: usize,
    state: Mutex<ShardState<V>>,
}

impl<V> LruShard<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(ShardState::new()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert and return a handle id holding one reference for the caller
    pub(crate) fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: Arc<V>,
        charge: usize,
        deleter: Option<Deleter<V>>,
    ) -> SlotId {
        let mut evicted = Vec::new();
        let id = {
            let mut state = self.state.lock();
            let index = state.alloc();
            {
                let slot = &mut state.slots[index];
                slot.key = key.to_vec();
                slot.value = Some(value);
                slot.deleter = deleter;
                slot.charge = charge;
                slot.hash = hash;
                // one reference for the cache, one for the returned handle
                slot.refs = 2;
                slot.in_cache = true;
            }
            state.lru_append(index);
            state.usage += charge;

            if let Some(old) = state.table_insert(index) {
                state.remove_from_cache(old);
                if let Some(e) = state.unref(old) {
                    evicted.push(e);
                }
            }
            state.evict(self.capacity, &mut evicted);
            state.id_of(index)
        };

        for e in evicted {
            e.dispose();
        }
        id
    }

    /// Find `key`, taking a reference and marking it most recently used
    pub(crate) fn lookup(&self, key: &[u8], hash: u32) -> Option<(SlotId, Arc<V>)> {
        let mut state = self.state.lock();
        let index = state.table_find(key, hash)?;
        state.slots[index].refs += 1;
        state.lru_remove(index);
        state.lru_append(index);
        let value = state.slots[index].value.clone()?;
        Some((state.id_of(index), value))
    }

    /// Drop one caller reference
    pub(crate) fn release(&self, id: SlotId) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.is_live(id) {
                debug_assert!(false, "release of a stale cache handle");
                return;
            }
            match state.unref(id.index) {
                Some(e) => evicted.push(e),
                None => {
                    if state.slots[id.index].in_cache && state.usage > self.capacity {
                        state.evict(self.capacity, &mut evicted);
                    }
                }
            }
        }
        for e in evicted {
            e.dispose();
        }
    }

    /// Remove `key` from the cache; outstanding handles keep the value alive
    pub(crate) fn erase(&self, key: &[u8], hash: u32) {
        let evicted = {
            let mut state = self.state.lock();
            match state.table_find(key, hash) {
                Some(index) => {
                    state.table_remove_index(index);
                    state.remove_from_cache(index);
                    state.unref(index)
                }
                None => None,
            }
        };
        if let Some(e) = evicted {
            e.dispose();
        }
    }

    /// Evict every entry not pinned by a handle
    pub(crate) fn prune(&self) {
        let mut evicted = Vec::new();
        self.state.lock().evict(0, &mut evicted);
        for e in evicted {
            e.dispose();
        }
    }

    pub(crate) fn usage(&self) -> usize {
        self.state.lock().usage
    }

    pub(crate) fn pinned_usage(&self) -> usize {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .filter(|s| s.is_occupied() && s.in_cache && s.refs > 1)
            .map(|s| s.charge)
            .sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().elems
    }

    /// Visit every resident entry in LRU order while holding the shard lock
    pub(crate) fn for_each(&self, f: &mut dyn FnMut(&[u8], &V, usize)) {
        let state = self.state.lock();
        let mut cur = state.lru_head;
        while cur != NIL {
            let slot = &state.slots[cur];
            if let Some(value) = &slot.value {
                f(&slot.key, value, slot.charge);
            }
            cur = slot.next;
        }
    }

    /// Every resident entry is unpinned-free or usage is within capacity
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> bool {
        let state = self.state.lock();
        let resident: Vec<&Slot<V>> = state
            .slots
            .iter()
            .filter(|s| s.is_occupied() && s.in_cache)
            .collect();
        let usage: usize = resident.iter().map(|s| s.charge).sum();
        usage == state.usage
            && resident.len() == state.elems
            && (state.usage <= self.capacity || resident.iter().all(|s| s.refs > 1))
    }
}
