//! Sharded, reference-counted LRU cache
//!
//! Used for decoded table blocks and for open table readers. Each shard has
//! its own lock, hash table and recency list; the top bits of a key's hash
//! select the shard. Entries handed out through a [`CacheHandle`] are pinned
//! and never evicted until every handle is dropped.

mod lru;

use lru::{LruShard, SlotId};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Largest accepted `shard_bits` (half a million shards)
pub const MAX_SHARD_BITS: u32 = 19;

/// Cleanup callback run once an entry's last reference is gone
pub type Deleter<V> = Box<dyn FnOnce(&[u8], &V) + Send>;

/// A pinned cache entry. Dropping the handle releases the pin.
pub struct CacheHandle<V> {
    shard: Arc<LruShard<V>>,
    id: SlotId,
    value: Arc<V>,
}

impl<V> CacheHandle<V> {
    /// The cached value
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Shared ownership of the cached value, independent of the pin
    pub fn value_arc(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }
}

impl<V> Deref for CacheHandle<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V> Drop for CacheHandle<V> {
    fn drop(&mut self) {
        self.shard.release(self.id);
    }
}

impl<V> fmt::Debug for CacheHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle").field("id", &self.id).finish()
    }
}

/// Hit and miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Sharded LRU cache
pub struct ShardedLruCache<V> {
    shards: Vec<Arc<LruShard<V>>>,
    shard_bits: u32,
    capacity: usize,
    last_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Send + Sync + 'static> ShardedLruCache<V> {
    /// Create a cache of `capacity` charge units split across `2^shard_bits` shards
    ///
    /// `shard_bits` is capped at [`MAX_SHARD_BITS`] and lowered further until
    /// every shard can hold at least one unit. Each shard gets
    /// `capacity / 2^shard_bits`, so shard capacities never add up to more
    /// than `capacity`.
    pub fn new(capacity: usize, shard_bits: u32) -> Self {
        let mut shard_bits = shard_bits.min(MAX_SHARD_BITS);
        while shard_bits > 0 && capacity >> shard_bits == 0 {
            shard_bits -= 1;
        }
        let num_shards = 1usize << shard_bits;
        let per_shard = capacity / num_shards;
        let shards = (0..num_shards)
            .map(|_| Arc::new(LruShard::new(per_shard)))
            .collect();
        Self {
            shards,
            shard_bits,
            capacity,
            last_id: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn hash(key: &[u8]) -> u32 {
        xxh3_64(key) as u32
    }

    fn shard(&self, hash: u32) -> &Arc<LruShard<V>> {
        let index = if self.shard_bits == 0 {
            0
        } else {
            (hash >> (32 - self.shard_bits)) as usize
        };
        &self.shards[index]
    }

    /// Insert `value`, replacing any entry with the same key.
    ///
    /// The returned handle pins the new entry; a replaced entry stays alive
    /// for whoever still holds a handle to it.
    pub fn insert(
        &self,
        key: &[u8],
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
    ) -> CacheHandle<V> {
        let hash = Self::hash(key);
        let shard = self.shard(hash);
        let value = Arc::new(value);
        let id = shard.insert(key, hash, Arc::clone(&value), charge, deleter);
        CacheHandle {
            shard: Arc::clone(shard),
            id,
            value,
        }
    }

    /// Look up `key`, pinning the entry on a hit
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<V>> {
        let hash = Self::hash(key);
        let shard = self.shard(hash);
        match shard.lookup(key, hash) {
            Some((id, value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheHandle {
                    shard: Arc::clone(shard),
                    id,
                    value,
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Release a handle obtained from `insert` or `lookup`
    pub fn release(&self, handle: CacheHandle<V>) {
        drop(handle);
    }

    /// Remove `key`; its deleter runs once the last handle is released
    pub fn erase(&self, key: &[u8]) {
        let hash = Self::hash(key);
        self.shard(hash).erase(key, hash);
    }

    /// Evict every unpinned entry
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.prune();
        }
    }

    /// A fresh id for callers sharing one cache to partition its key space
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Total capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Charge of every resident entry
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.usage()).sum()
    }

    /// Charge of resident entries currently pinned by a handle
    pub fn pinned_usage(&self) -> usize {
        self.shards.iter().map(|s| s.pinned_usage()).sum()
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Call `f(key, value, charge)` for every resident entry.
    ///
    /// Each shard's lock is held while its entries are visited, so `f` must
    /// not call back into this cache.
    pub fn apply_to_all_entries(&self, mut f: impl FnMut(&[u8], &V, usize)) {
        for shard in &self.shards {
            shard.for_each(&mut f);
        }
    }

    /// Per-shard capacity
    pub fn shard_capacity(&self) -> usize {
        self.shards.first().map(|s| s.capacity()).unwrap_or(0)
    }

    #[cfg(test)]
    fn check_invariants(&self) -> bool {
        self.shards.iter().all(|s| s.check_invariants())
    }
}

impl<V> fmt::Debug for ShardedLruCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedLruCache")
            .field("capacity", &self.capacity)
            .field("shards", &self.shards.len())
            .finish()
    }
}
