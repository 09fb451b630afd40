//! Table block implementation
//!
//! Block layout:
//! ```text
//! entry*      [u32 key_len][key][u32 value_len][value]
//! offsets     [u32] per entry
//! count       u32
//! checksum    u32 crc32 over everything above
//! ```
//! Keys are encoded internal keys in ascending order; the offset array lets
//! a seek binary-search the block without scanning it.

use super::BlockCache;
use crate::cache::CacheHandle;
use crate::types::{compare_encoded, InternalKey};
use crate::{Result, TierError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::Arc;

/// Builds one block
#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: BytesMut,
    offsets: Vec<u32>,
}

impl BlockBuilder {
    /// Create a new block builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; keys must arrive in ascending order
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.offsets.push(self.buf.len() as u32);
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_slice(key);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
    }

    /// Size the block would have if finished now
    pub fn size_estimate(&self) -> usize {
        self.buf.len() + self.offsets.len() * 4 + 8
    }

    /// Check if block has data
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Finish the block and reset the builder
    pub fn finish(&mut self) -> Bytes {
        let mut buf = std::mem::take(&mut self.buf);
        for offset in &self.offsets {
            buf.put_u32_le(*offset);
        }
        buf.put_u32_le(self.offsets.len() as u32);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        self.offsets.clear();
        buf.freeze()
    }
}

/// A decoded, immutable block
#[derive(Debug)]
pub struct Block {
    data: Bytes,
    offsets: Vec<u32>,
    entries_end: usize,
}

impl Block {
    /// Parse a finished block, verifying its checksum when `verify` is set
    pub fn decode(raw: Bytes, verify: bool) -> Result<Self> {
        if raw.len() < 8 {
            return Err(TierError::Corruption("Block too short".into()));
        }
        let body_len = raw.len() - 4;
        if verify {
            let expected = (&raw[body_len..]).get_u32_le();
            let actual = crc32fast::hash(&raw[..body_len]);
            if expected != actual {
                return Err(TierError::ChecksumMismatch { expected, actual });
            }
        }

        let count = (&raw[body_len - 4..body_len]).get_u32_le() as usize;
        let offsets_len = count
            .checked_mul(4)
            .filter(|n| n + 4 <= body_len)
            .ok_or_else(|| TierError::Corruption("Block entry count out of range".into()))?;
        let entries_end = body_len - 4 - offsets_len;

        let mut cursor = &raw[entries_end..body_len - 4];
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = cursor.get_u32_le();
            if offset as usize >= entries_end {
                return Err(TierError::Corruption("Block offset out of range".into()));
            }
            offsets.push(offset);
        }

        Ok(Self {
            data: raw,
            offsets,
            entries_end,
        })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Encoded size, used as the cache charge
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Key and value byte ranges of entry `i`
    fn entry_ranges(&self, i: usize) -> Result<((usize, usize), (usize, usize))> {
        let corrupt = || TierError::Corruption(format!("Block entry {} is malformed", i));
        let start = *self.offsets.get(i).ok_or_else(corrupt)? as usize;
        let data = &self.data[..self.entries_end];

        let read_len = |at: usize| -> Option<usize> {
            data.get(at..at + 4).map(|mut b| b.get_u32_le() as usize)
        };
        let key_len = read_len(start).ok_or_else(corrupt)?;
        let key_start = start + 4;
        let key_end = key_start + key_len;
        let value_len = read_len(key_end).ok_or_else(corrupt)?;
        let value_start = key_end + 4;
        let value_end = value_start + value_len;
        if value_end > self.entries_end {
            return Err(corrupt());
        }
        Ok(((key_start, key_end), (value_start, value_end)))
    }

    fn key_at(&self, i: usize) -> Result<&[u8]> {
        let ((start, end), _) = self.entry_ranges(i)?;
        Ok(&self.data[start..end])
    }
}

/// A block shared with the block cache or owned outright
pub enum BlockRef {
    /// Pinned in the block cache until dropped
    Cached(CacheHandle<Block>),
    Owned(Arc<Block>),
}

impl Deref for BlockRef {
    type Target = Block;

    fn deref(&self) -> &Block {
        match self {
            BlockRef::Cached(handle) => handle.value(),
            BlockRef::Owned(block) => block,
        }
    }
}

impl BlockRef {
    /// Look up `key` in `cache`, or decode `raw` and optionally cache it
    pub fn cached_or_decode(
        cache: Option<&BlockCache>,
        key: &[u8],
        fill_cache: bool,
        load: impl FnOnce() -> Result<Block>,
    ) -> Result<Self> {
        if let Some(cache) = cache {
            if let Some(handle) = cache.lookup(key) {
                return Ok(BlockRef::Cached(handle));
            }
            let block = load()?;
            if fill_cache {
                let charge = block.size();
                return Ok(BlockRef::Cached(cache.insert(key, block, charge, None)));
            }
            return Ok(BlockRef::Owned(Arc::new(block)));
        }
        Ok(BlockRef::Owned(Arc::new(load()?)))
    }
}

/// Cursor over one block
pub struct BlockIterator {
    block: BlockRef,
    index: usize,
    key: Option<InternalKey>,
    value: (usize, usize),
}

impl BlockIterator {
    pub fn new(block: BlockRef) -> Self {
        let index = block.len();
        Self {
            block,
            index,
            key: None,
            value: (0, 0),
        }
    }

    fn load(&mut self, index: usize) -> Result<()> {
        self.index = index;
        if index >= self.block.len() {
            self.key = None;
            return Ok(());
        }
        let ((ks, ke), value) = self.block.entry_ranges(index)?;
        self.key = Some(InternalKey::decode(&self.block.data[ks..ke])?);
        self.value = value;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.key.is_some()
    }

    pub fn key(&self) -> &InternalKey {
        match &self.key {
            Some(k) => k,
            None => panic!("key() on an exhausted BlockIterator"),
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.block.data[self.value.0..self.value.1]
    }

    pub fn next(&mut self) -> Result<()> {
        if self.is_valid() {
            self.load(self.index + 1)?;
        }
        Ok(())
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.load(0)
    }

    /// Position at the first entry >= `target`
    pub fn seek(&mut self, target: &InternalKey) -> Result<()> {
        let target = target.encode();
        let (mut lo, mut hi) = (0, self.block.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match compare_encoded(self.block.key_at(mid)?, &target) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        self.load(lo)
    }
}
