//! Sorted table files
//!
//! Immutable on-disk storage for one flush or compaction output:
//! - Data blocks of sorted internal keys, each closed by a crc32
//! - An index block mapping each data block's last key to its location
//! - A bloom filter over user keys
//! - A properties block summarizing the table
//!
//! File layout:
//! ```text
//! [header: magic, version][data blocks][filter][index][properties][footer]
//! ```

mod block;
mod bloom;
mod builder;
mod reader;
mod table_cache;

pub use block::{Block, BlockBuilder, BlockIterator, BlockRef};
pub use bloom::BloomFilter;
pub use builder::TableBuilder;
pub use reader::{TableIterator, TableReader};
pub use table_cache::{TableCache, TableIterSource};

use crate::cache::ShardedLruCache;
use crate::options::ReadOptions;
use crate::types::{InternalKey, SequenceNumber};
use crate::{Result, TierError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Table file format version
pub const FORMAT_VERSION: u32 = 1;

/// Magic bytes at both ends of a table file
pub const TABLE_MAGIC: &[u8; 4] = b"TIER";

/// Header: magic + version
pub const HEADER_SIZE: usize = 8;

/// Footer: three block handles + version + magic
pub const FOOTER_SIZE: usize = 3 * BlockHandle::ENCODED_SIZE + 8;

/// Cache of decoded blocks shared by every open table
pub type BlockCache = ShardedLruCache<Block>;

/// Location of a block inside a table file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_SIZE: usize = 16;

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_SIZE);
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(TierError::Corruption("Block handle too short".into()));
        }
        Ok(Self {
            offset: data.get_u64_le(),
            size: data.get_u64_le(),
        })
    }
}

/// Summary of a finished table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Encoded smallest internal key
    pub smallest_key: Vec<u8>,
    /// Encoded largest internal key
    pub largest_key: Vec<u8>,
    pub smallest_seq: SequenceNumber,
    pub largest_seq: SequenceNumber,
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_merges: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
    pub num_data_blocks: u64,
    pub file_size: u64,
}

impl TableProperties {
    pub fn smallest(&self) -> Result<InternalKey> {
        InternalKey::decode(&self.smallest_key)
    }

    pub fn largest(&self) -> Result<InternalKey> {
        InternalKey::decode(&self.largest_key)
    }
}

/// Fixed-size trailer locating the metadata blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub filter: BlockHandle,
    pub index: BlockHandle,
    pub properties: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.filter.encode_into(&mut buf);
        self.index.encode_into(&mut buf);
        self.properties.encode_into(&mut buf);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_slice(TABLE_MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(TierError::Corruption("Invalid footer size".into()));
        }
        if &data[FOOTER_SIZE - 4..] != TABLE_MAGIC {
            return Err(TierError::Corruption("Invalid table magic".into()));
        }
        let version = (&data[FOOTER_SIZE - 8..FOOTER_SIZE - 4]).get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TierError::NotSupported(format!(
                "Unsupported table version: {}",
                version
            )));
        }
        let size = BlockHandle::ENCODED_SIZE;
        Ok(Self {
            filter: BlockHandle::decode(&data[..size])?,
            index: BlockHandle::decode(&data[size..2 * size])?,
            properties: BlockHandle::decode(&data[2 * size..3 * size])?,
        })
    }
}

/// The subset of [`ReadOptions`] table reads care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableReadOptions {
    pub verify_checksums: bool,
    pub fill_cache: bool,
}

impl Default for TableReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            fill_cache: true,
        }
    }
}

impl From<&ReadOptions> for TableReadOptions {
    fn from(opts: &ReadOptions) -> Self {
        Self {
            verify_checksums: opts.verify_checksums,
            fill_cache: opts.fill_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_encoding() {
        let footer = Footer {
            filter: BlockHandle { offset: 8, size: 10 },
            index: BlockHandle { offset: 18, size: 20 },
            properties: BlockHandle { offset: 38, size: 5 },
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);

        let mut bad = encoded.clone();
        bad[FOOTER_SIZE - 1] = b'X';
        assert!(matches!(Footer::decode(&bad), Err(TierError::Corruption(_))));
    }
}
