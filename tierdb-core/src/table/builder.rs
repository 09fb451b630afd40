//! Table builder for writing sorted entries to disk

use super::{BlockBuilder, BlockHandle, BloomFilter, Footer, TableProperties, FORMAT_VERSION, TABLE_MAGIC};
use crate::types::{compare_encoded, InternalKey, ValueType};
use crate::Result;
use bytes::BufMut;
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes one table file from entries added in internal-key order
pub struct TableBuilder {
    path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    block_size: usize,
    bloom_bits_per_key: usize,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    key_hashes: Vec<u64>,
    last_key: Vec<u8>,
    last_user_key: Option<Vec<u8>>,
    props: TableProperties,
}

impl TableBuilder {
    /// Create the file at `path` and write its header
    pub fn create(path: impl AsRef<Path>, block_size: usize, bloom_bits_per_key: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);

        let mut header = Vec::with_capacity(super::HEADER_SIZE);
        header.put_slice(TABLE_MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        file.write_all(&header)?;

        Ok(Self {
            path,
            file,
            offset: header.len() as u64,
            block_size,
            bloom_bits_per_key,
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            key_hashes: Vec::new(),
            last_key: Vec::new(),
            last_user_key: None,
            props: TableProperties {
                smallest_seq: u64::MAX,
                ..Default::default()
            },
        })
    }

    /// Add an entry; keys must be strictly increasing
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        let encoded = key.encode();
        debug_assert!(
            self.last_key.is_empty() || compare_encoded(&self.last_key, &encoded) == Ordering::Less,
            "table keys out of order"
        );

        if self.last_user_key.as_deref() != Some(key.user_key.as_slice()) {
            self.key_hashes.push(BloomFilter::hash(&key.user_key));
            self.last_user_key = Some(key.user_key.clone());
        }

        // Update stats
        if self.props.num_entries == 0 {
            self.props.smallest_key = encoded.clone();
        }
        self.props.num_entries += 1;
        match key.value_type {
            ValueType::Deletion => self.props.num_deletions += 1,
            ValueType::Merge => self.props.num_merges += 1,
            ValueType::Value => {}
        }
        self.props.raw_key_size += key.user_key.len() as u64;
        self.props.raw_value_size += value.len() as u64;
        self.props.smallest_seq = self.props.smallest_seq.min(key.sequence);
        self.props.largest_seq = self.props.largest_seq.max(key.sequence);

        self.data_block.add(&encoded, value);
        self.last_key = encoded;

        if self.data_block.size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<BlockHandle> {
        self.file.write_all(data)?;
        let handle = BlockHandle {
            offset: self.offset,
            size: data.len() as u64,
        };
        self.offset += data.len() as u64;
        Ok(handle)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let raw = self.data_block.finish();
        let handle = self.write_raw(&raw)?;
        self.index_block.add(&self.last_key, &handle.encode());
        self.props.num_data_blocks += 1;
        Ok(())
    }

    /// Entries added so far
    pub fn num_entries(&self) -> u64 {
        self.props.num_entries
    }

    /// Current file size including the unfinished block
    pub fn file_size(&self) -> u64 {
        self.offset + self.data_block.size_estimate() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the metadata blocks and footer, then sync the file
    pub fn finish(mut self) -> Result<TableProperties> {
        self.flush_data_block()?;

        let filter = if self.bloom_bits_per_key > 0 && !self.key_hashes.is_empty() {
            let mut bloom = BloomFilter::new(self.key_hashes.len(), self.bloom_bits_per_key);
            for h in &self.key_hashes {
                bloom.add_hash(*h);
            }
            self.write_raw(&bloom.encode())?
        } else {
            BlockHandle::default()
        };

        let index_raw = self.index_block.finish();
        let index = self.write_raw(&index_raw)?;

        if self.props.num_entries == 0 {
            self.props.smallest_seq = 0;
        }
        self.props.largest_key = self.last_key.clone();
        let props_raw = bincode::serialize(&self.props)?;
        let properties = self.write_raw(&props_raw)?;

        let footer = Footer {
            filter,
            index,
            properties,
        };
        self.write_raw(&footer.encode())?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        self.props.file_size = self.offset;
        Ok(self.props)
    }

    /// Give up on the table and remove its file
    pub fn abandon(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)?;
        Ok(())
    }
}
