//! Table reader for point lookups and scans

use super::{
    Block, BlockCache, BlockHandle, BlockIterator, BlockRef, BloomFilter, Footer, TableProperties,
    TableReadOptions, FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, TABLE_MAGIC,
};
use crate::get_context::GetContext;
use crate::iterator::InternalIterator;
use crate::types::InternalKey;
use crate::{Result, TierError};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An open table file
pub struct TableReader {
    path: PathBuf,
    file: Mutex<File>,
    file_number: u64,
    file_size: u64,
    index: Arc<Block>,
    filter: Option<BloomFilter>,
    properties: TableProperties,
    block_cache: Option<Arc<BlockCache>>,
    cache_id: u64,
}

impl TableReader {
    /// Open a table file, loading its index, filter and properties
    pub fn open(
        path: impl AsRef<Path>,
        file_number: u64,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(TierError::Corruption(format!(
                "Table {:?} too short: {} bytes",
                path, file_size
            )));
        }

        // Read header
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[..4] != TABLE_MAGIC {
            return Err(TierError::Corruption("Invalid table header".into()));
        }
        let version = (&header[4..]).get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TierError::NotSupported(format!(
                "Unsupported version: {}",
                version
            )));
        }

        // Read footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;
        let footer = Footer::decode(&footer)?;

        let index_raw = Self::read_at(&mut file, footer.index)?;
        let index = Arc::new(Block::decode(index_raw, true)?);

        let filter = if footer.filter.size > 0 {
            let raw = Self::read_at(&mut file, footer.filter)?;
            Some(BloomFilter::decode(&raw)?)
        } else {
            None
        };

        let props_raw = Self::read_at(&mut file, footer.properties)?;
        let mut properties: TableProperties = bincode::deserialize(&props_raw)?;
        properties.file_size = file_size;

        let cache_id = block_cache.as_ref().map(|c| c.new_id()).unwrap_or(0);

        Ok(Self {
            path,
            file: Mutex::new(file),
            file_number,
            file_size,
            index,
            filter,
            properties,
            block_cache,
            cache_id,
        })
    }

    fn read_at(file: &mut File, handle: BlockHandle) -> Result<Bytes> {
        file.seek(SeekFrom::Start(handle.offset))?;
        let mut buf = vec![0u8; handle.size as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn block_cache_key(&self, offset: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&self.cache_id.to_le_bytes());
        key[8..].copy_from_slice(&offset.to_le_bytes());
        key
    }

    /// Load a data block, going through the block cache
    pub fn read_block(&self, handle: BlockHandle, opts: TableReadOptions) -> Result<BlockRef> {
        if handle.offset + handle.size > self.file_size {
            return Err(TierError::Corruption(format!(
                "Block handle {:?} past end of {:?}",
                handle, self.path
            )));
        }
        let key = self.block_cache_key(handle.offset);
        BlockRef::cached_or_decode(self.block_cache.as_deref(), &key, opts.fill_cache, || {
            let raw = {
                let mut file = self.file.lock();
                Self::read_at(&mut file, handle)?
            };
            Block::decode(raw, opts.verify_checksums)
        })
    }

    /// Bloom filter check on a user key
    pub fn key_may_match(&self, user_key: &[u8]) -> bool {
        match &self.filter {
            Some(filter) => filter.may_contain(user_key),
            None => true,
        }
    }

    /// Feed every entry for the lookup key's user key into `ctx`.
    ///
    /// Returns `true` once the lookup is resolved.
    pub fn get(
        self: &Arc<Self>,
        lookup: &InternalKey,
        ctx: &mut GetContext<'_>,
        opts: TableReadOptions,
    ) -> Result<bool> {
        if !self.key_may_match(&lookup.user_key) {
            return Ok(false);
        }

        let mut iter = self.iter(opts);
        iter.seek(lookup)?;
        while iter.is_valid() {
            let key = iter.key();
            if key.user_key != lookup.user_key {
                break;
            }
            if !ctx.save_value(key.value_type, iter.value()) {
                return Ok(true);
            }
            iter.next()?;
        }
        Ok(false)
    }

    /// Iterator over the whole table
    pub fn iter(self: &Arc<Self>, opts: TableReadOptions) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            opts,
            index_iter: BlockIterator::new(BlockRef::Owned(Arc::clone(&self.index))),
            data_iter: None,
        }
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("path", &self.path)
            .field("entries", &self.properties.num_entries)
            .finish()
    }
}

/// Two-level cursor: index block, then the data block it points at
pub struct TableIterator {
    table: Arc<TableReader>,
    opts: TableReadOptions,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
}

impl TableIterator {
    fn load_data_block(&mut self) -> Result<()> {
        self.data_iter = if self.index_iter.is_valid() {
            let handle = BlockHandle::decode(self.index_iter.value())?;
            Some(BlockIterator::new(self.table.read_block(handle, self.opts)?))
        } else {
            None
        };
        Ok(())
    }

    fn skip_empty_blocks(&mut self) -> Result<()> {
        while let Some(data) = &self.data_iter {
            if data.is_valid() {
                break;
            }
            self.index_iter.next()?;
            self.load_data_block()?;
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_first()?;
            }
        }
        Ok(())
    }
}

impl InternalIterator for TableIterator {
    fn key(&self) -> &InternalKey {
        match &self.data_iter {
            Some(data) => data.key(),
            None => panic!("key() on an exhausted TableIterator"),
        }
    }

    fn value(&self) -> &[u8] {
        match &self.data_iter {
            Some(data) => data.value(),
            None => panic!("value() on an exhausted TableIterator"),
        }
    }

    fn is_valid(&self) -> bool {
        self.data_iter.as_ref().map(|d| d.is_valid()).unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        if let Some(data) = self.data_iter.as_mut() {
            data.next()?;
        }
        self.skip_empty_blocks()
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        self.index_iter.seek(target)?;
        self.load_data_block()?;
        if let Some(data) = self.data_iter.as_mut() {
            data.seek(target)?;
        }
        self.skip_empty_blocks()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.index_iter.seek_to_first()?;
        self.load_data_block()?;
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_first()?;
        }
        self.skip_empty_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::collect_entries;
    use crate::table::TableBuilder;
    use crate::types::ValueType;
    use tempfile::TempDir;

    fn build_table(path: &Path, n: u64) -> TableProperties {
        let mut builder = TableBuilder::create(path, 256, 10).unwrap();
        for i in 0..n {
            let key = InternalKey::new(format!("key{:05}", i).into_bytes(), i + 1, ValueType::Value);
            builder.add(&key, format!("value{}", i).as_bytes()).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_table_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.sst");
        let props = build_table(&path, 500);

        assert_eq!(props.num_entries, 500);
        assert_eq!(props.smallest_seq, 1);
        assert_eq!(props.largest_seq, 500);
        assert!(props.num_data_blocks > 1);
        assert_eq!(props.smallest().unwrap().user_key, b"key00000".to_vec());
        assert_eq!(props.largest().unwrap().user_key, b"key00499".to_vec());
        assert_eq!(props.file_size, std::fs::metadata(&path).unwrap().len());

        let cache = Arc::new(BlockCache::new(1 << 20, 2));
        let table = Arc::new(TableReader::open(&path, 1, Some(Arc::clone(&cache))).unwrap());
        assert_eq!(table.properties().num_entries, 500);

        let mut iter = table.iter(TableReadOptions::default());
        iter.seek_to_first().unwrap();
        let entries = collect_entries(&mut iter).unwrap();
        assert_eq!(entries.len(), 500);
        assert_eq!(entries[123].1, b"value123".to_vec());
        assert!(cache.usage() > 0);
    }

    #[test]
    fn test_table_get() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.sst");
        build_table(&path, 200);
        let table = Arc::new(TableReader::open(&path, 1, None).unwrap());

        let mut ctx = GetContext::new(b"key00150", None);
        let done = table
            .get(&InternalKey::lookup(b"key00150", 1000), &mut ctx, TableReadOptions::default())
            .unwrap();
        assert!(done);
        assert_eq!(ctx.finish().unwrap(), Some(b"value150".to_vec()));

        // written at seq 151, invisible at seq 100
        let mut ctx = GetContext::new(b"key00150", None);
        let done = table
            .get(&InternalKey::lookup(b"key00150", 100), &mut ctx, TableReadOptions::default())
            .unwrap();
        assert!(!done);

        assert!(table.key_may_match(b"key00007"));
        let mut ctx = GetContext::new(b"nope", None);
        assert!(!table
            .get(&InternalKey::lookup(b"nope", 1000), &mut ctx, TableReadOptions::default())
            .unwrap());
    }

    #[test]
    fn test_corrupt_table_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.sst");
        build_table(&path, 10);

        let mut data = std::fs::read(&path).unwrap();
        let n = data.len();
        data[n - 1] = 0;
        std::fs::write(&path, &data).unwrap();
        assert!(TableReader::open(&path, 1, None).is_err());
    }
}
