//! Cache of open table readers

use super::{BlockCache, TableReadOptions, TableReader};
use crate::cache::ShardedLruCache;
use crate::filename::{table_dir, table_file_name};
use crate::get_context::GetContext;
use crate::iterator::{BoxedIterator, TableIterFactory};
use crate::types::InternalKey;
use crate::version::{FileDescriptor, FileMetaData};
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Keeps table files open across reads.
///
/// With a bounded `max_open_files` readers live in a sharded LRU keyed by
/// file number. Without a bound each reader is pinned in its
/// [`FileDescriptor`] and lives as long as the file's metadata.
pub struct TableCache {
    db_dir: PathBuf,
    db_paths: Vec<PathBuf>,
    readers: Option<ShardedLruCache<TableReader>>,
    block_cache: Option<Arc<BlockCache>>,
}

impl TableCache {
    pub fn new(
        db_dir: impl Into<PathBuf>,
        db_paths: Vec<PathBuf>,
        max_open_files: Option<usize>,
        shard_bits: u32,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        Self {
            db_dir: db_dir.into(),
            db_paths,
            readers: max_open_files.map(|n| ShardedLruCache::new(n.max(1), shard_bits)),
            block_cache,
        }
    }

    /// Path of the table described by `fd`
    pub fn table_path(&self, fd: &FileDescriptor) -> PathBuf {
        table_file_name(&table_dir(&self.db_dir, &self.db_paths, fd.path_id()), fd.number())
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn block_cache(&self) -> Option<&Arc<BlockCache>> {
        self.block_cache.as_ref()
    }

    /// Open (or fetch the already open) reader for `fd`
    pub fn find_table(&self, fd: &FileDescriptor) -> Result<Arc<TableReader>> {
        let readers = match &self.readers {
            Some(readers) => readers,
            None => {
                if let Some(table) = fd.table.get() {
                    return Ok(Arc::clone(table));
                }
                let table = Arc::new(self.open(fd)?);
                // A concurrent opener may have won; either reader is fine.
                let _ = fd.table.set(Arc::clone(&table));
                return Ok(fd.table.get().cloned().unwrap_or(table));
            }
        };

        let key = fd.number().to_le_bytes();
        if let Some(handle) = readers.lookup(&key) {
            return Ok(handle.value_arc());
        }
        let table = self.open(fd)?;
        let handle = readers.insert(&key, table, 1, None);
        Ok(handle.value_arc())
    }

    fn open(&self, fd: &FileDescriptor) -> Result<TableReader> {
        let path = self.table_path(fd);
        debug!("Opening table {:?}", path);
        TableReader::open(path, fd.number(), self.block_cache.clone())
    }

    /// Point lookup in one table; `true` once resolved
    pub fn get(
        &self,
        fd: &FileDescriptor,
        lookup: &InternalKey,
        ctx: &mut GetContext<'_>,
        opts: TableReadOptions,
    ) -> Result<bool> {
        let table = self.find_table(fd)?;
        table.get(lookup, ctx, opts)
    }

    /// Bloom check without reading any data block
    pub fn key_may_match(&self, fd: &FileDescriptor, user_key: &[u8]) -> Result<bool> {
        Ok(self.find_table(fd)?.key_may_match(user_key))
    }

    pub fn new_iterator(&self, fd: &FileDescriptor, opts: TableReadOptions) -> Result<BoxedIterator> {
        let table = self.find_table(fd)?;
        Ok(Box::new(table.iter(opts)))
    }

    /// Forget the reader for a deleted table
    pub fn evict(&self, number: u64) {
        if let Some(readers) = &self.readers {
            readers.erase(&number.to_le_bytes());
        }
    }

    /// Number of readers held by the LRU (always 0 when readers are pinned)
    pub fn open_readers(&self) -> usize {
        self.readers.as_ref().map(|r| r.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for TableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("db_dir", &self.db_dir)
            .field("open_readers", &self.open_readers())
            .finish()
    }
}

/// Opens level files through a shared [`TableCache`]
pub struct TableIterSource {
    cache: Arc<TableCache>,
    opts: TableReadOptions,
}

impl TableIterSource {
    pub fn new(cache: Arc<TableCache>, opts: TableReadOptions) -> Self {
        Self { cache, opts }
    }
}

impl TableIterFactory for TableIterSource {
    fn new_table_iter(&self, file: &FileMetaData) -> Result<BoxedIterator> {
        self.cache.new_iterator(&file.fd, self.opts)
    }
}
