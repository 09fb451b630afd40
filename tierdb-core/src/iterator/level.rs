//! Concatenating iterator over one sorted, non-overlapping level

use super::{BoxedIterator, InternalIterator};
use crate::types::InternalKey;
use crate::version::FileMetaData;
use crate::Result;
use std::sync::Arc;

/// Opens an iterator over one table file
pub trait TableIterFactory: Send + Sync {
    fn new_table_iter(&self, file: &FileMetaData) -> Result<BoxedIterator>;
}

/// Walks the files of a level in key order, opening each table lazily.
///
/// Holding the file list keeps every file's metadata referenced, which keeps
/// the files themselves off the obsolete list while the iterator lives.
pub struct LevelIterator {
    files: Vec<Arc<FileMetaData>>,
    factory: Arc<dyn TableIterFactory>,
    index: usize,
    current: Option<BoxedIterator>,
}

impl LevelIterator {
    /// `files` must be sorted by smallest key and non-overlapping
    pub fn new(files: Vec<Arc<FileMetaData>>, factory: Arc<dyn TableIterFactory>) -> Self {
        let index = files.len();
        Self {
            files,
            factory,
            index,
            current: None,
        }
    }

    fn open(&mut self, index: usize) -> Result<()> {
        self.index = index;
        self.current = match self.files.get(index) {
            Some(file) => Some(self.factory.new_table_iter(file)?),
            None => None,
        };
        Ok(())
    }

    /// Move forward past exhausted tables
    fn skip_empty_tables(&mut self) -> Result<()> {
        while let Some(iter) = &self.current {
            if iter.is_valid() {
                break;
            }
            self.open(self.index + 1)?;
            if let Some(iter) = self.current.as_mut() {
                iter.seek_to_first()?;
            }
        }
        Ok(())
    }
}

impl InternalIterator for LevelIterator {
    fn key(&self) -> &InternalKey {
        match &self.current {
            Some(iter) => iter.key(),
            None => panic!("key() on an exhausted LevelIterator"),
        }
    }

    fn value(&self) -> &[u8] {
        match &self.current {
            Some(iter) => iter.value(),
            None => panic!("value() on an exhausted LevelIterator"),
        }
    }

    fn is_valid(&self) -> bool {
        self.current.as_ref().map(|i| i.is_valid()).unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        if let Some(iter) = self.current.as_mut() {
            iter.next()?;
        }
        self.skip_empty_tables()
    }

    fn seek(&mut self, target: &InternalKey) -> Result<()> {
        let index = self.files.partition_point(|f| f.largest < *target);
        self.open(index)?;
        if let Some(iter) = self.current.as_mut() {
            iter.seek(target)?;
        }
        self.skip_empty_tables()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.open(0)?;
        if let Some(iter) = self.current.as_mut() {
            iter.seek_to_first()?;
        }
        self.skip_empty_tables()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::{collect_entries, VecIterator};
    use crate::types::ValueType;
    use crate::version::FileDescriptor;
    use std::collections::HashMap;

    struct FakeTables(HashMap<u64, Vec<(InternalKey, Vec<u8>)>>);

    impl TableIterFactory for FakeTables {
        fn new_table_iter(&self, file: &FileMetaData) -> Result<BoxedIterator> {
            let entries = self.0.get(&file.fd.number()).cloned().unwrap_or_default();
            Ok(Box::new(VecIterator::new(entries)))
        }
    }

    fn ikey(k: &str, seq: u64) -> InternalKey {
        InternalKey::new(k.as_bytes().to_vec(), seq, ValueType::Value)
    }

    fn file(number: u64, smallest: InternalKey, largest: InternalKey) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            FileDescriptor::new(number, 0, 100),
            smallest,
            largest,
            1,
            10,
        ))
    }

    #[test]
    fn test_level_iteration_and_seek() {
        let mut tables = HashMap::new();
        tables.insert(1, vec![(ikey("a", 1), vec![]), (ikey("b", 1), vec![])]);
        tables.insert(2, vec![]);
        tables.insert(3, vec![(ikey("m", 1), vec![]), (ikey("z", 1), vec![])]);
        let files = vec![
            file(1, ikey("a", 1), ikey("b", 1)),
            file(2, ikey("c", 1), ikey("d", 1)),
            file(3, ikey("m", 1), ikey("z", 1)),
        ];
        let mut iter = LevelIterator::new(files, Arc::new(FakeTables(tables)));

        iter.seek_to_first().unwrap();
        assert_eq!(collect_entries(&mut iter).unwrap().len(), 4);

        // seek into the gap lands on the next table
        iter.seek(&InternalKey::lookup(b"e", 10)).unwrap();
        assert_eq!(iter.key().user_key, b"m".to_vec());

        iter.seek(&InternalKey::lookup(b"zz", 10)).unwrap();
        assert!(!iter.is_valid());
    }
}
