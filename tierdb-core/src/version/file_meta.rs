//! Metadata for one immutable table file

use crate::table::{TableProperties, TableReader};
use crate::types::{InternalKey, SequenceNumber};
use crate::{Result, TierError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Largest file number that fits below the path id bits
pub const MAX_FILE_NUMBER: u64 = (1 << 62) - 1;

/// Path ids occupy the two high bits
pub const MAX_PATH_ID: u32 = 3;

const PATH_ID_MULTIPLIER: u64 = MAX_FILE_NUMBER + 1;

/// Pack a file number and storage path id into one word.
///
/// Layout: bits 0..62 hold the number, bits 62..64 the path id.
pub fn pack_file_number_and_path_id(number: u64, path_id: u32) -> u64 {
    debug_assert!(number <= MAX_FILE_NUMBER);
    debug_assert!(path_id <= MAX_PATH_ID);
    number | (path_id as u64).wrapping_mul(PATH_ID_MULTIPLIER)
}

/// File number half of a packed word
pub fn packed_file_number(packed: u64) -> u64 {
    packed & MAX_FILE_NUMBER
}

/// Path id half of a packed word
pub fn packed_path_id(packed: u64) -> u32 {
    (packed / PATH_ID_MULTIPLIER) as u32
}

/// Identity and size of a table file, plus its lazily opened reader
pub struct FileDescriptor {
    /// Reader pinned here when the table cache is unbounded
    pub table: OnceLock<Arc<TableReader>>,
    packed_number_and_path_id: u64,
    pub file_size: u64,
}

impl FileDescriptor {
    pub fn new(number: u64, path_id: u32, file_size: u64) -> Self {
        Self {
            table: OnceLock::new(),
            packed_number_and_path_id: pack_file_number_and_path_id(number, path_id),
            file_size,
        }
    }

    pub fn number(&self) -> u64 {
        packed_file_number(self.packed_number_and_path_id)
    }

    pub fn path_id(&self) -> u32 {
        packed_path_id(self.packed_number_and_path_id)
    }

    pub fn packed_number_and_path_id(&self) -> u64 {
        self.packed_number_and_path_id
    }
}

impl Clone for FileDescriptor {
    fn clone(&self) -> Self {
        let table = OnceLock::new();
        if let Some(reader) = self.table.get() {
            let _ = table.set(Arc::clone(reader));
        }
        Self {
            table,
            packed_number_and_path_id: self.packed_number_and_path_id,
            file_size: self.file_size,
        }
    }
}

impl PartialEq for FileDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.packed_number_and_path_id == other.packed_number_and_path_id
            && self.file_size == other.file_size
    }
}

impl Eq for FileDescriptor {}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("number", &self.number())
            .field("path_id", &self.path_id())
            .field("size", &self.file_size)
            .field("open", &self.table.get().is_some())
            .finish()
    }
}

/// Everything a version knows about one table.
///
/// Shared as `Arc<FileMetaData>` between every version listing the file and
/// every iterator reading it; the file is only deleted once the last of those
/// references is gone.
pub struct FileMetaData {
    pub fd: FileDescriptor,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub smallest_seq: SequenceNumber,
    pub largest_seq: SequenceNumber,
    pub being_compacted: AtomicBool,
    /// File size inflated by its deletions, used to rank compaction candidates
    pub compensated_size: u64,
    pub num_entries: u64,
    pub num_deletions: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
}

impl FileMetaData {
    pub fn new(
        fd: FileDescriptor,
        smallest: InternalKey,
        largest: InternalKey,
        smallest_seq: SequenceNumber,
        largest_seq: SequenceNumber,
    ) -> Self {
        debug_assert!(smallest_seq <= largest_seq);
        let compensated_size = fd.file_size;
        Self {
            fd,
            smallest,
            largest,
            smallest_seq,
            largest_seq,
            being_compacted: AtomicBool::new(false),
            compensated_size,
            num_entries: 0,
            num_deletions: 0,
            raw_key_size: 0,
            raw_value_size: 0,
        }
    }

    /// Metadata for a freshly written table
    pub fn from_properties(number: u64, path_id: u32, props: &TableProperties) -> Result<Self> {
        if props.num_entries == 0 {
            return Err(TierError::Internal(format!(
                "table {} has no entries",
                number
            )));
        }
        let mut meta = Self::new(
            FileDescriptor::new(number, path_id, props.file_size),
            props.smallest()?,
            props.largest()?,
            props.smallest_seq,
            props.largest_seq,
        );
        meta.num_entries = props.num_entries;
        meta.num_deletions = props.num_deletions;
        meta.raw_key_size = props.raw_key_size;
        meta.raw_value_size = props.raw_value_size;
        meta.compensated_size = meta.compute_compensated_size();
        Ok(meta)
    }

    /// Deletions count double an average entry, pulling tombstone-heavy
    /// files toward compaction sooner
    fn compute_compensated_size(&self) -> u64 {
        if self.num_entries == 0 {
            return self.fd.file_size;
        }
        let average_entry = (self.raw_key_size + self.raw_value_size) / self.num_entries;
        self.fd
            .file_size
            .saturating_add(self.num_deletions.saturating_mul(average_entry).saturating_mul(2))
    }

    pub fn number(&self) -> u64 {
        self.fd.number()
    }

    pub fn file_size(&self) -> u64 {
        self.fd.file_size
    }

    pub fn smallest_user_key(&self) -> &[u8] {
        &self.smallest.user_key
    }

    pub fn largest_user_key(&self) -> &[u8] {
        &self.largest.user_key
    }

    pub fn is_being_compacted(&self) -> bool {
        self.being_compacted.load(Ordering::Acquire)
    }

    pub fn set_being_compacted(&self, value: bool) {
        self.being_compacted.store(value, Ordering::Release);
    }

    /// Does the file's user-key range touch `[begin, end]`? `None` is unbounded.
    pub fn overlaps_user_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        let after_end = matches!(end, Some(end) if self.smallest_user_key() > end);
        let before_begin = matches!(begin, Some(begin) if self.largest_user_key() < begin);
        !after_end && !before_begin
    }
}

impl Clone for FileMetaData {
    fn clone(&self) -> Self {
        Self {
            fd: self.fd.clone(),
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            smallest_seq: self.smallest_seq,
            largest_seq: self.largest_seq,
            being_compacted: AtomicBool::new(self.is_being_compacted()),
            compensated_size: self.compensated_size,
            num_entries: self.num_entries,
            num_deletions: self.num_deletions,
            raw_key_size: self.raw_key_size,
            raw_value_size: self.raw_value_size,
        }
    }
}

/// Equality over the fields persisted in the manifest
impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.fd == other.fd
            && self.smallest == other.smallest
            && self.largest == other.largest
            && self.smallest_seq == other.smallest_seq
            && self.largest_seq == other.largest_seq
    }
}

impl fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMetaData")
            .field("number", &self.number())
            .field("path_id", &self.fd.path_id())
            .field("size", &self.file_size())
            .field("smallest", &self.smallest)
            .field("largest", &self.largest)
            .field("seqs", &(self.smallest_seq, self.largest_seq))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    #[test]
    fn test_pack_roundtrip() {
        for number in [0, 1, 12345, MAX_FILE_NUMBER] {
            for path_id in 0..=MAX_PATH_ID {
                let packed = pack_file_number_and_path_id(number, path_id);
                assert_eq!(packed_file_number(packed), number);
                assert_eq!(packed_path_id(packed), path_id);
            }
        }

        let fd = FileDescriptor::new(77, 2, 4096);
        assert_eq!(fd.number(), 77);
        assert_eq!(fd.path_id(), 2);
        assert_eq!(fd.packed_number_and_path_id(), 77 | (2 << 62));
    }

    #[test]
    fn test_overlaps_user_range() {
        let meta = FileMetaData::new(
            FileDescriptor::new(1, 0, 10),
            InternalKey::new(b"c".to_vec(), 5, ValueType::Value),
            InternalKey::new(b"f".to_vec(), 2, ValueType::Value),
            2,
            5,
        );
        assert!(meta.overlaps_user_range(None, None));
        assert!(meta.overlaps_user_range(Some(b"a"), Some(b"c")));
        assert!(meta.overlaps_user_range(Some(b"f"), None));
        assert!(!meta.overlaps_user_range(Some(b"g"), None));
        assert!(!meta.overlaps_user_range(None, Some(b"b")));
    }

    #[test]
    fn test_from_properties_compensates_deletions() {
        let props = TableProperties {
            smallest_key: InternalKey::new(b"a".to_vec(), 1, ValueType::Value).encode(),
            largest_key: InternalKey::new(b"z".to_vec(), 9, ValueType::Deletion).encode(),
            smallest_seq: 1,
            largest_seq: 9,
            num_entries: 10,
            num_deletions: 5,
            raw_key_size: 100,
            raw_value_size: 900,
            file_size: 2000,
            ..Default::default()
        };
        let meta = FileMetaData::from_properties(4, 0, &props).unwrap();
        assert_eq!(meta.number(), 4);
        assert_eq!(meta.compensated_size, 2000 + 5 * 100 * 2);
        assert!(meta.smallest_seq <= meta.largest_seq);

        let empty = TableProperties::default();
        assert!(FileMetaData::from_properties(5, 0, &empty).is_err());
    }
}
