//! Manifest records describing one transition between versions
//!
//! Each record is a sequence of `varint tag` + field pairs. Integers are
//! varints; byte strings are a varint length followed by the bytes.

use super::{FileDescriptor, FileMetaData};
use crate::types::{ColumnFamilyId, InternalKey, SequenceNumber, DEFAULT_COLUMN_FAMILY_ID};
use crate::{Result, TierError};
use integer_encoding::VarInt;
use std::collections::BTreeSet;

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_DELETED_FILE: u32 = 6;
const TAG_PREV_LOG_NUMBER: u32 = 9;
const TAG_NEW_FILE: u32 = 102;
const TAG_COLUMN_FAMILY: u32 = 200;
const TAG_COLUMN_FAMILY_ADD: u32 = 201;
const TAG_COLUMN_FAMILY_DROP: u32 = 202;
const TAG_MAX_COLUMN_FAMILY: u32 = 203;

/// A diff between two versions of one column family
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub max_column_family: Option<ColumnFamilyId>,
    /// `(level, file number)`
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
    pub column_family: ColumnFamilyId,
    /// Name of a column family created by this edit
    pub column_family_add: Option<String>,
    pub column_family_drop: bool,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit against a specific column family
    pub fn for_column_family(cf: ColumnFamilyId) -> Self {
        Self {
            column_family: cf,
            ..Default::default()
        }
    }

    pub fn set_comparator(&mut self, name: impl Into<String>) {
        self.comparator = Some(name.into());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    pub fn set_max_column_family(&mut self, cf: ColumnFamilyId) {
        self.max_column_family = Some(cf);
    }

    pub fn add_file(&mut self, level: usize, file: FileMetaData) {
        debug_assert!(file.smallest_seq <= file.largest_seq);
        self.new_files.push((level, file));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    /// Mark this edit as creating column family `name` with id `cf`
    pub fn add_column_family(&mut self, cf: ColumnFamilyId, name: impl Into<String>) {
        self.column_family = cf;
        self.column_family_add = Some(name.into());
    }

    pub fn drop_column_family(&mut self, cf: ColumnFamilyId) {
        self.column_family = cf;
        self.column_family_drop = true;
    }

    /// True for column family add/drop records
    pub fn is_column_family_manipulation(&self) -> bool {
        self.column_family_add.is_some() || self.column_family_drop
    }

    fn has_file_changes(&self) -> bool {
        !self.new_files.is_empty() || !self.deleted_files.is_empty()
    }

    /// An edit either restructures column families or changes files, never both
    pub fn validate(&self) -> Result<()> {
        if self.column_family_add.is_some() && self.column_family_drop {
            return Err(TierError::InvalidArgument(
                "edit both adds and drops a column family".into(),
            ));
        }
        if self.is_column_family_manipulation() && self.has_file_changes() {
            return Err(TierError::InvalidArgument(
                "column family add/drop edit carries file changes".into(),
            ));
        }
        for (_, file) in &self.new_files {
            if file.smallest_seq > file.largest_seq {
                return Err(TierError::InvalidArgument(format!(
                    "file {} has smallest_seq {} > largest_seq {}",
                    file.number(),
                    file.smallest_seq,
                    file.largest_seq
                )));
            }
        }
        Ok(())
    }

    /// Serialize into a manifest record
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator {
            put_varint(&mut buf, TAG_COMPARATOR as u64);
            put_slice(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint(&mut buf, TAG_LOG_NUMBER as u64);
            put_varint(&mut buf, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint(&mut buf, TAG_PREV_LOG_NUMBER as u64);
            put_varint(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint(&mut buf, TAG_NEXT_FILE_NUMBER as u64);
            put_varint(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint(&mut buf, TAG_LAST_SEQUENCE as u64);
            put_varint(&mut buf, n);
        }
        if let Some(n) = self.max_column_family {
            put_varint(&mut buf, TAG_MAX_COLUMN_FAMILY as u64);
            put_varint(&mut buf, n as u64);
        }
        for (level, number) in &self.deleted_files {
            put_varint(&mut buf, TAG_DELETED_FILE as u64);
            put_varint(&mut buf, *level as u64);
            put_varint(&mut buf, *number);
        }
        for (level, file) in &self.new_files {
            put_varint(&mut buf, TAG_NEW_FILE as u64);
            put_varint(&mut buf, *level as u64);
            put_varint(&mut buf, file.fd.number());
            put_varint(&mut buf, file.fd.path_id() as u64);
            put_varint(&mut buf, file.fd.file_size);
            put_slice(&mut buf, &file.smallest.encode());
            put_slice(&mut buf, &file.largest.encode());
            put_varint(&mut buf, file.smallest_seq);
            put_varint(&mut buf, file.largest_seq);
        }
        if self.column_family != DEFAULT_COLUMN_FAMILY_ID {
            put_varint(&mut buf, TAG_COLUMN_FAMILY as u64);
            put_varint(&mut buf, self.column_family as u64);
        }
        if let Some(name) = &self.column_family_add {
            put_varint(&mut buf, TAG_COLUMN_FAMILY_ADD as u64);
            put_slice(&mut buf, name.as_bytes());
        }
        if self.column_family_drop {
            put_varint(&mut buf, TAG_COLUMN_FAMILY_DROP as u64);
        }
        buf
    }

    /// Parse a manifest record
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = Self::new();
        let mut input = Input { data, pos: 0 };

        while !input.is_empty() {
            let tag = input.varint("tag")?;
            match tag as u32 {
                TAG_COMPARATOR => {
                    let name = input.slice("comparator name")?;
                    edit.comparator = Some(utf8(name, "comparator name")?);
                }
                TAG_LOG_NUMBER => edit.log_number = Some(input.varint("log number")?),
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(input.varint("previous log number")?)
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(input.varint("next file number")?)
                }
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(input.varint("last sequence")?),
                TAG_MAX_COLUMN_FAMILY => {
                    edit.max_column_family = Some(input.varint_u32("max column family")?)
                }
                TAG_DELETED_FILE => {
                    let level = input.varint("deleted file")? as usize;
                    let number = input.varint("deleted file")?;
                    edit.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE => {
                    let level = input.varint("new-file entry")? as usize;
                    let number = input.varint("new-file entry")?;
                    let path_id = input.varint_u32("new-file entry")?;
                    let file_size = input.varint("new-file entry")?;
                    let smallest = InternalKey::decode(input.slice("new-file entry")?)?;
                    let largest = InternalKey::decode(input.slice("new-file entry")?)?;
                    let smallest_seq = input.varint("new-file entry")?;
                    let largest_seq = input.varint("new-file entry")?;
                    if path_id > super::MAX_PATH_ID || number > super::MAX_FILE_NUMBER {
                        return Err(TierError::Corruption(format!(
                            "new-file entry: number {} path {} out of range",
                            number, path_id
                        )));
                    }
                    if smallest_seq > largest_seq {
                        return Err(TierError::Corruption(format!(
                            "new-file entry: file {} sequence range inverted",
                            number
                        )));
                    }
                    edit.new_files.push((
                        level,
                        FileMetaData::new(
                            FileDescriptor::new(number, path_id, file_size),
                            smallest,
                            largest,
                            smallest_seq,
                            largest_seq,
                        ),
                    ));
                }
                TAG_COLUMN_FAMILY => edit.column_family = input.varint_u32("column family id")?,
                TAG_COLUMN_FAMILY_ADD => {
                    let name = input.slice("column family add")?;
                    edit.column_family_add = Some(utf8(name, "column family name")?);
                }
                TAG_COLUMN_FAMILY_DROP => edit.column_family_drop = true,
                other => {
                    return Err(TierError::Corruption(format!(
                        "unknown tag {} in version edit",
                        other
                    )))
                }
            }
        }

        edit.validate().map_err(|e| TierError::Corruption(e.to_string()))?;
        Ok(edit)
    }
}

fn put_varint(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.encode_var_vec());
}

fn put_slice(buf: &mut Vec<u8>, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TierError::Corruption(format!("{} is not valid UTF-8", what)))
}

struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn varint(&mut self, what: &str) -> Result<u64> {
        match u64::decode_var(&self.data[self.pos..]) {
            Some((value, read)) => {
                self.pos += read;
                Ok(value)
            }
            None => Err(TierError::Corruption(format!("bad varint in {}", what))),
        }
    }

    fn varint_u32(&mut self, what: &str) -> Result<u32> {
        let value = self.varint(what)?;
        u32::try_from(value)
            .map_err(|_| TierError::Corruption(format!("{} out of range: {}", what, value)))
    }

    fn slice(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.varint(what)? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| TierError::Corruption(format!("truncated {}", what)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}
