//! Atomic groups of updates, and their WAL record form

use super::ColumnFamilyHandle;
use crate::types::{ColumnFamilyId, SequenceNumber, ValueType, DEFAULT_COLUMN_FAMILY_ID};
use crate::{Result, TierError};
use serde::{Deserialize, Serialize};

/// Fixed per-record cost added to the batch size estimate
const RECORD_OVERHEAD: usize = 16;

/// One update inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub cf: ColumnFamilyId,
    pub value_type: ValueType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An ordered list of puts, deletes and merges applied atomically.
///
/// Records take consecutive sequence numbers in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    records: Vec<BatchRecord>,
    data_size: usize,
}

/// WAL payload: the group's first sequence number and its records
#[derive(Serialize)]
struct EncodedGroup<'a> {
    sequence: SequenceNumber,
    records: Vec<&'a BatchRecord>,
}

#[derive(Deserialize)]
struct DecodedGroup {
    sequence: SequenceNumber,
    records: Vec<BatchRecord>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, cf: ColumnFamilyId, value_type: ValueType, key: &[u8], value: &[u8]) {
        self.data_size += key.len() + value.len() + RECORD_OVERHEAD;
        self.records.push(BatchRecord {
            cf,
            value_type,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Store `value` under `key` in the default column family
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.push(DEFAULT_COLUMN_FAMILY_ID, ValueType::Value, key, value);
    }

    pub fn put_cf(&mut self, cf: &ColumnFamilyHandle, key: &[u8], value: &[u8]) {
        self.push(cf.id(), ValueType::Value, key, value);
    }

    /// Remove `key` from the default column family
    pub fn delete(&mut self, key: &[u8]) {
        self.push(DEFAULT_COLUMN_FAMILY_ID, ValueType::Deletion, key, &[]);
    }

    pub fn delete_cf(&mut self, cf: &ColumnFamilyHandle, key: &[u8]) {
        self.push(cf.id(), ValueType::Deletion, key, &[]);
    }

    /// Stack a merge operand on `key` in the default column family
    pub fn merge(&mut self, key: &[u8], operand: &[u8]) {
        self.push(DEFAULT_COLUMN_FAMILY_ID, ValueType::Merge, key, operand);
    }

    pub fn merge_cf(&mut self, cf: &ColumnFamilyHandle, key: &[u8], operand: &[u8]) {
        self.push(cf.id(), ValueType::Merge, key, operand);
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
        self.data_size = 0;
    }

    /// Number of records (and so of sequence numbers consumed)
    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Approximate encoded size in bytes
    pub fn approximate_size(&self) -> usize {
        self.data_size
    }

    pub fn records(&self) -> impl Iterator<Item = &BatchRecord> {
        self.records.iter()
    }

    /// Column families touched by this batch
    pub(crate) fn column_families(&self) -> impl Iterator<Item = ColumnFamilyId> + '_ {
        self.records.iter().map(|r| r.cf)
    }

    /// Encode a write group as one WAL record starting at `sequence`
    pub(crate) fn encode_group<'a>(
        sequence: SequenceNumber,
        batches: impl IntoIterator<Item = &'a WriteBatch>,
    ) -> Result<Vec<u8>> {
        let group = EncodedGroup {
            sequence,
            records: batches.into_iter().flat_map(|b| b.records.iter()).collect(),
        };
        Ok(bincode::serialize(&group)?)
    }

    /// Decode a WAL record into its starting sequence and batch
    pub(crate) fn decode_record(data: &[u8]) -> Result<(SequenceNumber, WriteBatch)> {
        let group: DecodedGroup = bincode::deserialize(data)
            .map_err(|e| TierError::Corruption(format!("bad write batch record: {}", e)))?;
        let data_size = group
            .records
            .iter()
            .map(|r| r.key.len() + r.value.len() + RECORD_OVERHEAD)
            .sum();
        Ok((
            group.sequence,
            WriteBatch {
                records: group.records,
                data_size,
            },
        ))
    }
}
