//! Core types for TierDB

use crate::{Result, TierError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Monotonically increasing write sequence number (56 bits are usable)
pub type SequenceNumber = u64;

/// Largest sequence number that fits next to the 8-bit value type
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Column family identifier
pub type ColumnFamilyId = u32;

/// Id of the column family every database has
pub const DEFAULT_COLUMN_FAMILY_ID: ColumnFamilyId = 0;

/// Name of the column family every database has
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// Name persisted in the manifest for the internal key ordering
pub const COMPARATOR_NAME: &str = "tierdb.BytewiseComparator";

/// Size of the packed (sequence, type) trailer appended to encoded keys
pub const TRAILER_SIZE: usize = 8;

/// Operation tag carried by every internal key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    /// Tombstone
    Deletion = 0,
    /// Full value
    Value = 1,
    /// Merge operand applied on top of older entries
    Merge = 2,
}

/// Type used when building seek keys: the largest tag sorts first for a given sequence
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Merge;

impl TryFrom<u8> for ValueType {
    type Error = TierError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            2 => Ok(ValueType::Merge),
            _ => Err(TierError::InvalidFormat(format!(
                "Invalid value type: {}",
                value
            ))),
        }
    }
}

/// Pack a sequence number and value type into one trailer word
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Split a trailer word back into its sequence number and value type
pub fn unpack_sequence_and_type(packed: u64) -> Result<(SequenceNumber, ValueType)> {
    let value_type = ValueType::try_from((packed & 0xff) as u8)?;
    Ok((packed >> 8, value_type))
}

/// User key plus sequence number plus operation tag.
///
/// Ordering: user key ascending, then sequence number descending, then type
/// descending, so the newest version of a key is met first by every scan.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl InternalKey {
    /// Create a new internal key
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: SequenceNumber, value_type: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// Key that positions a seek at the newest entry for `user_key` visible at `sequence`
    pub fn lookup(user_key: &[u8], sequence: SequenceNumber) -> Self {
        Self::new(user_key.to_vec(), sequence, VALUE_TYPE_FOR_SEEK)
    }

    /// Packed trailer word
    pub fn trailer(&self) -> u64 {
        pack_sequence_and_type(self.sequence, self.value_type)
    }

    /// Approximate memory footprint in bytes
    pub fn size(&self) -> usize {
        self.user_key.len() + TRAILER_SIZE
    }

    /// Encode as `user_key || trailer (u64 little endian)`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded form to `buf`
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.user_key);
        buf.put_u64_le(self.trailer());
    }

    /// Decode from the encoded form
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < TRAILER_SIZE {
            return Err(TierError::Corruption(format!(
                "Internal key too short: {} bytes",
                data.len()
            )));
        }
        let split = data.len() - TRAILER_SIZE;
        let mut trailer = &data[split..];
        let (sequence, value_type) = unpack_sequence_and_type(trailer.get_u64_le())?;
        Ok(Self {
            user_key: data[..split].to_vec(),
            sequence,
            value_type,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.trailer().cmp(&self.trailer()))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' @ {} : {:?}",
            String::from_utf8_lossy(&self.user_key),
            self.sequence,
            self.value_type
        )
    }
}

/// Compare two encoded internal keys without allocating
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    let (a_user, a_trailer) = split_encoded(a);
    let (b_user, b_trailer) = split_encoded(b);
    a_user.cmp(b_user).then_with(|| b_trailer.cmp(&a_trailer))
}

/// Borrow the user key portion of an encoded internal key
pub fn encoded_user_key(encoded: &[u8]) -> &[u8] {
    split_encoded(encoded).0
}

fn split_encoded(encoded: &[u8]) -> (&[u8], u64) {
    if encoded.len() < TRAILER_SIZE {
        return (encoded, 0);
    }
    let split = encoded.len() - TRAILER_SIZE;
    let mut trailer = &encoded[split..];
    (&encoded[..split], trailer.get_u64_le())
}

/// Inclusive user-key range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Create a new key range
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Check if two inclusive ranges share at least one key
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Check if a key falls in this range
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key <= self.end.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_ordering() {
        let a5 = InternalKey::new(b"a".to_vec(), 5, ValueType::Value);
        let a3 = InternalKey::new(b"a".to_vec(), 3, ValueType::Value);
        let b9 = InternalKey::new(b"b".to_vec(), 9, ValueType::Value);

        // Same user key: newer first
        assert!(a5 < a3);
        // User key dominates
        assert!(a3 < b9);

        // Seek key sorts before every entry at the same sequence
        let seek = InternalKey::lookup(b"a", 5);
        assert!(seek <= a5);
        assert!(seek < a3);
    }

    #[test]
    fn test_encode_decode() {
        let key = InternalKey::new(b"user".to_vec(), 42, ValueType::Merge);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 4 + TRAILER_SIZE);
        assert_eq!(encoded_user_key(&encoded), b"user");
        assert_eq!(InternalKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn test_encoded_compare_matches_ord() {
        let keys = vec![
            InternalKey::new(b"a".to_vec(), 1, ValueType::Value),
            InternalKey::new(b"a".to_vec(), 7, ValueType::Deletion),
            InternalKey::new(b"ab".to_vec(), 2, ValueType::Value),
            InternalKey::new(b"b".to_vec(), MAX_SEQUENCE_NUMBER, ValueType::Merge),
        ];
        for x in &keys {
            for y in &keys {
                assert_eq!(compare_encoded(&x.encode(), &y.encode()), x.cmp(y));
            }
        }
    }

    #[test]
    fn test_decode_rejects_short_and_bad_type() {
        assert!(InternalKey::decode(b"abc").is_err());
        let mut encoded = InternalKey::new(b"k".to_vec(), 1, ValueType::Value).encode();
        let n = encoded.len();
        encoded[n - TRAILER_SIZE] = 9;
        assert!(InternalKey::decode(&encoded).is_err());
    }

    #[test]
    fn test_key_range_overlap() {
        let r1 = KeyRange::new(b"a".to_vec(), b"c".to_vec());
        let r2 = KeyRange::new(b"c".to_vec(), b"e".to_vec());
        let r3 = KeyRange::new(b"d".to_vec(), b"e".to_vec());
        assert!(r1.overlaps(&r2));
        assert!(!r1.overlaps(&r3));
        assert!(r1.contains(b"b"));
        assert!(!r1.contains(b"d"));
    }
}
