//! Append-only record log
//!
//! Both the write-ahead log and the MANIFEST are sequences of framed records:
//!
//! ```text
//! +------------+-------------------+-----------+
//! | len: u32le | payload (len B)   | crc: u32le|
//! +------------+-------------------+-----------+
//! ```
//!
//! The checksum covers the payload only. A record cut short by a crash is
//! detected by its length and ends replay of that file.

mod reader;
mod writer;

pub use reader::LogReader;
pub use writer::LogWriter;

use crate::{Result, TierError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes of framing around every payload
pub const RECORD_OVERHEAD: usize = 8;

/// Frame `payload` as one log record
pub fn encode_record(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + RECORD_OVERHEAD);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.freeze()
}

/// Outcome of decoding the record at the start of a buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A complete, verified record and the bytes it occupied
    Record(&'a [u8], usize),
    /// The buffer ends inside a record
    Truncated,
}

/// Decode one record from the front of `data`
pub fn decode_record(data: &[u8]) -> Result<Decoded<'_>> {
    if data.len() < 4 {
        return Ok(Decoded::Truncated);
    }
    let len = (&data[..4]).get_u32_le() as usize;
    let total = len + RECORD_OVERHEAD;
    if data.len() < total {
        return Ok(Decoded::Truncated);
    }

    let payload = &data[4..4 + len];
    let expected = (&data[4 + len..total]).get_u32_le();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(TierError::ChecksumMismatch { expected, actual });
    }
    Ok(Decoded::Record(payload, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_framing() {
        let record = encode_record(b"hello");
        assert_eq!(record.len(), 5 + RECORD_OVERHEAD);
        assert_eq!(
            decode_record(&record).unwrap(),
            Decoded::Record(&b"hello"[..], record.len())
        );
    }

    #[test]
    fn test_truncated_record() {
        let record = encode_record(b"hello world");
        assert_eq!(decode_record(&record[..3]).unwrap(), Decoded::Truncated);
        assert_eq!(
            decode_record(&record[..record.len() - 1]).unwrap(),
            Decoded::Truncated
        );
    }

    #[test]
    fn test_checksum_validation() {
        let mut record = encode_record(b"payload").to_vec();
        record[6] ^= 0xFF;
        assert!(matches!(
            decode_record(&record),
            Err(TierError::ChecksumMismatch { .. })
        ));
    }
}
