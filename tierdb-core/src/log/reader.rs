//! Log reader for recovery

use super::{decode_record, Decoded};
use crate::{Result, TierError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Reads framed records back from a log file
pub struct LogReader {
    path: PathBuf,
    data: Vec<u8>,
    offset: usize,
    paranoid: bool,
    records: usize,
}

impl LogReader {
    /// Load the log at `path`.
    ///
    /// With `paranoid` set a damaged record in the middle of the file is an
    /// error; otherwise replay stops there with a warning.
    pub fn open(path: impl AsRef<Path>, paranoid: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        Ok(Self {
            path,
            data,
            offset: 0,
            paranoid,
            records: 0,
        })
    }

    /// Next record, or `None` at the end of the readable log
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }

        match decode_record(&self.data[self.offset..]) {
            Ok(Decoded::Record(payload, consumed)) => {
                let payload = payload.to_vec();
                self.offset += consumed;
                self.records += 1;
                Ok(Some(payload))
            }
            Ok(Decoded::Truncated) => {
                // Crash during append
                warn!(
                    "Truncated record at offset {} in {:?}, ignoring tail",
                    self.offset, self.path
                );
                self.offset = self.data.len();
                Ok(None)
            }
            Err(TierError::ChecksumMismatch { expected, actual }) => {
                let at = self.offset;
                let at_tail = self.record_reaches_end(at);
                self.offset = self.data.len();
                if at_tail || !self.paranoid {
                    warn!(
                        "Checksum mismatch at offset {} in {:?}, truncating",
                        at, self.path
                    );
                    return Ok(None);
                }
                Err(TierError::Corruption(format!(
                    "checksum mismatch at offset {} in {:?} (expected {:#x}, got {:#x})",
                    at, self.path, expected, actual
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn record_reaches_end(&self, at: usize) -> bool {
        let rest = &self.data[at..];
        if rest.len() < 4 {
            return true;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        len + super::RECORD_OVERHEAD >= rest.len()
    }

    /// Records successfully read so far
    pub fn records_read(&self) -> usize {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogWriter;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_log(path: &Path, records: &[&[u8]]) {
        let mut writer = LogWriter::create(path, 1).unwrap();
        for r in records {
            writer.add_record(r).unwrap();
        }
        writer.sync().unwrap();
    }

    #[test]
    fn test_log_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.log");
        let records: Vec<Vec<u8>> = (0..10).map(|i| format!("record-{}", i).into_bytes()).collect();
        let refs: Vec<&[u8]> = records.iter().map(|r| r.as_slice()).collect();
        write_log(&path, &refs);

        let mut reader = LogReader::open(&path, true).unwrap();
        let mut recovered = Vec::new();
        while let Some(r) = reader.read_record().unwrap() {
            recovered.push(r);
        }
        assert_eq!(recovered, records);
        assert_eq!(reader.records_read(), 10);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.log");
        write_log(&path, &[b"first", b"second"]);

        // Half of a third record
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[20, 0, 0, 0, b'x']).unwrap();

        let mut reader = LogReader::open(&path, true).unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap(), b"first");
        assert_eq!(reader.read_record().unwrap().unwrap(), b"second");
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn test_mid_file_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.log");
        write_log(&path, &[b"first", b"second", b"third"]);

        let mut data = fs::read(&path).unwrap();
        data[5] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let mut strict = LogReader::open(&path, true).unwrap();
        assert!(matches!(strict.read_record(), Err(TierError::Corruption(_))));

        let mut lenient = LogReader::open(&path, false).unwrap();
        assert!(lenient.read_record().unwrap().is_none());
    }
}
