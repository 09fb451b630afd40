//! Log writer

use super::encode_record;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Appends framed records to one log file.
///
/// A writer has exactly one user at a time: the write-group leader for the
/// WAL, the manifest writer for a MANIFEST.
pub struct LogWriter {
    path: PathBuf,
    number: u64,
    file: BufWriter<File>,
    size: u64,
}

impl LogWriter {
    /// Create (truncating) the log file at `path`
    pub fn create(path: impl AsRef<Path>, number: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            number,
            file: BufWriter::new(file),
            size: 0,
        })
    }

    /// Append one record; it reaches the OS on the next `flush` or `sync`
    pub fn add_record(&mut self, payload: &[u8]) -> Result<u64> {
        let record = encode_record(payload);
        self.file.write_all(&record)?;
        let offset = self.size;
        self.size += record.len() as u64;
        Ok(offset)
    }

    /// Push buffered records to the OS
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// File number this log was created with
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Bytes appended so far
    pub fn file_size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::RECORD_OVERHEAD;
    use tempfile::TempDir;

    #[test]
    fn test_log_writer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("000001.log");
        let mut writer = LogWriter::create(&path, 1).unwrap();

        assert_eq!(writer.add_record(b"abc").unwrap(), 0);
        assert_eq!(writer.add_record(b"de").unwrap(), 3 + RECORD_OVERHEAD as u64);
        writer.sync().unwrap();

        let expected = 5 + 2 * RECORD_OVERHEAD as u64;
        assert_eq!(writer.file_size(), expected);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
        assert_eq!(writer.number(), 1);
    }
}
