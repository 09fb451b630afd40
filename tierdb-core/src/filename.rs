//! File naming for everything the engine keeps on disk

use crate::Result;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Kind of file found in a database directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Descriptor,
    Current,
    Lock,
    Identity,
    Temp,
}

/// `NNNNNN.log`
pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.log", number))
}

/// `NNNNNN.sst` inside `dir`
pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", number))
}

/// `MANIFEST-NNNNNN`
pub fn descriptor_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", number))
}

/// `CURRENT`
pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

/// `LOCK`
pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// `IDENTITY`
pub fn identity_file_name(dir: &Path) -> PathBuf {
    dir.join("IDENTITY")
}

/// `NNNNNN.dbtmp`
pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.dbtmp", number))
}

/// Directory holding tables for `path_id`.
///
/// With no extra paths configured every path id maps to the database directory.
pub fn table_dir(db_dir: &Path, db_paths: &[PathBuf], path_id: u32) -> PathBuf {
    db_paths
        .get(path_id as usize)
        .cloned()
        .unwrap_or_else(|| db_dir.to_path_buf())
}

/// Classify a file name, returning its number (0 for unnumbered files)
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    match name {
        "CURRENT" => return Some((0, FileType::Current)),
        "LOCK" => return Some((0, FileType::Lock)),
        "IDENTITY" => return Some((0, FileType::Identity)),
        _ => {}
    }

    if let Some(number) = name.strip_prefix("MANIFEST-") {
        return number.parse().ok().map(|n| (n, FileType::Descriptor));
    }

    let (stem, suffix) = name.split_once('.')?;
    let number: u64 = stem.parse().ok()?;
    let file_type = match suffix {
        "log" => FileType::Log,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((number, file_type))
}

/// Point `CURRENT` at `MANIFEST-<manifest_number>` via write-then-rename
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let manifest = descriptor_file_name(dir, manifest_number);
    let contents = format!(
        "{}\n",
        manifest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    );

    let tmp = temp_file_name(dir, manifest_number);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, current_file_name(dir)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read the manifest name `CURRENT` points at
pub fn read_current_file(dir: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file_name(dir))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || !name.starts_with("MANIFEST-") {
        return Err(crate::TierError::Corruption(
            "CURRENT file does not name a manifest".into(),
        ));
    }
    Ok(name.to_string())
}
