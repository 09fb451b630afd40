//! The mutable chain of versions and the MANIFEST that persists it
//!
//! A `VersionSet` lives inside the engine state and is only touched with the
//! engine lock held. Manifest I/O is split out so callers can release the
//! lock while it runs:
//!
//! 1. `prepare_*` (locked) validates the edit, fills in counters and builds
//!    the next version, taking the manifest writer with it
//! 2. [`ManifestWrite::write`] (unlocked) appends and syncs the record,
//!    rolling over to a new MANIFEST when needed
//! 3. [`VersionSet::finish_apply`] (locked) installs the new version, or
//!    drops it and leaves the current one untouched if the write failed

use super::{FileMetaData, Version, VersionBuilder, VersionEdit};
use crate::filename::{descriptor_file_name, read_current_file, set_current_file};
use crate::log::{LogReader, LogWriter};
use crate::options::{ColumnFamilyOptions, Options};
use crate::types::{
    ColumnFamilyId, SequenceNumber, COMPARATOR_NAME, DEFAULT_COLUMN_FAMILY_ID,
    DEFAULT_COLUMN_FAMILY_NAME,
};
use crate::{Result, TierError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Version bookkeeping for one column family
pub struct FamilyVersions {
    pub id: ColumnFamilyId,
    pub name: String,
    pub options: ColumnFamilyOptions,
    current: Arc<Version>,
    /// Every version still referenced by a superversion or iterator
    live: Vec<Weak<Version>>,
    /// WALs below this number hold nothing for this family
    pub log_number: u64,
}

impl FamilyVersions {
    fn new(id: ColumnFamilyId, name: String, options: ColumnFamilyOptions, current: Version) -> Self {
        let current = Arc::new(current);
        Self {
            id,
            name,
            options,
            live: vec![Arc::downgrade(&current)],
            current,
            log_number: 0,
        }
    }

    pub fn current(&self) -> &Arc<Version> {
        &self.current
    }

    fn install(&mut self, version: Version) {
        let version = Arc::new(version);
        self.live.retain(|v| v.strong_count() > 0);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    /// Versions not yet released by every reader, current included
    pub fn num_live_versions(&self) -> usize {
        self.live.iter().filter(|v| v.strong_count() > 0).count()
    }
}

enum ApplyKind {
    Files {
        version: Version,
        removed: Vec<Arc<FileMetaData>>,
    },
    AddFamily {
        name: String,
        options: ColumnFamilyOptions,
    },
    DropFamily,
}

/// A manifest append prepared under the engine lock
pub struct ManifestWrite {
    db_dir: PathBuf,
    cf_id: ColumnFamilyId,
    edit: VersionEdit,
    kind: ApplyKind,
    writer: Option<LogWriter>,
    /// `(number, snapshot records)` when this write starts a new MANIFEST
    new_manifest: Option<(u64, Vec<Vec<u8>>)>,
}

impl ManifestWrite {
    pub fn cf_id(&self) -> ColumnFamilyId {
        self.cf_id
    }

    /// Append the edit and sync. Runs without the engine lock.
    pub fn write(&mut self) -> Result<()> {
        if let Some((number, snapshot)) = &self.new_manifest {
            let path = descriptor_file_name(&self.db_dir, *number);
            let result = Self::write_new_manifest(&path, *number, snapshot, &self.edit)
                .and_then(|writer| {
                    set_current_file(&self.db_dir, *number)?;
                    Ok(writer)
                });
            return match result {
                Ok(writer) => {
                    info!("Created manifest {:?}", path);
                    self.writer = Some(writer);
                    Ok(())
                }
                Err(e) => {
                    let _ = fs::remove_file(&path);
                    Err(e)
                }
            };
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TierError::Internal("manifest writer missing".into()))?;
        writer.add_record(&self.edit.encode())?;
        writer.sync()
    }

    fn write_new_manifest(
        path: &Path,
        number: u64,
        snapshot: &[Vec<u8>],
        edit: &VersionEdit,
    ) -> Result<LogWriter> {
        let mut writer = LogWriter::create(path, number)?;
        for record in snapshot {
            writer.add_record(record)?;
        }
        writer.add_record(&edit.encode())?;
        writer.sync()?;
        Ok(writer)
    }
}

/// All column families' version chains plus the global file and sequence counters
pub struct VersionSet {
    db_dir: PathBuf,
    max_manifest_file_size: u64,
    default_cf_options: ColumnFamilyOptions,
    families: BTreeMap<ColumnFamilyId, FamilyVersions>,

    next_file_number: u64,
    last_sequence: Arc<AtomicU64>,
    prev_log_number: u64,
    manifest_file_number: u64,
    max_column_family: ColumnFamilyId,
    next_version_number: u64,

    manifest: Option<LogWriter>,
    manifest_busy: bool,
    /// Files dropped from some version; deletable once nothing else holds them
    obsolete_files: Vec<Arc<FileMetaData>>,
}

impl VersionSet {
    /// Write the first MANIFEST of a fresh database and point CURRENT at it
    pub fn create_new(db_dir: &Path) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator(COMPARATOR_NAME);
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(db_dir, 1);
        let result = LogWriter::create(&manifest, 1).and_then(|mut writer| {
            writer.add_record(&edit.encode())?;
            writer.sync()?;
            set_current_file(db_dir, 1)
        });
        if result.is_err() {
            let _ = fs::remove_file(&manifest);
        }
        result
    }

    /// Rebuild every column family's current version from the MANIFEST.
    ///
    /// Families found on disk take their options from `cf_options` by name,
    /// falling back to the database default.
    pub fn recover(
        db_dir: &Path,
        options: &Options,
        cf_options: &HashMap<String, ColumnFamilyOptions>,
    ) -> Result<Self> {
        let manifest_name = read_current_file(db_dir)?;
        let manifest_path = db_dir.join(&manifest_name);
        let manifest_number = crate::filename::parse_file_name(&manifest_name)
            .map(|(n, _)| n)
            .ok_or_else(|| TierError::Corruption(format!("bad manifest name {}", manifest_name)))?;

        let options_for = |name: &str| {
            cf_options
                .get(name)
                .cloned()
                .unwrap_or_else(|| options.column_family.clone())
        };

        struct Recovering {
            name: String,
            options: ColumnFamilyOptions,
            builder: VersionBuilder,
            log_number: u64,
        }
        let mut families: BTreeMap<ColumnFamilyId, Recovering> = BTreeMap::new();
        let default_options = options_for(DEFAULT_COLUMN_FAMILY_NAME);
        families.insert(
            DEFAULT_COLUMN_FAMILY_ID,
            Recovering {
                name: DEFAULT_COLUMN_FAMILY_NAME.to_string(),
                builder: VersionBuilder::new(Arc::new(Version::new(
                    DEFAULT_COLUMN_FAMILY_ID,
                    default_options.num_levels,
                ))),
                options: default_options,
                log_number: 0,
            },
        );

        let mut next_file_number = None;
        let mut last_sequence = None;
        let mut prev_log_number = 0;
        let mut max_column_family = 0;

        let mut reader = LogReader::open(&manifest_path, true)?;
        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;

            if let Some(name) = &edit.comparator {
                if name != COMPARATOR_NAME {
                    return Err(TierError::InvalidArgument(format!(
                        "comparator {} does not match {}",
                        name, COMPARATOR_NAME
                    )));
                }
            }

            if let Some(name) = &edit.column_family_add {
                if families.contains_key(&edit.column_family) {
                    return Err(TierError::Corruption(format!(
                        "column family {} added twice",
                        edit.column_family
                    )));
                }
                let cf_opts = options_for(name);
                families.insert(
                    edit.column_family,
                    Recovering {
                        name: name.clone(),
                        builder: VersionBuilder::new(Arc::new(Version::new(
                            edit.column_family,
                            cf_opts.num_levels,
                        ))),
                        options: cf_opts,
                        log_number: edit.log_number.unwrap_or(0),
                    },
                );
            } else if edit.column_family_drop {
                if families.remove(&edit.column_family).is_none() {
                    return Err(TierError::Corruption(format!(
                        "dropping unknown column family {}",
                        edit.column_family
                    )));
                }
            } else {
                let family = families.get_mut(&edit.column_family).ok_or_else(|| {
                    TierError::Corruption(format!(
                        "edit for unknown column family {}",
                        edit.column_family
                    ))
                })?;
                family.builder.apply(&edit)?;
                if let Some(n) = edit.log_number {
                    family.log_number = n;
                }
            }

            if let Some(n) = edit.prev_log_number {
                prev_log_number = n;
            }
            if let Some(n) = edit.next_file_number {
                next_file_number = Some(n);
            }
            if let Some(n) = edit.last_sequence {
                last_sequence = Some(n);
            }
            if let Some(n) = edit.max_column_family {
                max_column_family = max_column_family.max(n);
            }
        }

        let next_file_number = next_file_number.ok_or_else(|| {
            TierError::Corruption("no next-file-number entry in manifest".into())
        })?;
        let last_sequence = last_sequence
            .ok_or_else(|| TierError::Corruption("no last-sequence entry in manifest".into()))?;

        let mut set = Self {
            db_dir: db_dir.to_path_buf(),
            max_manifest_file_size: options.max_manifest_file_size,
            default_cf_options: options.column_family.clone(),
            families: BTreeMap::new(),
            next_file_number: next_file_number.max(manifest_number + 1),
            last_sequence: Arc::new(AtomicU64::new(last_sequence)),
            prev_log_number,
            manifest_file_number: manifest_number,
            max_column_family,
            next_version_number: 1,
            manifest: None,
            manifest_busy: false,
            obsolete_files: Vec::new(),
        };

        for (id, family) in families {
            let version_number = set.bump_version_number();
            let (version, _) = family.builder.save(version_number)?;
            let mut live = HashSet::new();
            version.add_live_files(&mut live);
            for number in live {
                set.mark_file_number_used(number);
            }
            set.max_column_family = set.max_column_family.max(id);
            let mut recovered = FamilyVersions::new(id, family.name, family.options, version);
            recovered.log_number = family.log_number;
            info!(
                "Recovered column family {} ({}) with {}, log {}",
                recovered.name,
                id,
                recovered.current.level_summary(),
                recovered.log_number
            );
            set.families.insert(id, recovered);
        }

        info!(
            "Recovered manifest {}: next file {}, last sequence {}",
            manifest_name, set.next_file_number, last_sequence
        );
        Ok(set)
    }

    fn bump_version_number(&mut self) -> u64 {
        let n = self.next_version_number;
        self.next_version_number += 1;
        n
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Allocate a file number
    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Make sure `number` is never handed out again
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn set_last_sequence(&self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence());
        self.last_sequence.store(sequence, Ordering::Release);
    }

    /// Shared handle on the last published sequence, readable without the engine lock
    pub fn sequence_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.last_sequence)
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn max_column_family(&self) -> ColumnFamilyId {
        self.max_column_family
    }

    /// True while a manifest write is in flight without the lock
    pub fn manifest_busy(&self) -> bool {
        self.manifest_busy
    }

    pub fn family(&self, cf: ColumnFamilyId) -> Option<&FamilyVersions> {
        self.families.get(&cf)
    }

    pub fn family_by_name(&self, name: &str) -> Option<&FamilyVersions> {
        self.families.values().find(|f| f.name == name)
    }

    pub fn families(&self) -> impl Iterator<Item = &FamilyVersions> {
        self.families.values()
    }

    pub fn current(&self, cf: ColumnFamilyId) -> Option<Arc<Version>> {
        self.families.get(&cf).map(|f| Arc::clone(&f.current))
    }

    /// Smallest WAL number any family may still need
    pub fn min_log_number(&self) -> u64 {
        self.families
            .values()
            .map(|f| f.log_number)
            .min()
            .unwrap_or(0)
    }

    /// Prepare a file-change edit for `cf`
    pub fn prepare_apply(&mut self, cf: ColumnFamilyId, mut edit: VersionEdit) -> Result<ManifestWrite> {
        edit.column_family = cf;
        edit.validate()?;
        if edit.is_column_family_manipulation() {
            return Err(TierError::InvalidArgument(
                "use the column family operations for add/drop edits".into(),
            ));
        }
        let family = self
            .families
            .get(&cf)
            .ok_or_else(|| TierError::ColumnFamilyNotFound(cf.to_string()))?;
        if let Some(n) = edit.log_number {
            if n < family.log_number {
                return Err(TierError::Internal(format!(
                    "log number {} moves backwards from {}",
                    n, family.log_number
                )));
            }
        } else {
            edit.set_log_number(family.log_number);
        }

        let base = Arc::clone(&family.current);
        let mut builder = VersionBuilder::new(base);
        builder.apply(&edit)?;
        let version_number = self.bump_version_number();
        let (version, removed) = builder.save(version_number)?;

        self.start_write(cf, edit, ApplyKind::Files { version, removed })
    }

    /// Prepare creation of a column family; the new id is [`ManifestWrite::cf_id`]
    pub fn prepare_create_column_family(
        &mut self,
        name: &str,
        options: ColumnFamilyOptions,
        log_number: u64,
    ) -> Result<ManifestWrite> {
        options.validate()?;
        if self.family_by_name(name).is_some() {
            return Err(TierError::InvalidArgument(format!(
                "column family {} already exists",
                name
            )));
        }
        let id = self.max_column_family + 1;
        let mut edit = VersionEdit::new();
        edit.add_column_family(id, name);
        edit.set_max_column_family(id);
        edit.set_log_number(log_number);
        self.start_write(
            id,
            edit,
            ApplyKind::AddFamily {
                name: name.to_string(),
                options,
            },
        )
    }

    /// Prepare dropping column family `cf`
    pub fn prepare_drop_column_family(&mut self, cf: ColumnFamilyId) -> Result<ManifestWrite> {
        if cf == DEFAULT_COLUMN_FAMILY_ID {
            return Err(TierError::InvalidArgument(
                "the default column family cannot be dropped".into(),
            ));
        }
        if !self.families.contains_key(&cf) {
            return Err(TierError::ColumnFamilyNotFound(cf.to_string()));
        }
        let mut edit = VersionEdit::new();
        edit.drop_column_family(cf);
        self.start_write(cf, edit, ApplyKind::DropFamily)
    }

    fn start_write(&mut self, cf: ColumnFamilyId, mut edit: VersionEdit, kind: ApplyKind) -> Result<ManifestWrite> {
        if self.manifest_busy {
            return Err(TierError::Busy("manifest write in progress".into()));
        }

        let rollover = match &self.manifest {
            None => true,
            Some(writer) => writer.file_size() >= self.max_manifest_file_size,
        };
        let new_manifest = if rollover {
            let number = self.new_file_number();
            Some((number, self.snapshot_records()))
        } else {
            None
        };

        edit.set_prev_log_number(self.prev_log_number);
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence());

        self.manifest_busy = true;
        Ok(ManifestWrite {
            db_dir: self.db_dir.clone(),
            cf_id: cf,
            edit,
            kind,
            writer: if rollover { None } else { self.manifest.take() },
            new_manifest,
        })
    }

    /// Full description of the current state, the head of a new MANIFEST
    fn snapshot_records(&self) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        let mut header = VersionEdit::new();
        header.set_comparator(COMPARATOR_NAME);
        header.set_max_column_family(self.max_column_family);
        records.push(header.encode());

        for family in self.families.values() {
            if family.id != DEFAULT_COLUMN_FAMILY_ID {
                let mut add = VersionEdit::new();
                add.add_column_family(family.id, family.name.clone());
                add.set_log_number(family.log_number);
                records.push(add.encode());
            }
            let mut files = VersionEdit::for_column_family(family.id);
            files.set_log_number(family.log_number);
            for level in 0..family.current.num_levels() {
                for file in family.current.files(level) {
                    files.add_file(level, FileMetaData::clone(file));
                }
            }
            records.push(files.encode());
        }
        records
    }

    /// Install the prepared change if `result` is Ok, otherwise discard it
    pub fn finish_apply(&mut self, write: ManifestWrite, result: Result<()>) -> Result<()> {
        self.manifest_busy = false;
        let ManifestWrite {
            cf_id,
            edit,
            kind,
            writer,
            new_manifest,
            ..
        } = write;

        if let Err(e) = result {
            // The next write starts a fresh manifest rather than appending after a partial record.
            self.manifest = None;
            warn!("Manifest write for column family {} failed: {}", cf_id, e);
            return Err(e);
        }

        self.manifest = writer;
        if let Some((number, _)) = new_manifest {
            self.manifest_file_number = number;
        }
        if let Some(n) = edit.prev_log_number {
            self.prev_log_number = n;
        }

        match kind {
            ApplyKind::Files { version, removed } => {
                let family = self
                    .families
                    .get_mut(&cf_id)
                    .ok_or_else(|| TierError::ColumnFamilyNotFound(cf_id.to_string()))?;
                if let Some(n) = edit.log_number {
                    family.log_number = n;
                }
                debug!(
                    "Installed version {} for column family {}: {}",
                    version.version_number(),
                    family.name,
                    version.level_summary()
                );
                family.install(version);
                self.obsolete_files.extend(removed);
            }
            ApplyKind::AddFamily { name, options } => {
                let version = Version::new(cf_id, options.num_levels);
                let mut family = FamilyVersions::new(cf_id, name, options, version);
                family.log_number = edit.log_number.unwrap_or(0);
                self.max_column_family = self.max_column_family.max(cf_id);
                info!("Created column family {} ({})", family.name, cf_id);
                self.families.insert(cf_id, family);
            }
            ApplyKind::DropFamily => {
                if let Some(family) = self.families.remove(&cf_id) {
                    for level in 0..family.current.num_levels() {
                        self.obsolete_files
                            .extend(family.current.files(level).iter().cloned());
                    }
                    info!("Dropped column family {} ({})", family.name, cf_id);
                }
            }
        }
        Ok(())
    }

    /// Prepare, write and install in one step, holding `self` throughout
    pub fn log_and_apply(&mut self, cf: ColumnFamilyId, edit: VersionEdit) -> Result<()> {
        let mut write = self.prepare_apply(cf, edit)?;
        let result = write.write();
        self.finish_apply(write, result)
    }

    /// Add every table number a live version or reader still needs
    pub fn add_live_files(&mut self, live: &mut HashSet<u64>) {
        for family in self.families.values_mut() {
            family.live.retain(|v| v.strong_count() > 0);
            for version in family.live.iter().filter_map(|v| v.upgrade()) {
                version.add_live_files(live);
            }
        }
        live.extend(
            self.obsolete_files
                .iter()
                .filter(|f| Arc::strong_count(f) > 1)
                .map(|f| f.number()),
        );
    }

    /// Take the obsolete files nothing references any more
    pub fn take_unreferenced_obsolete_files(&mut self) -> Vec<Arc<FileMetaData>> {
        let (free, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.obsolete_files)
            .into_iter()
            .partition(|f| Arc::strong_count(f) == 1);
        self.obsolete_files = held;
        free
    }

    /// Default options for families recovered without explicit options
    pub fn default_cf_options(&self) -> &ColumnFamilyOptions {
        &self.default_cf_options
    }
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("db_dir", &self.db_dir)
            .field("families", &self.families.len())
            .field("next_file_number", &self.next_file_number)
            .field("last_sequence", &self.last_sequence())
            .field("manifest_file_number", &self.manifest_file_number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InternalKey, ValueType};
    use crate::version::FileDescriptor;
    use tempfile::TempDir;

    fn meta(number: u64, lo: &str, hi: &str) -> FileMetaData {
        FileMetaData::new(
            FileDescriptor::new(number, 0, 1000),
            InternalKey::new(lo.as_bytes().to_vec(), 1, ValueType::Value),
            InternalKey::new(hi.as_bytes().to_vec(), 2, ValueType::Value),
            1,
            2,
        )
    }

    fn open(dir: &Path, options: &Options) -> VersionSet {
        VersionSet::recover(dir, options, &HashMap::new()).unwrap()
    }

    #[test]
    fn test_create_apply_recover() {
        let temp_dir = TempDir::new().unwrap();
        let options = Options::default();
        VersionSet::create_new(temp_dir.path()).unwrap();

        let mut set = open(temp_dir.path(), &options);
        assert_eq!(set.last_sequence(), 0);
        let n1 = set.new_file_number();
        let n2 = set.new_file_number();

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(n1, "a", "k"));
        edit.add_file(1, meta(n2, "m", "z"));
        edit.set_log_number(7);
        set.set_last_sequence(42);
        set.log_and_apply(DEFAULT_COLUMN_FAMILY_ID, edit).unwrap();
        assert!(set.manifest_file_number() > 1);

        let mut edit = VersionEdit::new();
        edit.delete_file(0, n1);
        set.log_and_apply(DEFAULT_COLUMN_FAMILY_ID, edit).unwrap();
        assert_eq!(set.take_unreferenced_obsolete_files().len(), 1);
        let next = set.next_file_number();
        drop(set);

        let set = open(temp_dir.path(), &options);
        let current = set.current(DEFAULT_COLUMN_FAMILY_ID).unwrap();
        assert_eq!(current.num_level_files(0), 0);
        assert_eq!(current.files(1)[0].number(), n2);
        assert_eq!(set.last_sequence(), 42);
        assert_eq!(set.min_log_number(), 7);
        assert!(set.next_file_number() >= next);
    }

    #[test]
    fn test_failed_consistency_leaves_version_untouched() {
        let temp_dir = TempDir::new().unwrap();
        VersionSet::create_new(temp_dir.path()).unwrap();
        let mut set = open(temp_dir.path(), &Options::default());

        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(10, "a", "f"));
        set.log_and_apply(DEFAULT_COLUMN_FAMILY_ID, edit).unwrap();

        let mut bad = VersionEdit::new();
        bad.add_file(1, meta(11, "c", "h"));
        assert!(set.log_and_apply(DEFAULT_COLUMN_FAMILY_ID, bad).is_err());
        assert!(!set.manifest_busy());
        let current = set.current(DEFAULT_COLUMN_FAMILY_ID).unwrap();
        assert_eq!(current.num_files(), 1);
    }

    #[test]
    fn test_column_families_persist() {
        let temp_dir = TempDir::new().unwrap();
        let options = Options::default();
        VersionSet::create_new(temp_dir.path()).unwrap();
        let mut set = open(temp_dir.path(), &options);

        let mut write = set
            .prepare_create_column_family("users", ColumnFamilyOptions::default(), 3)
            .unwrap();
        let users = write.cf_id();
        let result = write.write();
        set.finish_apply(write, result).unwrap();

        let mut write = set
            .prepare_create_column_family("logs", ColumnFamilyOptions::default(), 3)
            .unwrap();
        let logs = write.cf_id();
        let result = write.write();
        set.finish_apply(write, result).unwrap();
        assert!(set
            .prepare_create_column_family("users", ColumnFamilyOptions::default(), 3)
            .is_err());

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(50, "a", "b"));
        set.log_and_apply(users, edit).unwrap();

        let mut write = set.prepare_drop_column_family(logs).unwrap();
        let result = write.write();
        set.finish_apply(write, result).unwrap();
        assert!(set.prepare_drop_column_family(DEFAULT_COLUMN_FAMILY_ID).is_err());
        drop(set);

        let set = open(temp_dir.path(), &options);
        assert!(set.family_by_name("logs").is_none());
        let family = set.family_by_name("users").unwrap();
        assert_eq!(family.id, users);
        assert_eq!(family.log_number, 3);
        assert_eq!(family.current().num_level_files(0), 1);
        assert_eq!(set.max_column_family(), logs);
    }

    #[test]
    fn test_manifest_rollover() {
        let temp_dir = TempDir::new().unwrap();
        let options = Options {
            max_manifest_file_size: 1,
            ..Default::default()
        };
        VersionSet::create_new(temp_dir.path()).unwrap();
        let mut set = open(temp_dir.path(), &options);

        let mut manifests = HashSet::new();
        for i in 0..3u64 {
            let mut edit = VersionEdit::new();
            edit.add_file(1, meta(100 + i, &format!("k{}", i), &format!("k{}z", i)));
            set.log_and_apply(DEFAULT_COLUMN_FAMILY_ID, edit).unwrap();
            manifests.insert(set.manifest_file_number());
        }
        assert_eq!(manifests.len(), 3);
        drop(set);

        let set = open(temp_dir.path(), &options);
        assert_eq!(set.current(DEFAULT_COLUMN_FAMILY_ID).unwrap().num_level_files(1), 3);
    }

    #[test]
    fn test_live_files_follow_version_references() {
        let temp_dir = TempDir::new().unwrap();
        VersionSet::create_new(temp_dir.path()).unwrap();
        let mut set = open(temp_dir.path(), &Options::default());

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(20, "a", "b"));
        set.log_and_apply(DEFAULT_COLUMN_FAMILY_ID, edit).unwrap();
        let pinned = set.current(DEFAULT_COLUMN_FAMILY_ID).unwrap();

        let mut edit = VersionEdit::new();
        edit.delete_file(0, 20);
        set.log_and_apply(DEFAULT_COLUMN_FAMILY_ID, edit).unwrap();

        // an old version still lists the file
        assert!(set.take_unreferenced_obsolete_files().is_empty());
        let mut live = HashSet::new();
        set.add_live_files(&mut live);
        assert!(live.contains(&20));
        assert_eq!(set.family(DEFAULT_COLUMN_FAMILY_ID).unwrap().num_live_versions(), 2);

        drop(pinned);
        let mut live = HashSet::new();
        set.add_live_files(&mut live);
        assert!(!live.contains(&20));
        let freed = set.take_unreferenced_obsolete_files();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].number(), 20);
    }
}
