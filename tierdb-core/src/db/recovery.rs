//! Opening a database directory: lock, manifest recovery and WAL replay

use super::column_family::ColumnFamilyData;
use super::flush::write_level0_table;
use super::state::EngineState;
use super::WriteBatch;
use crate::filename::{
    current_file_name, identity_file_name, lock_file_name, log_file_name, parse_file_name,
    FileType,
};
use crate::log::{LogReader, LogWriter};
use crate::memtable::MemTable;
use crate::options::{ColumnFamilyDescriptor, ColumnFamilyOptions, Options};
use crate::table::TableCache;
use crate::types::{ColumnFamilyId, SequenceNumber};
use crate::version::{VersionEdit, VersionSet};
use crate::{Result, TierError};
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything `open` needs to start serving
pub(crate) struct Recovered {
    pub lock: File,
    pub state: EngineState,
    pub log: LogWriter,
}

/// Take the directory lock, recover the manifest and replay the WALs.
///
/// Replayed data is written straight to level-0 tables and committed before
/// the fresh WAL is created, so a crash during open loses nothing and never
/// replays the same log twice.
pub(crate) fn recover(
    db_dir: &Path,
    options: &Options,
    descriptors: &[ColumnFamilyDescriptor],
    table_cache: &TableCache,
) -> Result<Recovered> {
    let start = Instant::now();
    options.validate()?;
    for descriptor in descriptors {
        descriptor.options.validate()?;
    }

    if options.create_if_missing {
        fs::create_dir_all(db_dir)?;
    } else if !db_dir.is_dir() {
        return Err(TierError::InvalidArgument(format!(
            "{:?} does not exist (create_if_missing is false)",
            db_dir
        )));
    }
    for path in &options.db_paths {
        fs::create_dir_all(path)?;
    }

    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_file_name(db_dir))?;
    lock.try_lock_exclusive()
        .map_err(|e| TierError::Busy(format!("{:?} is locked by another process: {}", db_dir, e)))?;

    if !current_file_name(db_dir).exists() {
        if !options.create_if_missing {
            return Err(TierError::InvalidArgument(format!(
                "{:?} has no database (create_if_missing is false)",
                db_dir
            )));
        }
        info!("Creating new database in {:?}", db_dir);
        VersionSet::create_new(db_dir)?;
    } else if options.error_if_exists {
        return Err(TierError::InvalidArgument(format!(
            "{:?} already holds a database (error_if_exists is true)",
            db_dir
        )));
    }
    ensure_identity(db_dir)?;

    let cf_options: HashMap<String, ColumnFamilyOptions> = descriptors
        .iter()
        .map(|d| (d.name.clone(), d.options.clone()))
        .collect();
    let mut versions = VersionSet::recover(db_dir, options, &cf_options)?;
    for descriptor in descriptors {
        if versions.family_by_name(&descriptor.name).is_none() {
            return Err(TierError::ColumnFamilyNotFound(descriptor.name.clone()));
        }
    }

    let logs = logs_to_replay(db_dir, &versions)?;
    for &number in &logs {
        versions.mark_file_number_used(number);
    }

    let mut state = EngineState::new(versions, 0);
    let families: Vec<_> = state
        .versions
        .families()
        .map(|f| (f.id, f.name.clone(), f.options.clone(), Arc::clone(f.current())))
        .collect();
    for (id, name, cf_options, current) in families {
        let mem = Arc::new(MemTable::new(state.new_memtable_id()));
        state
            .families
            .insert(id, ColumnFamilyData::new(id, name, cf_options, mem, current));
    }

    let mut edits: BTreeMap<ColumnFamilyId, VersionEdit> = BTreeMap::new();
    let mut max_sequence = state.versions.last_sequence();
    for &number in &logs {
        let last = replay_log(db_dir, number, options.paranoid_checks, table_cache, &mut state, &mut edits)?;
        max_sequence = max_sequence.max(last);
    }
    // whatever is still buffered goes to level 0 as well
    let ids: Vec<ColumnFamilyId> = state.families.keys().copied().collect();
    for cf in ids {
        flush_replayed(table_cache, &mut state, &mut edits, cf)?;
    }

    let log_number = state.versions.new_file_number();
    state.versions.set_last_sequence(max_sequence);
    let ids: Vec<ColumnFamilyId> = state.families.keys().copied().collect();
    for cf in ids {
        let mut edit = edits.remove(&cf).unwrap_or_default();
        edit.set_log_number(log_number);
        state.versions.log_and_apply(cf, edit)?;
        state.install_super_version(cf);
    }

    let log = LogWriter::create(log_file_name(db_dir, log_number), log_number)?;
    state.log_number = log_number;
    info!(
        "Opened {:?}: {} column families, {} logs replayed, last sequence {}, new log {} in {:?}",
        db_dir,
        state.families.len(),
        logs.len(),
        max_sequence,
        log_number,
        start.elapsed()
    );
    Ok(Recovered { lock, state, log })
}

fn ensure_identity(db_dir: &Path) -> Result<()> {
    let path = identity_file_name(db_dir);
    if !path.exists() {
        let id = Uuid::new_v4();
        fs::write(&path, format!("{}\n", id))?;
        debug!("Wrote identity {}", id);
    }
    Ok(())
}

/// WALs that may hold data not yet in any table, oldest first
fn logs_to_replay(db_dir: &Path, versions: &VersionSet) -> Result<Vec<u64>> {
    let min_log = versions.min_log_number();
    let prev_log = versions.prev_log_number();
    let mut logs = Vec::new();
    for entry in fs::read_dir(db_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some((number, FileType::Log)) = name.to_str().and_then(parse_file_name) {
            if number >= min_log || (prev_log != 0 && number == prev_log) {
                logs.push(number);
            }
        }
    }
    logs.sort_unstable();
    Ok(logs)
}

/// Insert every record of one WAL into the family memtables.
///
/// Records a family has already flushed (its log number is past this log)
/// are skipped. Returns the largest sequence number seen.
fn replay_log(
    db_dir: &Path,
    number: u64,
    paranoid: bool,
    table_cache: &TableCache,
    state: &mut EngineState,
    edits: &mut BTreeMap<ColumnFamilyId, VersionEdit>,
) -> Result<SequenceNumber> {
    let path = log_file_name(db_dir, number);
    let mut reader = LogReader::open(&path, paranoid)?;
    let mut max_sequence = 0;
    let mut skipped = 0usize;

    loop {
        let record = match reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) if paranoid => return Err(e),
            Err(e) => {
                warn!("Stopping replay of {:?}: {}", path, e);
                break;
            }
        };
        let (first, batch) = match WriteBatch::decode_record(&record) {
            Ok(decoded) => decoded,
            Err(e) if paranoid => return Err(e),
            Err(e) => {
                warn!("Skipping undecodable record in {:?}: {}", path, e);
                continue;
            }
        };

        let mut touched = Vec::new();
        for (i, rec) in batch.records().enumerate() {
            let sequence = first + i as u64;
            max_sequence = max_sequence.max(sequence);
            let flushed_past = state
                .versions
                .family(rec.cf)
                .map_or(true, |f| f.log_number > number);
            let Some(cfd) = state.families.get(&rec.cf) else {
                skipped += 1;
                continue;
            };
            if flushed_past {
                skipped += 1;
                continue;
            }
            cfd.mem.add(sequence, rec.value_type, &rec.key, &rec.value);
            if !touched.contains(&rec.cf) {
                touched.push(rec.cf);
            }
        }

        for cf in touched {
            let full = state
                .families
                .get(&cf)
                .map_or(false, |cfd| cfd.mem.should_flush(cfd.options().write_buffer_size));
            if full {
                flush_replayed(table_cache, state, edits, cf)?;
            }
        }
    }

    info!(
        "Replayed {} records from log {} ({} entries skipped)",
        reader.records_read(),
        number,
        skipped
    );
    Ok(max_sequence)
}

/// Write `cf`'s replay memtable to a level-0 table and start a fresh one
fn flush_replayed(
    table_cache: &TableCache,
    state: &mut EngineState,
    edits: &mut BTreeMap<ColumnFamilyId, VersionEdit>,
    cf: ColumnFamilyId,
) -> Result<()> {
    let (mem, cf_options) = {
        let cfd = state.family(cf)?;
        if cfd.mem.is_empty() {
            return Ok(());
        }
        (Arc::clone(&cfd.mem), Arc::clone(cfd.options()))
    };
    let number = state.versions.new_file_number();
    if let Some(meta) = write_level0_table(table_cache, &cf_options, &[mem], number, Vec::new())? {
        edits.entry(cf).or_default().add_file(0, meta);
    }
    let fresh = Arc::new(MemTable::new(state.new_memtable_id()));
    if let Some(cfd) = state.families.get_mut(&cf) {
        cfd.mem = fresh;
    }
    Ok(())
}
