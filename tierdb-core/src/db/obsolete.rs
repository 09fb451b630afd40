//! Deleting files no version, reader or running job needs
//!
//! Candidates are gathered under the engine lock; directory listing and
//! unlinking happen afterwards without it. Every candidate is checked again
//! against the live set taken just before deleting, so two purges racing
//! over the same files are harmless.

use super::state::EngineState;
use super::DbInner;
use crate::filename::{log_file_name, parse_file_name, FileType};
use crate::version::FileDescriptor;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What one purge may delete, and the counters that decide it
#[derive(Debug, Default)]
pub(crate) struct ObsoleteCandidates {
    /// Tables dropped from every version with no reader left
    tables: Vec<FileDescriptor>,
    /// Directories to list when this is a full scan
    scan_dirs: Vec<PathBuf>,
    min_log_number: u64,
    prev_log_number: u64,
    manifest_number: u64,
    /// Files numbered from here on were allocated after the candidates were taken
    next_file_number: u64,
}

impl ObsoleteCandidates {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.scan_dirs.is_empty()
    }

    /// Should a file with this name and number be kept?
    fn keep(&self, file_type: FileType, number: u64, live: &HashSet<u64>) -> bool {
        match file_type {
            FileType::Log => number >= self.min_log_number || number == self.prev_log_number,
            FileType::Descriptor => number >= self.manifest_number,
            FileType::Table => live.contains(&number) || number >= self.next_file_number,
            // a CURRENT rewrite in flight uses the new manifest's number
            FileType::Temp => {
                number >= self.manifest_number
                    || live.contains(&number)
                    || number >= self.next_file_number
            }
            FileType::Current | FileType::Lock | FileType::Identity => true,
        }
    }
}

impl DbInner {
    /// Collect deletion candidates.
    ///
    /// Without `force` a full directory scan happens at most once per
    /// `delete_obsolete_files_period`; `no_full_scan` rules it out entirely.
    pub(crate) fn find_obsolete_files(
        &self,
        state: &mut EngineState,
        force: bool,
        no_full_scan: bool,
    ) -> ObsoleteCandidates {
        let full_scan = !no_full_scan
            && (force
                || state.last_full_scan.map_or(true, |at| {
                    at.elapsed() >= self.options.delete_obsolete_files_period
                }));

        let mut candidates = ObsoleteCandidates {
            tables: state
                .versions
                .take_unreferenced_obsolete_files()
                .iter()
                .map(|f| f.fd.clone())
                .collect(),
            min_log_number: state.min_log_number_to_keep(),
            prev_log_number: state.versions.prev_log_number(),
            manifest_number: state.versions.manifest_file_number(),
            next_file_number: state.versions.next_file_number(),
            ..Default::default()
        };
        if full_scan {
            state.last_full_scan = Some(Instant::now());
            candidates.scan_dirs.push(self.db_dir.clone());
            for path in &self.options.db_paths {
                if !candidates.scan_dirs.contains(path) {
                    candidates.scan_dirs.push(path.clone());
                }
            }
        }
        candidates
    }

    /// Delete every candidate that is still not live
    pub(crate) fn purge_obsolete_files(&self, candidates: ObsoleteCandidates) {
        if candidates.is_empty() {
            return;
        }
        let live = {
            let mut state = self.state.lock();
            let mut live = state.pending_outputs.clone();
            state.versions.add_live_files(&mut live);
            live
        };

        let mut files: BTreeMap<PathBuf, (FileType, u64)> = candidates
            .tables
            .iter()
            .map(|fd| (self.table_cache.table_path(fd), (FileType::Table, fd.number())))
            .collect();
        for dir in &candidates.scan_dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to list {:?} for obsolete files: {}", dir, e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some((number, file_type)) = name.to_str().and_then(parse_file_name) {
                    files.insert(entry.path(), (file_type, number));
                }
            }
        }

        let mut deleted = 0usize;
        for (path, (file_type, number)) in files {
            if candidates.keep(file_type, number, &live) {
                continue;
            }
            // logs only ever live in the database directory
            if file_type == FileType::Log && path != log_file_name(&self.db_dir, number) {
                continue;
            }
            if file_type == FileType::Table {
                self.table_cache.evict(number);
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    info!("Deleted obsolete {:?} file {:?}", file_type, path);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete {:?}: {}", path, e),
            }
        }
        debug!(deleted, "Obsolete file purge finished");
    }
}
