//! Column families and their superversions
//!
//! Readers never take the engine lock: they load the family's current
//! [`SuperVersion`] through an `ArcSwap` and read from the memtables and
//! version it pins. Whoever drops the last reference to an old superversion
//! frees the memtables and version it was holding.

use crate::memtable::{MemTable, MemTableList};
use crate::options::ColumnFamilyOptions;
use crate::types::ColumnFamilyId;
use crate::version::Version;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Everything a read needs, captured at one instant
#[derive(Debug)]
pub(crate) struct SuperVersion {
    pub mem: Arc<MemTable>,
    /// Immutable memtables, newest first
    pub imm: Vec<Arc<MemTable>>,
    pub current: Arc<Version>,
    pub options: Arc<ColumnFamilyOptions>,
    pub number: u64,
}

/// State shared between the engine and every handle to one family
pub(crate) struct FamilyShared {
    id: ColumnFamilyId,
    name: String,
    options: Arc<ColumnFamilyOptions>,
    super_version: ArcSwap<SuperVersion>,
    dropped: AtomicBool,
}

/// Handle to an open column family.
///
/// Cheap to clone. Reads through a handle whose family was dropped still see
/// the data it held when it was dropped; writes fail.
#[derive(Clone)]
pub struct ColumnFamilyHandle {
    shared: Arc<FamilyShared>,
}

impl ColumnFamilyHandle {
    pub fn id(&self) -> ColumnFamilyId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &ColumnFamilyOptions {
        &self.shared.options
    }

    /// True once the family has been dropped
    pub fn is_dropped(&self) -> bool {
        self.shared.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn super_version(&self) -> Arc<SuperVersion> {
        self.shared.super_version.load_full()
    }
}

impl std::fmt::Debug for ColumnFamilyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamilyHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

/// Engine-side runtime state of one family, guarded by the engine lock
pub(crate) struct ColumnFamilyData {
    shared: Arc<FamilyShared>,
    pub mem: Arc<MemTable>,
    pub imm: MemTableList,
    super_version_number: AtomicU64,
}

impl ColumnFamilyData {
    pub fn new(
        id: ColumnFamilyId,
        name: String,
        options: ColumnFamilyOptions,
        mem: Arc<MemTable>,
        current: Arc<Version>,
    ) -> Self {
        let options = Arc::new(options);
        let first = SuperVersion {
            mem: Arc::clone(&mem),
            imm: Vec::new(),
            current,
            options: Arc::clone(&options),
            number: 1,
        };
        let shared = Arc::new(FamilyShared {
            id,
            name,
            options,
            super_version: ArcSwap::from_pointee(first),
            dropped: AtomicBool::new(false),
        });
        Self {
            shared,
            mem,
            imm: MemTableList::new(),
            super_version_number: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> ColumnFamilyId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &Arc<ColumnFamilyOptions> {
        &self.shared.options
    }

    pub fn handle(&self) -> ColumnFamilyHandle {
        ColumnFamilyHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn super_version(&self) -> Arc<SuperVersion> {
        self.shared.super_version.load_full()
    }

    /// Publish the current memtables together with `current`
    pub fn install_super_version(&self, current: Arc<Version>) {
        let number = self.super_version_number.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.super_version.store(Arc::new(SuperVersion {
            mem: Arc::clone(&self.mem),
            imm: self.imm.memtables().to_vec(),
            current,
            options: Arc::clone(&self.shared.options),
            number,
        }));
    }

    pub fn mark_dropped(&self) {
        self.shared.dropped.store(true, Ordering::Release);
    }

    /// Does any memtable still hold unflushed data?
    pub fn has_unflushed_data(&self) -> bool {
        !self.mem.is_empty() || !self.imm.is_empty()
    }
}
