//! Versions of the on-disk file set
//!
//! - [`FileMetaData`] describes one immutable table
//! - [`VersionEdit`] is a diff between two versions, persisted in the MANIFEST
//! - [`Version`] is one immutable per-level listing
//! - [`VersionSet`] owns the current version of every column family and the
//!   counters (file numbers, sequence, log numbers) recovered with them

mod builder;
mod edit;
mod file_meta;
#[allow(clippy::module_inception)]
mod version;
mod set;

pub use builder::VersionBuilder;
pub use edit::VersionEdit;
pub use file_meta::{
    pack_file_number_and_path_id, packed_file_number, packed_path_id, FileDescriptor,
    FileMetaData, MAX_FILE_NUMBER, MAX_PATH_ID,
};
pub use set::{FamilyVersions, ManifestWrite, VersionSet};
pub use version::Version;
