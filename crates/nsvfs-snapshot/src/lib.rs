//! # nsvfs-snapshot
//!
//! Checkpoint/restore for nsvfs filesystems.
//!
//! Named objects are captured by walking the namespace from the root.
//! Unlinked objects that are still open are captured by walking the
//! open-handle registry, and come back as orphans bound to the same
//! handle ids, with no path anywhere in the restored namespace.
//!
//! Capture requires a [`nsvfs_core::Frozen`] guard so no removal, open or
//! close runs while the two root sets are walked.

pub mod adapter;
pub mod image;

pub use adapter::{enumerate_orphaned, restore_orphaned, OrphanRecord};
pub use image::{HandleRecord, ImageSummary, ObjectRecord, SnapshotOptions, VfsImage};

use std::io;

use thiserror::Error;

use nsvfs_core::VfsError;

/// Errors that can occur while capturing, saving, loading or restoring
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Filesystem error: {0}")]
    Vfs(#[from] VfsError),

    #[error("Invalid image: {0}")]
    Invalid(String),

    #[error("Image checksum mismatch")]
    ChecksumMismatch,

    #[error("{count} open unlinked object(s) cannot be saved with save_orphans disabled")]
    OrphansUnsupported { count: usize },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
