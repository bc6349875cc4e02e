//! Orphan capture and restore.
//!
//! An orphan has no name, so a walk from the root never reaches it. The
//! open-handle registry is the second root set: every object it references
//! with a link count of zero is captured here.

use std::collections::HashSet;
use std::sync::Arc;

use nsvfs_config::{log_snapshot_debug, log_snapshot_trace};
use nsvfs_core::{
    Attributes, Frozen, Inode, Metadata, ObjectContent, ObjectId, ObjectKind, RestoreBuilder,
    VfsError,
};
use serde::{Deserialize, Serialize};

/// A captured orphaned object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRecord {
    pub id: ObjectId,
    pub metadata: Metadata,
    pub content: ObjectContent,
}

/// Every object reachable only through an open handle, in handle order.
pub fn enumerate_orphaned(frozen: &Frozen<'_>) -> Vec<OrphanRecord> {
    let vfs = frozen.vfs();
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for handle in vfs.handles().snapshot() {
        let id = handle.object_id();
        if !seen.insert(id) {
            continue;
        }
        match vfs.objects().counts(id) {
            Some(counts) if counts.is_orphaned() => {}
            _ => continue,
        }
        let inode = handle.inode();
        log_snapshot_trace!("Orphan found", id = %id, handle = %handle.id());
        records.push(OrphanRecord {
            id,
            metadata: vfs.metadata(inode),
            content: ObjectContent::of(inode),
        });
    }
    records
}

/// Re-create an orphan at its original id. It has no entry in any
/// directory; handles bound to it afterwards keep it alive.
pub fn restore_orphaned(
    builder: &RestoreBuilder,
    record: OrphanRecord,
) -> nsvfs_core::Result<Arc<Inode>> {
    let kind_matches = matches!(
        (record.metadata.kind, &record.content),
        (ObjectKind::Regular, ObjectContent::Regular(_))
            | (ObjectKind::Directory, ObjectContent::Directory { .. })
    );
    if !kind_matches {
        return Err(VfsError::InvalidArgument);
    }
    if let ObjectContent::Directory { entries, .. } = &record.content {
        if !entries.is_empty() {
            return Err(VfsError::InvalidArgument);
        }
    }

    let attributes = Attributes::from(&record.metadata);
    let inode = builder.install(record.id, attributes, record.content)?;
    log_snapshot_debug!("Orphan restored", id = %record.id, size = record.metadata.size);
    Ok(inode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsvfs_core::{AccessMode, Base, Credentials, HandleId, OpenOptions, Vfs, VfsOptions};

    #[test]
    fn test_enumerate_finds_only_orphans() {
        let vfs = Vfs::new(VfsOptions::default());
        let cred = Credentials::root();
        let rw = OpenOptions::new().read(true).write(true).create(true);
        let kept = vfs.open(&cred, Base::Root, "kept", &rw).unwrap();
        let gone = vfs.open(&cred, Base::Root, "gone", &rw).unwrap();
        let gone_again = vfs.open(&cred, Base::Root, "gone", &rw).unwrap();
        vfs.write(gone, b"data").unwrap();
        vfs.unlink(&cred, Base::Root, "gone").unwrap();

        let frozen = vfs.freeze();
        let orphans = enumerate_orphaned(&frozen);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, vfs.stat(gone_again).unwrap().id);
        assert_eq!(orphans[0].content, ObjectContent::Regular(b"data".to_vec()));
        assert_eq!(orphans[0].metadata.nlink, 0);
        assert_ne!(orphans[0].id, vfs.stat(kept).unwrap().id);
    }

    #[test]
    fn test_restore_orphan_rejects_inconsistent_record() {
        let builder = RestoreBuilder::new(VfsOptions::default());
        let vfs = Vfs::new(VfsOptions::default());
        let mut metadata = vfs.metadata(vfs.root());
        metadata.kind = ObjectKind::Regular;
        let record = OrphanRecord {
            id: ObjectId::new(4, 0),
            metadata,
            content: ObjectContent::Directory {
                parent: ObjectId::new(0, 0),
                entries: Vec::new(),
            },
        };
        assert_eq!(
            restore_orphaned(&builder, record).unwrap_err(),
            VfsError::InvalidArgument
        );
    }

    #[test]
    fn test_restored_orphan_is_bound_to_handle() {
        let builder = RestoreBuilder::new(VfsOptions::default());
        let root = ObjectId::new(0, 0);
        builder
            .install(
                root,
                Attributes::new(0o755, 0, 0),
                ObjectContent::Directory {
                    parent: root,
                    entries: Vec::new(),
                },
            )
            .unwrap();

        let source = Vfs::new(VfsOptions::default());
        let mut metadata = source.metadata(source.root());
        metadata.kind = ObjectKind::Regular;
        metadata.mode = 0o600;
        let record = OrphanRecord {
            id: ObjectId::new(2, 7),
            metadata,
            content: ObjectContent::Regular(b"hello".to_vec()),
        };
        restore_orphaned(&builder, record).unwrap();
        builder
            .bind_handle(HandleId::new(3), ObjectId::new(2, 7), AccessMode::ReadOnly, 0)
            .unwrap();

        let vfs = builder.finish(root).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(vfs.pread(HandleId::new(3), &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        let meta = vfs.stat(HandleId::new(3)).unwrap();
        assert_eq!(meta.mode, 0o600);
        assert_eq!(meta.nlink, 0);
    }
}
