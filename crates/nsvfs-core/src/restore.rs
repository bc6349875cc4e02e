//! Rebuilding a filesystem from captured state.
//!
//! Objects are installed at their original ids with zero counts; handles
//! add open references; `finish` derives link counts from directory
//! entries and drops anything that ended up unreferenced.

use std::collections::HashMap;
use std::sync::Arc;

use nsvfs_config::{log_lifecycle_debug, log_vfs_warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};
use crate::handle::{AccessMode, HandleId, HandleTable};
use crate::object::{Attributes, Directory, Inode, ObjectId};
use crate::table::{ObjectTable, RefCounts};
use crate::vfs::{Vfs, VfsOptions};

/// Kind-specific payload of a captured object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectContent {
    Regular(Vec<u8>),
    Directory {
        parent: ObjectId,
        entries: Vec<(String, ObjectId)>,
    },
}

impl ObjectContent {
    /// Capture the payload of a live object
    pub fn of(inode: &Inode) -> Self {
        match inode.as_dir() {
            Some(dir) => ObjectContent::Directory {
                parent: dir.parent(),
                entries: dir.entries(),
            },
            None => ObjectContent::Regular(inode.content().unwrap_or_default()),
        }
    }
}

pub struct RestoreBuilder {
    options: VfsOptions,
    objects: ObjectTable,
    handles: HandleTable,
}

impl RestoreBuilder {
    pub fn new(options: VfsOptions) -> Self {
        Self {
            options,
            objects: ObjectTable::new(),
            handles: HandleTable::new(),
        }
    }

    /// Install an object at exactly `id`
    pub fn install(
        &self,
        id: ObjectId,
        attributes: Attributes,
        content: ObjectContent,
    ) -> Result<Arc<Inode>> {
        let inode = match content {
            ObjectContent::Regular(bytes) => Inode::new_file(id, attributes, bytes),
            ObjectContent::Directory { parent, entries } => {
                let entries: HashMap<String, ObjectId> = entries.into_iter().collect();
                Inode::new_directory(id, attributes, Directory::with_entries(parent, entries))
            }
        };
        self.objects.install(inode, RefCounts::default())
    }

    /// Re-create an open handle under its original id
    pub fn bind_handle(
        &self,
        handle: HandleId,
        object: ObjectId,
        access: AccessMode,
        offset: u64,
    ) -> Result<()> {
        if self.handles.contains(handle) {
            return Err(VfsError::AlreadyExists);
        }
        let inode = self.objects.acquire_open(object)?;
        self.handles.insert_with_id(handle, inode, access, offset);
        Ok(())
    }

    pub fn get(&self, id: ObjectId) -> Option<Arc<Inode>> {
        self.objects.get(id)
    }

    /// Derive link counts and hand back the finished filesystem
    pub fn finish(self, root: ObjectId) -> Result<Vfs> {
        let root_inode = self.objects.get(root).ok_or(VfsError::InvalidArgument)?;
        if !root_inode.is_dir() {
            return Err(VfsError::InvalidArgument);
        }

        let mut links: HashMap<ObjectId, u32> = HashMap::new();
        links.insert(root, 1);
        for (id, _) in self.objects.live_objects() {
            let Some(dir) = self.objects.get(id).and_then(|inode| inode.as_dir().map(Directory::entries)) else {
                continue;
            };
            for (name, target) in dir {
                if self.objects.get(target).is_none() {
                    log_vfs_warn!("Dangling entry in restored directory", dir = %id, name = %name);
                    return Err(VfsError::InvalidArgument);
                }
                *links.entry(target).or_default() += 1;
            }
        }
        for (id, count) in &links {
            self.objects.set_links(*id, *count);
        }

        let dropped = self.objects.reclaim_unreferenced();
        if dropped > 0 {
            log_lifecycle_debug!("Dropped unreferenced objects on restore", count = dropped);
        }
        // Orphaned directories may point at parents that no longer exist
        for (id, _) in self.objects.live_objects() {
            let parent = self
                .objects
                .get(id)
                .and_then(|inode| inode.as_dir().map(Directory::parent));
            if let Some(parent) = parent {
                if self.objects.get(parent).is_none() {
                    self.objects.retire(parent);
                }
            }
        }
        Ok(Vfs::from_parts(self.options, self.objects, self.handles, root_inode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perm::Credentials;
    use crate::resolve::Base;

    #[test]
    fn test_rebuild_namespace() {
        let builder = RestoreBuilder::new(VfsOptions::default());
        let root = ObjectId::new(0, 0);
        let dir = ObjectId::new(3, 1);
        let file = ObjectId::new(7, 0);
        builder
            .install(
                root,
                Attributes::new(0o755, 0, 0),
                ObjectContent::Directory {
                    parent: root,
                    entries: vec![("d".into(), dir)],
                },
            )
            .unwrap();
        builder
            .install(
                dir,
                Attributes::new(0o755, 0, 0),
                ObjectContent::Directory {
                    parent: root,
                    entries: vec![("f".into(), file)],
                },
            )
            .unwrap();
        builder
            .install(file, Attributes::new(0o644, 0, 0), ObjectContent::Regular(b"abc".to_vec()))
            .unwrap();

        let vfs = builder.finish(root).unwrap();
        let meta = vfs.lookup_stat(&Credentials::root(), Base::Root, "/d/f").unwrap();
        assert_eq!(meta.id, file);
        assert_eq!(meta.size, 3);
        assert_eq!(meta.nlink, 1);
        assert_eq!(vfs.objects().len(), 3);
    }

    #[test]
    fn test_unreferenced_objects_are_dropped() {
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
        let orphan = ObjectId::new(1, 0);
        let stray = ObjectId::new(2, 0);
        for id in [orphan, stray] {
            builder
                .install(id, Attributes::new(0o644, 0, 0), ObjectContent::Regular(Vec::new()))
                .unwrap();
        }
        builder
            .bind_handle(HandleId::new(5), orphan, AccessMode::ReadWrite, 0)
            .unwrap();
        assert_eq!(
            builder
                .bind_handle(HandleId::new(5), orphan, AccessMode::ReadWrite, 0)
                .unwrap_err(),
            VfsError::AlreadyExists
        );

        let vfs = builder.finish(root).unwrap();
        assert!(vfs.objects().counts(orphan).unwrap().is_orphaned());
        assert!(vfs.objects().get(stray).is_none());
        assert_eq!(vfs.stat(HandleId::new(5)).unwrap().nlink, 0);
    }

    #[test]
    fn test_stale_parent_is_not_aliased() {
        let builder = RestoreBuilder::new(VfsOptions::default());
        let root = ObjectId::new(0, 0);
        let dead_parent = ObjectId::new(1, 0);
        let orphan_dir = ObjectId::new(2, 0);
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
        builder
            .install(
                orphan_dir,
                Attributes::new(0o755, 0, 0),
                ObjectContent::Directory {
                    parent: dead_parent,
                    entries: Vec::new(),
                },
            )
            .unwrap();
        builder
            .bind_handle(HandleId::new(1), orphan_dir, AccessMode::ReadOnly, 0)
            .unwrap();
        let vfs = builder.finish(root).unwrap();

        let cred = Credentials::root();
        let fresh = vfs.mkdir(&cred, Base::Root, "new", 0o755).unwrap();
        assert_eq!(fresh.index(), dead_parent.index());
        assert_ne!(fresh, dead_parent);
        assert_eq!(
            vfs.lookup_stat(&cred, Base::Handle(HandleId::new(1)), "..").unwrap_err(),
            VfsError::NoSuchEntry
        );
    }

    #[test]
    fn test_dangling_entry_rejected() {
        let builder = RestoreBuilder::new(VfsOptions::default());
        let root = ObjectId::new(0, 0);
        builder
            .install(
                root,
                Attributes::new(0o755, 0, 0),
                ObjectContent::Directory {
                    parent: root,
                    entries: vec![("gone".into(), ObjectId::new(9, 0))],
                },
            )
            .unwrap();
        assert_eq!(builder.finish(root).unwrap_err(), VfsError::InvalidArgument);
    }
}
