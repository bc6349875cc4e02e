//! Removal engine: `unlink`/`rmdir` semantics.
//!
//! Validation and detachment run under the parent directory's entry write
//! lock. Either every check passes and the name plus its link are dropped
//! together, or nothing changes.

use nsvfs_config::{log_vfs_debug, log_vfs_info};

use crate::error::{Result, VfsError};
use crate::object::Inode;
use crate::perm::{check_remove_from, check_sticky, Credentials};
use crate::resolve::{Base, Last, ResolveFlags};
use crate::sync;
use crate::table::Disposition;
use crate::vfs::Vfs;

/// Options for [`Vfs::remove`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveFlags {
    /// Remove a directory (`rmdir`, `AT_REMOVEDIR`) instead of a file
    pub directory: bool,
    /// An empty path names the base handle itself
    pub empty_path: bool,
}

impl RemoveFlags {
    pub fn file() -> Self {
        Self::default()
    }

    pub fn directory() -> Self {
        Self {
            directory: true,
            empty_path: false,
        }
    }

    pub fn with_empty_path(mut self) -> Self {
        self.empty_path = true;
        self
    }
}

impl Vfs {
    /// Remove the entry named by `path`.
    pub fn remove(
        &self,
        cred: &Credentials,
        base: Base,
        path: &str,
        flags: RemoveFlags,
    ) -> Result<()> {
        let _guard = self.enter();
        let result = self.remove_locked(cred, base, path, flags);
        if let Err(e) = result {
            log_vfs_debug!(
                "Removal refused",
                path = path,
                directory = flags.directory,
                error = e.name()
            );
        }
        result
    }

    /// `unlink(2)`
    pub fn unlink(&self, cred: &Credentials, base: Base, path: &str) -> Result<()> {
        self.remove(cred, base, path, RemoveFlags::file())
    }

    /// `rmdir(2)`
    pub fn rmdir(&self, cred: &Credentials, base: Base, path: &str) -> Result<()> {
        self.remove(cred, base, path, RemoveFlags::directory())
    }

    fn remove_locked(
        &self,
        cred: &Credentials,
        base: Base,
        path: &str,
        flags: RemoveFlags,
    ) -> Result<()> {
        let resolve_flags = ResolveFlags {
            empty_path: flags.empty_path,
        };
        let res = self.resolve(cred, base, path, resolve_flags)?;
        match res.last {
            Last::Dot | Last::DotDot => Err(VfsError::NotADirectory),
            Last::Root if flags.directory => Err(VfsError::DeviceBusy),
            Last::Root => Err(VfsError::IsADirectory),
            Last::Base => Err(VfsError::NoSuchEntry),
            Last::Normal(name) => self.detach(cred, &res.dir, &name, res.trailing_slash, flags),
        }
    }

    fn detach(
        &self,
        cred: &Credentials,
        parent: &Inode,
        name: &str,
        trailing_slash: bool,
        flags: RemoveFlags,
    ) -> Result<()> {
        let dir = parent.as_dir().ok_or(VfsError::NotADirectory)?;
        let mut entries = sync::write(dir.entry_lock());

        let parent_attrs = parent.attributes();
        check_remove_from(cred, &parent_attrs)?;

        let id = *entries.get(name).ok_or(VfsError::NoSuchEntry)?;
        let victim = self.objects.get(id).ok_or(VfsError::NoSuchEntry)?;
        check_sticky(cred, &parent_attrs, &victim.attributes())?;

        match (flags.directory, victim.is_dir()) {
            (true, false) => return Err(VfsError::NotADirectory),
            (false, true) => return Err(VfsError::IsADirectory),
            (false, false) if trailing_slash => return Err(VfsError::NotADirectory),
            _ => {}
        }
        if victim.id() == self.root.id() {
            return Err(VfsError::DeviceBusy);
        }

        let disposition = match victim.as_dir() {
            Some(child) => {
                // Holding the child's entry lock keeps creates out until the
                // link is gone and the directory reads as orphaned.
                let child_entries = sync::write(child.entry_lock());
                if !child_entries.is_empty() {
                    return Err(VfsError::DirectoryNotEmpty);
                }
                entries.remove(name);
                self.objects.release_link(id)
            }
            None => {
                entries.remove(name);
                self.objects.release_link(id)
            }
        };
        drop(entries);

        parent.touch_modified();
        victim.touch_changed();
        match disposition {
            Disposition::Orphaned => {
                log_vfs_info!("Entry removed, object orphaned", name = name, id = %id)
            }
            _ => log_vfs_debug!("Entry removed", name = name, id = %id, disposition = ?disposition),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{OpenOptions, VfsOptions};

    fn vfs() -> (Vfs, Credentials) {
        (Vfs::new(VfsOptions::default()), Credentials::root())
    }

    #[test]
    fn test_rmdir_empty() {
        let (vfs, cred) = vfs();
        vfs.mkdir(&cred, Base::Root, "d", 0o755).unwrap();
        vfs.rmdir(&cred, Base::Root, "d").unwrap();
        assert_eq!(
            vfs.lookup_stat(&cred, Base::Root, "d").unwrap_err(),
            VfsError::NoSuchEntry
        );
        // Only the root is left
        assert_eq!(vfs.objects().len(), 1);
    }

    #[test]
    fn test_failed_removal_is_repeatable() {
        let (vfs, cred) = vfs();
        vfs.mkdir(&cred, Base::Root, "d", 0o755).unwrap();
        vfs.mkdir(&cred, Base::Root, "d/e", 0o755).unwrap();
        for _ in 0..3 {
            assert_eq!(
                vfs.rmdir(&cred, Base::Root, "d").unwrap_err(),
                VfsError::DirectoryNotEmpty
            );
        }
        assert!(vfs.lookup_stat(&cred, Base::Root, "d/e").is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        let (vfs, cred) = vfs();
        let h = vfs
            .open(&cred, Base::Root, "f", &OpenOptions::new().write(true).create(true))
            .unwrap();
        vfs.close(h).unwrap();
        vfs.mkdir(&cred, Base::Root, "d", 0o755).unwrap();

        assert_eq!(vfs.rmdir(&cred, Base::Root, "f").unwrap_err(), VfsError::NotADirectory);
        assert_eq!(vfs.unlink(&cred, Base::Root, "f/").unwrap_err(), VfsError::NotADirectory);
        assert_eq!(vfs.unlink(&cred, Base::Root, "d").unwrap_err(), VfsError::IsADirectory);
        vfs.unlink(&cred, Base::Root, "f").unwrap();
        vfs.rmdir(&cred, Base::Root, "d/").unwrap();
    }

    #[test]
    fn test_root_and_dots() {
        let (vfs, cred) = vfs();
        vfs.mkdir(&cred, Base::Root, "d", 0o755).unwrap();
        assert_eq!(vfs.rmdir(&cred, Base::Root, "/").unwrap_err(), VfsError::DeviceBusy);
        assert_eq!(vfs.unlink(&cred, Base::Root, "/").unwrap_err(), VfsError::IsADirectory);
        assert_eq!(vfs.rmdir(&cred, Base::Root, "d/.").unwrap_err(), VfsError::NotADirectory);
        assert_eq!(vfs.rmdir(&cred, Base::Root, "d/..").unwrap_err(), VfsError::NotADirectory);
        assert_eq!(
            vfs.remove(&cred, Base::Root, "", RemoveFlags::directory().with_empty_path())
                .unwrap_err(),
            VfsError::DeviceBusy
        );
    }

    #[test]
    fn test_sticky_directory_protects_other_owners() {
        let (vfs, root) = vfs();
        vfs.mkdir(&root, Base::Root, "tmp", 0o755).unwrap();
        vfs.chmod_path(&root, Base::Root, "tmp", 0o1777).unwrap();
        let alice = Credentials::user(1000, 1000);
        let bob = Credentials::user(1001, 1001);
        let h = vfs
            .open(&alice, Base::Root, "tmp/a", &OpenOptions::new().write(true).create(true))
            .unwrap();
        vfs.close(h).unwrap();

        assert_eq!(
            vfs.unlink(&bob, Base::Root, "tmp/a").unwrap_err(),
            VfsError::PermissionDenied
        );
        vfs.unlink(&alice, Base::Root, "tmp/a").unwrap();
    }
}
