//! Path resolution.
//!
//! Turns a (base, path, flags) triple into the directory that holds the
//! final component plus a classification of that component. Only the
//! removal engine and create-style operations decide what a final `.`,
//! `..` or root means for them.

use std::sync::Arc;

use crate::error::{Result, VfsError};
use crate::handle::HandleId;
use crate::object::Inode;
use crate::perm::{check_search, Credentials};
use crate::vfs::Vfs;

/// Where a relative path starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// The filesystem root
    Root,
    /// An open handle. Must refer to a directory unless the path is empty
    /// and [`ResolveFlags::empty_path`] is set.
    Handle(HandleId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveFlags {
    /// An empty path names the base itself instead of failing
    pub empty_path: bool,
}

impl ResolveFlags {
    pub fn empty_path() -> Self {
        Self { empty_path: true }
    }
}

/// Classification of the final path component
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Last {
    Normal(String),
    Dot,
    DotDot,
    /// The path consisted only of separators
    Root,
    /// Empty path resolved against a non-root base handle
    Base,
}

#[derive(Debug)]
pub(crate) struct Resolution {
    /// Directory holding the final component, or the target itself for
    /// [`Last::Root`] and [`Last::Base`]
    pub dir: Arc<Inode>,
    pub last: Last,
    /// The path ended in one or more `/`
    pub trailing_slash: bool,
}

impl Vfs {
    pub(crate) fn resolve(
        &self,
        cred: &Credentials,
        base: Base,
        path: &str,
        flags: ResolveFlags,
    ) -> Result<Resolution> {
        if path.len() + 1 > self.options.path_max {
            return Err(VfsError::NameTooLong);
        }

        if path.is_empty() {
            if !flags.empty_path {
                return Err(VfsError::NoSuchEntry);
            }
            let target = self.base_inode(base)?;
            let last = if target.id() == self.root.id() {
                Last::Root
            } else {
                Last::Base
            };
            return Ok(Resolution {
                dir: target,
                last,
                trailing_slash: false,
            });
        }

        let mut dir = if path.starts_with('/') {
            self.root.clone()
        } else {
            let start = self.base_inode(base)?;
            if !start.is_dir() {
                return Err(VfsError::NotADirectory);
            }
            start
        };

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let trailing_slash = path.ends_with('/');
        for component in &components {
            if component.len() > self.options.name_max {
                return Err(VfsError::NameTooLong);
            }
        }

        let Some((last, intermediate)) = components.split_last() else {
            return Ok(Resolution {
                dir: self.root.clone(),
                last: Last::Root,
                trailing_slash,
            });
        };

        for component in intermediate {
            check_search(cred, &dir.attributes())?;
            dir = match *component {
                "." => dir,
                ".." => self.parent_of(&dir)?,
                name => {
                    let child = self.lookup_in(&dir, name)?;
                    if !child.is_dir() {
                        return Err(VfsError::NotADirectory);
                    }
                    child
                }
            };
        }

        let last = match *last {
            "." => Last::Dot,
            ".." => Last::DotDot,
            name => Last::Normal(name.to_string()),
        };
        Ok(Resolution {
            dir,
            last,
            trailing_slash,
        })
    }

    /// Object a base refers to
    pub(crate) fn base_inode(&self, base: Base) -> Result<Arc<Inode>> {
        match base {
            Base::Root => Ok(self.root.clone()),
            Base::Handle(id) => self
                .handles
                .get(id)
                .map(|handle| handle.inode().clone())
                .ok_or(VfsError::BadDescriptor),
        }
    }

    /// Parent of a directory; the root is its own parent
    pub(crate) fn parent_of(&self, dir: &Inode) -> Result<Arc<Inode>> {
        let parent = dir.as_dir().ok_or(VfsError::NotADirectory)?.parent();
        self.objects.get(parent).ok_or(VfsError::NoSuchEntry)
    }

    /// Look a name up in `dir` without any permission check
    pub(crate) fn lookup_in(&self, dir: &Inode, name: &str) -> Result<Arc<Inode>> {
        let entries = dir.as_dir().ok_or(VfsError::NotADirectory)?;
        let id = entries.get(name).ok_or(VfsError::NoSuchEntry)?;
        self.objects.get(id).ok_or(VfsError::NoSuchEntry)
    }

    /// Resolve a path all the way to an object
    pub(crate) fn resolve_target(
        &self,
        cred: &Credentials,
        base: Base,
        path: &str,
        flags: ResolveFlags,
    ) -> Result<Arc<Inode>> {
        let res = self.resolve(cred, base, path, flags)?;
        let target = match &res.last {
            Last::Root | Last::Base => res.dir,
            Last::Dot => {
                check_search(cred, &res.dir.attributes())?;
                res.dir
            }
            Last::DotDot => {
                check_search(cred, &res.dir.attributes())?;
                self.parent_of(&res.dir)?
            }
            Last::Normal(name) => {
                check_search(cred, &res.dir.attributes())?;
                self.lookup_in(&res.dir, name)?
            }
        };
        if res.trailing_slash && !target.is_dir() {
            return Err(VfsError::NotADirectory);
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::VfsOptions;

    fn setup() -> (Vfs, Credentials) {
        let vfs = Vfs::new(VfsOptions::default());
        let cred = Credentials::root();
        vfs.mkdir(&cred, Base::Root, "a", 0o755).unwrap();
        vfs.mkdir(&cred, Base::Root, "a/b", 0o755).unwrap();
        (vfs, cred)
    }

    #[test]
    fn test_root_spellings() {
        let (vfs, cred) = setup();
        for path in ["/", "//", "///"] {
            let res = vfs.resolve(&cred, Base::Root, path, ResolveFlags::default()).unwrap();
            assert_eq!(res.last, Last::Root, "{path}");
        }
        // A final `..` stays a dot-dot even when it climbs to the root
        let res = vfs.resolve(&cred, Base::Root, "a/../..", ResolveFlags::default()).unwrap();
        assert_eq!(res.last, Last::DotDot);
        assert_eq!(res.dir.id(), vfs.root_id());
    }

    #[test]
    fn test_trailing_slashes_are_stripped() {
        let (vfs, cred) = setup();
        for path in ["a/b", "a/b/", "a/b//", "/a//b"] {
            let res = vfs.resolve(&cred, Base::Root, path, ResolveFlags::default()).unwrap();
            assert_eq!(res.last, Last::Normal("b".into()));
        }
        let res = vfs.resolve(&cred, Base::Root, "a/b//", ResolveFlags::default()).unwrap();
        assert!(res.trailing_slash);
    }

    #[test]
    fn test_dots_classified() {
        let (vfs, cred) = setup();
        let res = vfs.resolve(&cred, Base::Root, "a/b/.", ResolveFlags::default()).unwrap();
        assert_eq!(res.last, Last::Dot);
        let res = vfs.resolve(&cred, Base::Root, "a/b/..", ResolveFlags::default()).unwrap();
        assert_eq!(res.last, Last::DotDot);
    }

    #[test]
    fn test_empty_path() {
        let (vfs, cred) = setup();
        assert_eq!(
            vfs.resolve(&cred, Base::Root, "", ResolveFlags::default()).unwrap_err(),
            VfsError::NoSuchEntry
        );
        let res = vfs.resolve(&cred, Base::Root, "", ResolveFlags::empty_path()).unwrap();
        assert_eq!(res.last, Last::Root);
    }

    #[test]
    fn test_name_limits() {
        let (vfs, cred) = setup();
        let long_name = "x".repeat(256);
        assert_eq!(
            vfs.resolve(&cred, Base::Root, &long_name, ResolveFlags::default()).unwrap_err(),
            VfsError::NameTooLong
        );
        let long_path = "a/".repeat(2048);
        assert_eq!(
            vfs.resolve(&cred, Base::Root, &long_path, ResolveFlags::default()).unwrap_err(),
            VfsError::NameTooLong
        );
    }

    #[test]
    fn test_missing_intermediate() {
        let (vfs, cred) = setup();
        assert_eq!(
            vfs.resolve(&cred, Base::Root, "nope/x", ResolveFlags::default()).unwrap_err(),
            VfsError::NoSuchEntry
        );
    }

    #[test]
    fn test_unknown_base_handle() {
        let (vfs, cred) = setup();
        assert_eq!(
            vfs.resolve(&cred, Base::Handle(HandleId::new(99)), "x", ResolveFlags::default())
                .unwrap_err(),
            VfsError::BadDescriptor
        );
        // Absolute paths never look at the base
        assert!(vfs
            .resolve(&cred, Base::Handle(HandleId::new(99)), "/a", ResolveFlags::default())
            .is_ok());
    }
}
