//! Discretionary access checks.
//!
//! Privilege overrides are consumed through [`PrivilegeOverride`]; the
//! credentials of the acting principal are always passed explicitly so two
//! callers with different privileges never share mutable state.

use std::ops::BitOr;

use crate::error::{Result, VfsError};
use crate::object::{Attributes, ObjectKind};

/// Capabilities that bypass discretionary checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Bypass all read/write/search checks
    DacOverride,
    /// Bypass read checks and directory search checks
    DacReadSearch,
    /// Bypass ownership checks (chmod, sticky directories)
    Fowner,
}

impl Capability {
    fn bit(self) -> u8 {
        match self {
            Capability::DacOverride => 1 << 0,
            Capability::DacReadSearch => 1 << 1,
            Capability::Fowner => 1 << 2,
        }
    }
}

/// Source of the "is privileged" signal.
pub trait PrivilegeOverride {
    fn is_override_active(&self, cap: Capability) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self(Capability::DacOverride.bit() | Capability::DacReadSearch.bit() | Capability::Fowner.bit())
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !cap.bit();
    }
}

/// Identity and privileges of the acting principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    caps: CapabilitySet,
}

impl Credentials {
    /// uid 0 with every override capability
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
            caps: CapabilitySet::all(),
        }
    }

    /// Unprivileged user
    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
            caps: CapabilitySet::empty(),
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.caps.insert(cap);
        self
    }

    pub fn without_capability(mut self, cap: Capability) -> Self {
        self.caps.remove(cap);
        self
    }

    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

impl PrivilegeOverride for Credentials {
    fn is_override_active(&self, cap: Capability) -> bool {
        self.caps.contains(cap)
    }
}

/// Requested access, as rwx bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u32);

impl Access {
    pub const READ: Access = Access(0o4);
    pub const WRITE: Access = Access(0o2);
    pub const EXEC: Access = Access(0o1);

    pub fn bits(self) -> u32 {
        self.0
    }

    fn within(self, other: Access) -> bool {
        self.0 & !other.0 == 0
    }
}

impl BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

/// Check `want` against the object's mode bits for `cred`.
pub fn check_access(
    cred: &Credentials,
    attrs: &Attributes,
    kind: ObjectKind,
    want: Access,
) -> Result<()> {
    let class_bits = if cred.uid == attrs.uid {
        (attrs.mode >> 6) & 0o7
    } else if cred.in_group(attrs.gid) {
        (attrs.mode >> 3) & 0o7
    } else {
        attrs.mode & 0o7
    };
    if want.within(Access(class_bits)) {
        return Ok(());
    }

    if cred.is_override_active(Capability::DacOverride) {
        return Ok(());
    }
    if cred.is_override_active(Capability::DacReadSearch) {
        let bypassed = match kind {
            ObjectKind::Directory => Access::READ | Access::EXEC,
            ObjectKind::Regular => Access::READ,
        };
        if want.within(bypassed) {
            return Ok(());
        }
    }
    Err(VfsError::AccessDenied)
}

/// Search permission on a directory being traversed
pub fn check_search(cred: &Credentials, dir: &Attributes) -> Result<()> {
    check_access(cred, dir, ObjectKind::Directory, Access::EXEC)
}

/// May `cred` remove an entry from a directory with attributes `dir`?
/// Checked before the entry is even looked up.
pub fn check_remove_from(cred: &Credentials, dir: &Attributes) -> Result<()> {
    check_access(cred, dir, ObjectKind::Directory, Access::WRITE | Access::EXEC)
}

/// Sticky directories only let owners remove entries.
pub fn check_sticky(cred: &Credentials, dir: &Attributes, victim: &Attributes) -> Result<()> {
    if !dir.is_sticky() || cred.uid == victim.uid || cred.uid == dir.uid {
        return Ok(());
    }
    if cred.is_override_active(Capability::Fowner) {
        return Ok(());
    }
    Err(VfsError::PermissionDenied)
}

/// Ownership check for attribute changes
pub fn check_owner(cred: &Credentials, attrs: &Attributes) -> Result<()> {
    if cred.uid == attrs.uid || cred.is_override_active(Capability::Fowner) {
        Ok(())
    } else {
        Err(VfsError::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(mode: u32, uid: u32) -> Attributes {
        Attributes::new(mode, uid, uid)
    }

    #[test]
    fn test_owner_bits() {
        let cred = Credentials::user(1000, 1000);
        assert!(check_remove_from(&cred, &dir(0o700, 1000)).is_ok());
        assert_eq!(
            check_remove_from(&cred, &dir(0o500, 1000)),
            Err(VfsError::AccessDenied)
        );
        assert_eq!(
            check_remove_from(&cred, &dir(0o300, 1000)),
            Ok(())
        );
    }

    #[test]
    fn test_other_and_group_bits() {
        let cred = Credentials::user(1000, 50).with_groups(vec![60]);
        assert!(check_search(&cred, &Attributes::new(0o710, 0, 60)).is_ok());
        assert_eq!(
            check_search(&cred, &Attributes::new(0o700, 0, 70)),
            Err(VfsError::AccessDenied)
        );
        assert!(check_search(&cred, &Attributes::new(0o701, 0, 70)).is_ok());
    }

    #[test]
    fn test_dac_override_allows_everything() {
        let cred = Credentials::user(1000, 1000).with_capability(Capability::DacOverride);
        assert!(check_remove_from(&cred, &dir(0o000, 0)).is_ok());
    }

    #[test]
    fn test_dropped_override_is_strict() {
        let cred = Credentials::root()
            .without_capability(Capability::DacOverride)
            .without_capability(Capability::DacReadSearch);
        // root owns the directory but its owner bits grant nothing
        assert_eq!(
            check_remove_from(&cred, &dir(0o000, 0)),
            Err(VfsError::AccessDenied)
        );
        assert_eq!(
            check_remove_from(&cred, &dir(0o444, 0)),
            Err(VfsError::AccessDenied)
        );
    }

    #[test]
    fn test_read_search_covers_search_not_write() {
        let cred = Credentials::user(1000, 1000).with_capability(Capability::DacReadSearch);
        assert!(check_search(&cred, &dir(0o000, 0)).is_ok());
        assert_eq!(
            check_remove_from(&cred, &dir(0o000, 0)),
            Err(VfsError::AccessDenied)
        );
        assert_eq!(
            check_access(&cred, &dir(0o000, 0), ObjectKind::Regular, Access::EXEC),
            Err(VfsError::AccessDenied)
        );
    }

    #[test]
    fn test_sticky_directory() {
        let tmp = dir(0o1777, 0);
        let alice = Credentials::user(1000, 1000);
        let bob = Credentials::user(1001, 1001);
        let alices_file = Attributes::new(0o644, 1000, 1000);

        assert!(check_sticky(&alice, &tmp, &alices_file).is_ok());
        assert_eq!(
            check_sticky(&bob, &tmp, &alices_file),
            Err(VfsError::PermissionDenied)
        );
        let bob = bob.with_capability(Capability::Fowner);
        assert!(check_sticky(&bob, &tmp, &alices_file).is_ok());
    }

    #[test]
    fn test_owner_check() {
        let attrs = Attributes::new(0o644, 1000, 1000);
        assert!(check_owner(&Credentials::user(1000, 1), &attrs).is_ok());
        assert_eq!(
            check_owner(&Credentials::user(1001, 1), &attrs),
            Err(VfsError::PermissionDenied)
        );
        assert!(check_owner(&Credentials::root(), &attrs).is_ok());
    }
}
