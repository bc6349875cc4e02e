//! The in-memory filesystem: namespace root, object table and handle
//! registry, plus the create/open/content operations around removal.

use std::fmt;
use std::io::SeekFrom;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nsvfs_config::{
    log_vfs_debug, Config, DEFAULT_MAX_FILE_SIZE, DEFAULT_NAME_MAX, DEFAULT_PATH_MAX,
};

use crate::error::{Result, VfsError};
use crate::handle::{AccessMode, HandleId, HandleTable, OpenHandle};
use crate::object::{Attributes, Directory, Inode, Metadata, ObjectId, ObjectKind};
use crate::perm::{check_access, check_owner, check_search, Access, Credentials};
use crate::resolve::{Base, Last, ResolveFlags};
use crate::sync;
use crate::table::{ObjectTable, RefCounts};

/// Limits and defaults the engine runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsOptions {
    /// Maximum path length in bytes, terminator included
    pub path_max: usize,
    /// Maximum length of a single component
    pub name_max: usize,
    /// Bits cleared from every create mode
    pub umask: u32,
    /// Largest content length a regular file may reach
    pub max_file_size: u64,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            path_max: DEFAULT_PATH_MAX,
            name_max: DEFAULT_NAME_MAX,
            umask: 0o022,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl From<&Config> for VfsOptions {
    fn from(config: &Config) -> Self {
        Self {
            path_max: config.limits.path_max,
            name_max: config.limits.name_max,
            umask: config.permissions.umask,
            max_file_size: config.limits.max_file_size,
        }
    }
}

/// Flags for [`Vfs::open`], in builder form like `std::fs::OpenOptions`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    exclusive: bool,
    truncate: bool,
    directory: bool,
    mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            read: false,
            write: false,
            create: false,
            exclusive: false,
            truncate: false,
            directory: false,
            mode: 0o666,
        }
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Fail with `AlreadyExists` if the name is taken (`O_EXCL`)
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Target must be a directory (`O_DIRECTORY`)
    pub fn directory(mut self, directory: bool) -> Self {
        self.directory = directory;
        self
    }

    /// Mode for a newly created file, before the umask
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn access(&self) -> AccessMode {
        AccessMode::from_flags(self.read, self.write)
    }
}

/// Quiescence point. While a `Frozen` exists no mutating operation runs,
/// so the namespace and the handle registry can be walked consistently.
pub struct Frozen<'a> {
    vfs: &'a Vfs,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl<'a> Frozen<'a> {
    pub fn vfs(&self) -> &'a Vfs {
        self.vfs
    }
}

pub struct Vfs {
    pub(crate) options: VfsOptions,
    pub(crate) objects: ObjectTable,
    pub(crate) handles: HandleTable,
    pub(crate) root: Arc<Inode>,
    gate: RwLock<()>,
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs")
            .field("root", &self.root.id())
            .field("objects", &self.objects.stats())
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Vfs {
    /// Empty filesystem with a root directory owned by uid 0
    pub fn new(options: VfsOptions) -> Self {
        let objects = ObjectTable::new();
        let root = objects.allocate(RefCounts { links: 1, opens: 0 }, |id| {
            Inode::new_directory(id, Attributes::new(0o755, 0, 0), Directory::new(id))
        });
        Self::from_parts(options, objects, HandleTable::new(), root)
    }

    pub(crate) fn from_parts(
        options: VfsOptions,
        objects: ObjectTable,
        handles: HandleTable,
        root: Arc<Inode>,
    ) -> Self {
        Self {
            options,
            objects,
            handles,
            root,
            gate: RwLock::new(()),
        }
    }

    pub fn options(&self) -> &VfsOptions {
        &self.options
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn root(&self) -> &Arc<Inode> {
        &self.root
    }

    pub fn root_id(&self) -> ObjectId {
        self.root.id()
    }

    /// Block mutation until the returned guard is dropped
    pub fn freeze(&self) -> Frozen<'_> {
        Frozen {
            vfs: self,
            _guard: sync::write(&self.gate),
        }
    }

    pub(crate) fn enter(&self) -> RwLockReadGuard<'_, ()> {
        sync::read(&self.gate)
    }

    pub fn handle(&self, id: HandleId) -> Result<Arc<OpenHandle>> {
        self.handles.get(id).ok_or(VfsError::BadDescriptor)
    }

    /// Create an empty directory
    pub fn mkdir(&self, cred: &Credentials, base: Base, path: &str, mode: u32) -> Result<ObjectId> {
        let _guard = self.enter();
        let res = self.resolve(cred, base, path, ResolveFlags::default())?;
        let Last::Normal(name) = res.last else {
            return Err(VfsError::AlreadyExists);
        };
        let parent = res.dir;
        check_search(cred, &parent.attributes())?;
        let dir = parent.as_dir().ok_or(VfsError::NotADirectory)?;

        let mut entries = sync::write(dir.entry_lock());
        if entries.contains_key(&name) {
            return Err(VfsError::AlreadyExists);
        }
        self.ensure_linked(&parent)?;
        check_access(cred, &parent.attributes(), ObjectKind::Directory, Access::WRITE | Access::EXEC)?;

        let attrs = Attributes::new(mode & !self.options.umask, cred.uid, cred.gid);
        let parent_id = parent.id();
        let inode = self.objects.allocate(RefCounts { links: 1, opens: 0 }, |id| {
            Inode::new_directory(id, attrs, Directory::new(parent_id))
        });
        entries.insert(name.clone(), inode.id());
        drop(entries);

        parent.touch_modified();
        log_vfs_debug!("Directory created", name = %name, id = %inode.id());
        Ok(inode.id())
    }

    /// Open (and optionally create) the object named by `path`
    pub fn open(
        &self,
        cred: &Credentials,
        base: Base,
        path: &str,
        options: &OpenOptions,
    ) -> Result<HandleId> {
        let _guard = self.enter();
        let res = self.resolve(cred, base, path, ResolveFlags::default())?;

        let inode = match &res.last {
            Last::Normal(name) => self.open_entry(cred, &res.dir, name, res.trailing_slash, options)?,
            last => {
                if options.create && options.exclusive {
                    return Err(VfsError::AlreadyExists);
                }
                let target = match last {
                    Last::Dot => {
                        check_search(cred, &res.dir.attributes())?;
                        res.dir.clone()
                    }
                    Last::DotDot => {
                        check_search(cred, &res.dir.attributes())?;
                        self.parent_of(&res.dir)?
                    }
                    _ => res.dir.clone(),
                };
                check_open(cred, &target, res.trailing_slash, options)?;
                self.objects.acquire_open(target.id())?
            }
        };

        let access = options.access();
        if options.truncate && access.can_write() && !inode.is_dir() {
            inode.truncate(0);
        }
        let handle = self.handles.insert(inode, access);
        log_vfs_debug!("Handle opened", handle = %handle.id(), id = %handle.object_id(), access = ?access);
        Ok(handle.id())
    }

    fn open_entry(
        &self,
        cred: &Credentials,
        parent: &Arc<Inode>,
        name: &str,
        trailing_slash: bool,
        options: &OpenOptions,
    ) -> Result<Arc<Inode>> {
        check_search(cred, &parent.attributes())?;
        let dir = parent.as_dir().ok_or(VfsError::NotADirectory)?;

        if !options.create {
            // Open reference is taken with the entry lock held so a racing
            // removal either runs first (lookup fails) or after (orphan).
            let entries = sync::read(dir.entry_lock());
            let id = *entries.get(name).ok_or(VfsError::NoSuchEntry)?;
            let inode = self.objects.get(id).ok_or(VfsError::NoSuchEntry)?;
            check_open(cred, &inode, trailing_slash, options)?;
            return self.objects.acquire_open(id);
        }

        let mut entries = sync::write(dir.entry_lock());
        if let Some(&id) = entries.get(name) {
            if options.exclusive {
                return Err(VfsError::AlreadyExists);
            }
            let inode = self.objects.get(id).ok_or(VfsError::NoSuchEntry)?;
            check_open(cred, &inode, trailing_slash, options)?;
            return self.objects.acquire_open(id);
        }
        if trailing_slash {
            return Err(VfsError::IsADirectory);
        }
        if options.directory {
            return Err(VfsError::InvalidArgument);
        }
        self.ensure_linked(parent)?;
        check_access(cred, &parent.attributes(), ObjectKind::Directory, Access::WRITE | Access::EXEC)?;

        let attrs = Attributes::new(options.mode & !self.options.umask, cred.uid, cred.gid);
        let inode = self.objects.allocate(RefCounts { links: 1, opens: 1 }, |id| {
            Inode::new_file(id, attrs, Vec::new())
        });
        entries.insert(name.to_string(), inode.id());
        drop(entries);

        parent.touch_modified();
        log_vfs_debug!("File created", name = name, id = %inode.id());
        Ok(inode)
    }

    /// Search-only reference to a directory, as held for a working directory.
    /// An empty path names the base itself.
    pub fn open_search(&self, cred: &Credentials, base: Base, path: &str) -> Result<HandleId> {
        let _guard = self.enter();
        let inode = self.resolve_target(cred, base, path, ResolveFlags::empty_path())?;
        if !inode.is_dir() {
            return Err(VfsError::NotADirectory);
        }
        check_search(cred, &inode.attributes())?;
        let inode = self.objects.acquire_open(inode.id())?;
        Ok(self.handles.insert(inode, AccessMode::ReadOnly).id())
    }

    /// Creating inside a removed directory is refused
    fn ensure_linked(&self, dir: &Inode) -> Result<()> {
        match self.objects.counts(dir.id()) {
            Some(counts) if counts.links > 0 => Ok(()),
            _ => Err(VfsError::NoSuchEntry),
        }
    }

    /// Drop a handle, reclaiming its object if that was the last reference
    pub fn close(&self, handle: HandleId) -> Result<()> {
        let _guard = self.enter();
        let handle = self.handles.remove(handle).ok_or(VfsError::BadDescriptor)?;
        let disposition = self.objects.release_open(handle.object_id());
        log_vfs_debug!("Handle closed", handle = %handle.id(), disposition = ?disposition);
        Ok(())
    }

    /// Metadata of the object behind a handle, linked or not
    pub fn stat(&self, handle: HandleId) -> Result<Metadata> {
        let handle = self.handle(handle)?;
        Ok(self.metadata(handle.inode()))
    }

    /// Metadata of the object named by `path`
    pub fn lookup_stat(&self, cred: &Credentials, base: Base, path: &str) -> Result<Metadata> {
        let inode = self.resolve_target(cred, base, path, ResolveFlags::default())?;
        Ok(self.metadata(&inode))
    }

    pub fn metadata(&self, inode: &Inode) -> Metadata {
        let attrs = inode.attributes();
        let nlink = self.objects.counts(inode.id()).map_or(0, |c| c.links);
        Metadata {
            id: inode.id(),
            kind: inode.kind(),
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            size: inode.size(),
            nlink,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
        }
    }

    /// Read at the handle's offset, advancing it
    pub fn read(&self, handle: HandleId, buf: &mut [u8]) -> Result<usize> {
        let _guard = self.enter();
        let handle = self.readable(handle)?;
        let n = handle.advance(|offset| {
            let n = handle.inode().read_at(offset, buf);
            (offset + n as u64, n)
        });
        handle.inode().touch_accessed();
        Ok(n)
    }

    /// Write at the handle's offset, advancing it
    pub fn write(&self, handle: HandleId, data: &[u8]) -> Result<usize> {
        let _guard = self.enter();
        let handle = self.writable(handle)?;
        handle.advance(|offset| {
            let written = self
                .check_extent(offset, data.len())
                .and_then(|()| handle.inode().write_at(offset, data));
            match written {
                Ok(n) => (offset + n as u64, Ok(n)),
                Err(e) => (offset, Err(e)),
            }
        })
    }

    /// Read at an explicit offset; the handle offset is untouched
    pub fn pread(&self, handle: HandleId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let _guard = self.enter();
        let handle = self.readable(handle)?;
        let n = handle.inode().read_at(offset, buf);
        handle.inode().touch_accessed();
        Ok(n)
    }

    /// Write at an explicit offset; the handle offset is untouched
    pub fn pwrite(&self, handle: HandleId, data: &[u8], offset: u64) -> Result<usize> {
        let _guard = self.enter();
        let handle = self.writable(handle)?;
        self.check_extent(offset, data.len())?;
        handle.inode().write_at(offset, data)
    }

    /// A write of `len` bytes at `offset` must end within `max_file_size`
    fn check_extent(&self, offset: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.options.max_file_size => Ok(()),
            _ => Err(VfsError::FileTooLarge),
        }
    }

    pub fn seek(&self, handle: HandleId, pos: SeekFrom) -> Result<u64> {
        let _guard = self.enter();
        let handle = self.handle(handle)?;
        let size = handle.inode().size();
        handle.advance(|offset| {
            let target = match pos {
                SeekFrom::Start(n) => Some(n),
                SeekFrom::Current(delta) => offset.checked_add_signed(delta),
                SeekFrom::End(delta) => size.checked_add_signed(delta),
            };
            match target {
                Some(next) => (next, Ok(next)),
                None => (offset, Err(VfsError::InvalidArgument)),
            }
        })
    }

    /// Set the content length, zero-extending or cutting
    pub fn truncate(&self, handle: HandleId, len: u64) -> Result<()> {
        let _guard = self.enter();
        let handle = self.handle(handle)?;
        if handle.inode().is_dir() {
            return Err(VfsError::IsADirectory);
        }
        if !handle.access().can_write() {
            return Err(VfsError::InvalidArgument);
        }
        if len > self.options.max_file_size {
            return Err(VfsError::FileTooLarge);
        }
        let len = usize::try_from(len).map_err(|_| VfsError::FileTooLarge)?;
        handle.inode().truncate(len);
        Ok(())
    }

    /// `fchmod(2)`
    pub fn chmod(&self, cred: &Credentials, handle: HandleId, mode: u32) -> Result<()> {
        let _guard = self.enter();
        let handle = self.handle(handle)?;
        let inode = handle.inode();
        check_owner(cred, &inode.attributes())?;
        inode.set_mode(mode);
        Ok(())
    }

    /// `chmod(2)`
    pub fn chmod_path(&self, cred: &Credentials, base: Base, path: &str, mode: u32) -> Result<()> {
        let _guard = self.enter();
        let inode = self.resolve_target(cred, base, path, ResolveFlags::default())?;
        check_owner(cred, &inode.attributes())?;
        inode.set_mode(mode);
        Ok(())
    }

    /// Entry names of a directory handle, sorted. An orphaned directory is
    /// always empty.
    pub fn read_dir(&self, handle: HandleId) -> Result<Vec<String>> {
        let handle = self.handle(handle)?;
        let dir = handle.inode().as_dir().ok_or(VfsError::NotADirectory)?;
        Ok(dir.names())
    }

    fn readable(&self, handle: HandleId) -> Result<Arc<OpenHandle>> {
        let handle = self.handle(handle)?;
        if handle.inode().is_dir() {
            return Err(VfsError::IsADirectory);
        }
        if !handle.access().can_read() {
            return Err(VfsError::BadDescriptor);
        }
        Ok(handle)
    }

    fn writable(&self, handle: HandleId) -> Result<Arc<OpenHandle>> {
        let handle = self.handle(handle)?;
        if handle.inode().is_dir() {
            return Err(VfsError::IsADirectory);
        }
        if !handle.access().can_write() {
            return Err(VfsError::BadDescriptor);
        }
        Ok(handle)
    }
}

/// Type and permission checks for opening an existing object
fn check_open(
    cred: &Credentials,
    inode: &Inode,
    trailing_slash: bool,
    options: &OpenOptions,
) -> Result<()> {
    if inode.is_dir() {
        if options.write || options.create {
            return Err(VfsError::IsADirectory);
        }
    } else if options.directory || trailing_slash {
        return Err(VfsError::NotADirectory);
    }

    let attrs = inode.attributes();
    let access = options.access();
    if access.can_read() {
        check_access(cred, &attrs, inode.kind(), Access::READ)?;
    }
    if access.can_write() {
        check_access(cred, &attrs, inode.kind(), Access::WRITE)?;
    }
    Ok(())
}
