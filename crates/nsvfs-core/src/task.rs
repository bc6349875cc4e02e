//! Process-level entry points.
//!
//! A [`Task`] owns credentials, a user address space that path arguments
//! are copied in from, a descriptor table and a working directory. Its
//! methods mirror the Linux syscalls of the same name.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nsvfs_config::log_vfs_warn;

use crate::error::{Result, VfsError};
use crate::handle::HandleId;
use crate::object::Metadata;
use crate::perm::Credentials;
use crate::remove::RemoveFlags;
use crate::resolve::Base;
use crate::sync;
use crate::vfs::{OpenOptions, Vfs};

pub const AT_FDCWD: i32 = libc::AT_FDCWD;
pub const AT_REMOVEDIR: i32 = libc::AT_REMOVEDIR;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const AT_EMPTY_PATH: i32 = libc::AT_EMPTY_PATH;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const AT_EMPTY_PATH: i32 = 0x1000;

pub const O_ACCMODE: i32 = libc::O_ACCMODE;
pub const O_RDONLY: i32 = libc::O_RDONLY;
pub const O_WRONLY: i32 = libc::O_WRONLY;
pub const O_RDWR: i32 = libc::O_RDWR;
pub const O_CREAT: i32 = libc::O_CREAT;
pub const O_EXCL: i32 = libc::O_EXCL;
pub const O_TRUNC: i32 = libc::O_TRUNC;
pub const O_DIRECTORY: i32 = libc::O_DIRECTORY;

/// Source of syscall pointer arguments
pub trait UserMemory {
    /// Copy bytes starting at `addr` into `buf`, stopping early at the end
    /// of the mapping. Fails with `BadAddress` if `addr` is unmapped.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Sparse address space of independently mapped byte regions
#[derive(Debug)]
pub struct MappedMemory {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    next: AtomicU64,
}

/// First address handed out; everything below stays unmapped
const MAP_BASE: u64 = 0x1_0000;
const MAP_ALIGN: u64 = 0x1000;

impl Default for MappedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MappedMemory {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(MAP_BASE),
        }
    }

    /// Map raw bytes and return their address
    pub fn map_raw(&self, bytes: &[u8]) -> u64 {
        let span = (bytes.len() as u64).div_ceil(MAP_ALIGN).max(1) * MAP_ALIGN;
        // Leave an unmapped guard page between regions
        let addr = self.next.fetch_add(span + MAP_ALIGN, Ordering::Relaxed);
        sync::lock(&self.regions).insert(addr, bytes.to_vec());
        addr
    }

    /// Map a NUL-terminated copy of `s`
    pub fn map_str(&self, s: &str) -> u64 {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.map_raw(&bytes)
    }

    pub fn unmap(&self, addr: u64) -> bool {
        sync::lock(&self.regions).remove(&addr).is_some()
    }
}

impl UserMemory for MappedMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let regions = sync::lock(&self.regions);
        let (start, bytes) = regions.range(..=addr).next_back().ok_or(VfsError::BadAddress)?;
        let offset = (addr - start) as usize;
        if offset >= bytes.len() {
            return Err(VfsError::BadAddress);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }
}

/// Copy a NUL-terminated path of at most `path_max` bytes (terminator
/// included) out of user memory.
pub fn copy_in_path(memory: &impl UserMemory, addr: u64, path_max: usize) -> Result<String> {
    let mut buf = vec![0u8; path_max];
    let n = memory.read(addr, &mut buf)?;
    match buf[..n].iter().position(|&b| b == 0) {
        Some(len) => {
            buf.truncate(len);
            String::from_utf8(buf).map_err(|_| VfsError::InvalidArgument)
        }
        // Ran off the end of the mapping before a terminator
        None if n < path_max => Err(VfsError::BadAddress),
        None => Err(VfsError::NameTooLong),
    }
}

/// A process: credentials, address space, descriptors and cwd
pub struct Task {
    vfs: Arc<Vfs>,
    cred: Credentials,
    memory: MappedMemory,
    fds: Mutex<BTreeMap<i32, HandleId>>,
    cwd: Mutex<HandleId>,
}

impl Task {
    /// New task with its working directory at `/`
    pub fn new(vfs: Arc<Vfs>, cred: Credentials) -> Result<Self> {
        let cwd = vfs.open_search(&cred, Base::Root, "/")?;
        Ok(Self {
            vfs,
            cred,
            memory: MappedMemory::new(),
            fds: Mutex::new(BTreeMap::new()),
            cwd: Mutex::new(cwd),
        })
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn credentials(&self) -> &Credentials {
        &self.cred
    }

    pub fn set_credentials(&mut self, cred: Credentials) {
        self.cred = cred;
    }

    pub fn memory(&self) -> &MappedMemory {
        &self.memory
    }

    pub fn cwd(&self) -> HandleId {
        *sync::lock(&self.cwd)
    }

    /// Descriptor table in fd order
    pub fn fds(&self) -> Vec<(i32, HandleId)> {
        sync::lock(&self.fds).iter().map(|(fd, h)| (*fd, *h)).collect()
    }

    /// Handle behind a descriptor
    pub fn handle(&self, fd: i32) -> Result<HandleId> {
        sync::lock(&self.fds).get(&fd).copied().ok_or(VfsError::BadDescriptor)
    }

    fn install(&self, handle: HandleId) -> i32 {
        let mut fds = sync::lock(&self.fds);
        let fd = (0..)
            .zip(fds.keys())
            .find(|(want, have)| want != *have)
            .map_or(fds.len() as i32, |(want, _)| want);
        fds.insert(fd, handle);
        fd
    }

    fn path(&self, addr: u64) -> Result<String> {
        copy_in_path(&self.memory, addr, self.vfs.options().path_max)
    }

    /// Absolute paths ignore `dirfd` entirely
    fn base(&self, dirfd: i32, path: &str) -> Result<Base> {
        if path.starts_with('/') {
            Ok(Base::Root)
        } else if dirfd == AT_FDCWD {
            Ok(Base::Handle(self.cwd()))
        } else {
            self.handle(dirfd).map(Base::Handle)
        }
    }

    pub fn unlink(&self, path: u64) -> Result<()> {
        self.unlinkat(AT_FDCWD, path, 0)
    }

    pub fn rmdir(&self, path: u64) -> Result<()> {
        self.unlinkat(AT_FDCWD, path, AT_REMOVEDIR)
    }

    pub fn unlinkat(&self, dirfd: i32, path: u64, flags: i32) -> Result<()> {
        if flags & !(AT_REMOVEDIR | AT_EMPTY_PATH) != 0 {
            return Err(VfsError::InvalidArgument);
        }
        let path = self.path(path)?;
        let base = self.base(dirfd, &path)?;
        let flags = RemoveFlags {
            directory: flags & AT_REMOVEDIR != 0,
            empty_path: flags & AT_EMPTY_PATH != 0,
        };
        self.vfs.remove(&self.cred, base, &path, flags)
    }

    pub fn open(&self, path: u64, flags: i32, mode: u32) -> Result<i32> {
        self.openat(AT_FDCWD, path, flags, mode)
    }

    pub fn openat(&self, dirfd: i32, path: u64, flags: i32, mode: u32) -> Result<i32> {
        let (read, write) = match flags & O_ACCMODE {
            O_RDONLY => (true, false),
            O_WRONLY => (false, true),
            O_RDWR => (true, true),
            _ => return Err(VfsError::InvalidArgument),
        };
        let options = OpenOptions::new()
            .read(read)
            .write(write)
            .create(flags & O_CREAT != 0)
            .exclusive(flags & O_EXCL != 0)
            .truncate(flags & O_TRUNC != 0)
            .directory(flags & O_DIRECTORY != 0)
            .mode(mode);
        let path = self.path(path)?;
        let base = self.base(dirfd, &path)?;
        let handle = self.vfs.open(&self.cred, base, &path, &options)?;
        Ok(self.install(handle))
    }

    pub fn mkdir(&self, path: u64, mode: u32) -> Result<()> {
        self.mkdirat(AT_FDCWD, path, mode)
    }

    pub fn mkdirat(&self, dirfd: i32, path: u64, mode: u32) -> Result<()> {
        let path = self.path(path)?;
        let base = self.base(dirfd, &path)?;
        self.vfs.mkdir(&self.cred, base, &path, mode).map(|_| ())
    }

    pub fn close(&self, fd: i32) -> Result<()> {
        let handle = sync::lock(&self.fds).remove(&fd).ok_or(VfsError::BadDescriptor)?;
        self.vfs.close(handle)
    }

    pub fn fstat(&self, fd: i32) -> Result<Metadata> {
        self.vfs.stat(self.handle(fd)?)
    }

    pub fn stat(&self, path: u64) -> Result<Metadata> {
        let path = self.path(path)?;
        let base = self.base(AT_FDCWD, &path)?;
        self.vfs.lookup_stat(&self.cred, base, &path)
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        self.vfs.read(self.handle(fd)?, buf)
    }

    pub fn write(&self, fd: i32, data: &[u8]) -> Result<usize> {
        self.vfs.write(self.handle(fd)?, data)
    }

    pub fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.vfs.pread(self.handle(fd)?, buf, offset)
    }

    pub fn pwrite(&self, fd: i32, data: &[u8], offset: u64) -> Result<usize> {
        self.vfs.pwrite(self.handle(fd)?, data, offset)
    }

    pub fn ftruncate(&self, fd: i32, len: u64) -> Result<()> {
        self.vfs.truncate(self.handle(fd)?, len)
    }

    pub fn fchmod(&self, fd: i32, mode: u32) -> Result<()> {
        self.vfs.chmod(&self.cred, self.handle(fd)?, mode)
    }

    pub fn chmod(&self, path: u64, mode: u32) -> Result<()> {
        let path = self.path(path)?;
        let base = self.base(AT_FDCWD, &path)?;
        self.vfs.chmod_path(&self.cred, base, &path, mode)
    }

    pub fn chdir(&self, path: u64) -> Result<()> {
        let path = self.path(path)?;
        let base = self.base(AT_FDCWD, &path)?;
        let next = self.vfs.open_search(&self.cred, base, &path)?;
        let prev = std::mem::replace(&mut *sync::lock(&self.cwd), next);
        self.vfs.close(prev)
    }

    /// Point the descriptor table at a restored filesystem. Handle ids are
    /// preserved by checkpointing, so descriptors stay valid; any that
    /// are missing from `vfs` are dropped.
    pub fn rebind(&mut self, vfs: Arc<Vfs>) -> Result<()> {
        if !vfs.handles().contains(self.cwd()) {
            return Err(VfsError::BadDescriptor);
        }
        let fds = self.fds.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        fds.retain(|fd, handle| {
            let live = vfs.handles().contains(*handle);
            if !live {
                log_vfs_warn!("Descriptor lost across restore", fd = *fd, handle = %handle);
            }
            live
        });
        // Old handles die with the old filesystem
        self.vfs = vfs;
        Ok(())
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let fds = std::mem::take(self.fds.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner));
        for handle in fds.into_values() {
            let _ = self.vfs.close(handle);
        }
        let _ = self.vfs.close(self.cwd());
    }
}
