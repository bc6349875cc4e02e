//! Filesystem objects (inodes) independent of any name.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VfsError};
use crate::sync;

/// Sticky bit: only owners may remove entries from such a directory
pub const S_ISVTX: u32 = 0o1000;
/// All bits a mode may carry (permissions plus setuid/setgid/sticky)
pub const MODE_MASK: u32 = 0o7777;

/// Identity of an object in the object table.
///
/// `index` names a slot; `generation` distinguishes successive occupants of
/// the same slot so a stale id never aliases a newer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Inode number as reported by stat
    pub fn ino(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Object kind. The set is closed, so operations match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    Regular = 0,
    Directory = 1,
}

/// Ownership, permission and timestamp attributes of an object.
/// Timestamps are nanoseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Attributes {
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        let now = now_nanos();
        Self {
            mode: mode & MODE_MASK,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.mode & S_ISVTX != 0
    }
}

impl From<&Metadata> for Attributes {
    fn from(meta: &Metadata) -> Self {
        Self {
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
        }
    }
}

/// Result of a stat-style query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Content length for regular files, 0 for directories
    pub size: u64,
    /// Number of directory entries naming the object
    pub nlink: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == ObjectKind::Regular
    }
}

/// Kind-specific state of a directory.
#[derive(Debug)]
pub struct Directory {
    /// Non-owning back-reference; the root points at itself
    parent: ObjectId,
    entries: RwLock<HashMap<String, ObjectId>>,
}

impl Directory {
    pub(crate) fn new(parent: ObjectId) -> Self {
        Self {
            parent,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn with_entries(parent: ObjectId, entries: HashMap<String, ObjectId>) -> Self {
        Self {
            parent,
            entries: RwLock::new(entries),
        }
    }

    pub fn parent(&self) -> ObjectId {
        self.parent
    }

    /// Number of stored entries; `.` and `..` are never stored
    pub fn len(&self) -> usize {
        sync::read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<ObjectId> {
        sync::read(&self.entries).get(name).copied()
    }

    /// Entry names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = sync::read(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }

    /// (name, id) pairs in name order
    pub fn entries(&self) -> Vec<(String, ObjectId)> {
        let mut entries: Vec<(String, ObjectId)> = sync::read(&self.entries)
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        entries.sort();
        entries
    }

    /// The lock guarding the entry mapping. Lookup, insert and remove on one
    /// directory serialize on it.
    pub(crate) fn entry_lock(&self) -> &RwLock<HashMap<String, ObjectId>> {
        &self.entries
    }
}

#[derive(Debug)]
pub(crate) enum InodeData {
    Regular(RwLock<Vec<u8>>),
    Directory(Directory),
}

/// A file or directory. Shared between the object table and open handles.
#[derive(Debug)]
pub struct Inode {
    id: ObjectId,
    attrs: RwLock<Attributes>,
    data: InodeData,
}

impl Inode {
    pub(crate) fn new_file(id: ObjectId, attrs: Attributes, content: Vec<u8>) -> Self {
        Self {
            id,
            attrs: RwLock::new(attrs),
            data: InodeData::Regular(RwLock::new(content)),
        }
    }

    pub(crate) fn new_directory(id: ObjectId, attrs: Attributes, dir: Directory) -> Self {
        Self {
            id,
            attrs: RwLock::new(attrs),
            data: InodeData::Directory(dir),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        match self.data {
            InodeData::Regular(_) => ObjectKind::Regular,
            InodeData::Directory(_) => ObjectKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == ObjectKind::Directory
    }

    pub fn as_dir(&self) -> Option<&Directory> {
        match &self.data {
            InodeData::Directory(dir) => Some(dir),
            InodeData::Regular(_) => None,
        }
    }

    pub fn attributes(&self) -> Attributes {
        sync::read(&self.attrs).clone()
    }

    /// Current content length; directories report 0
    pub fn size(&self) -> u64 {
        match &self.data {
            InodeData::Regular(content) => sync::read(content).len() as u64,
            InodeData::Directory(_) => 0,
        }
    }

    /// Copy of the full content of a regular file
    pub fn content(&self) -> Option<Vec<u8>> {
        match &self.data {
            InodeData::Regular(content) => Some(sync::read(content).clone()),
            InodeData::Directory(_) => None,
        }
    }

    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let InodeData::Regular(content) = &self.data else {
            return 0;
        };
        let content = sync::read(content);
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= content.len() {
            return 0;
        }
        let n = buf.len().min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        n
    }

    /// Write at `offset`, zero-filling any gap past the current end.
    /// The caller bounds `offset + data.len()` by the file size limit.
    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let InodeData::Regular(content) = &self.data else {
            return Ok(0);
        };
        if data.is_empty() {
            return Ok(0);
        }
        let start = usize::try_from(offset).map_err(|_| VfsError::FileTooLarge)?;
        let end = start.checked_add(data.len()).ok_or(VfsError::FileTooLarge)?;
        {
            let mut content = sync::write(content);
            if content.len() < end {
                content.resize(end, 0);
            }
            content[start..end].copy_from_slice(data);
        }
        self.touch_modified();
        Ok(data.len())
    }

    /// Cut or zero-extend to `len` bytes
    pub(crate) fn truncate(&self, len: usize) {
        if let InodeData::Regular(content) = &self.data {
            sync::write(content).resize(len, 0);
            self.touch_modified();
        }
    }

    pub(crate) fn set_mode(&self, mode: u32) {
        let mut attrs = sync::write(&self.attrs);
        attrs.mode = mode & MODE_MASK;
        attrs.ctime = now_nanos();
    }

    /// Content or entry mapping changed
    pub(crate) fn touch_modified(&self) {
        let now = now_nanos();
        let mut attrs = sync::write(&self.attrs);
        attrs.mtime = now;
        attrs.ctime = now;
    }

    /// Only the inode changed (e.g. link count)
    pub(crate) fn touch_changed(&self) {
        sync::write(&self.attrs).ctime = now_nanos();
    }

    pub(crate) fn touch_accessed(&self) {
        sync::write(&self.attrs).atime = now_nanos();
    }
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(content: &[u8]) -> Inode {
        Inode::new_file(
            ObjectId::new(1, 0),
            Attributes::new(0o644, 1000, 1000),
            content.to_vec(),
        )
    }

    #[test]
    fn test_object_id_ino_packs_generation() {
        let id = ObjectId::new(7, 3);
        assert_eq!(id.ino(), (3u64 << 32) | 7);
        assert_eq!(id.to_string(), "7.3");
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let inode = file(b"ab");
        assert_eq!(inode.write_at(4, b"cd").unwrap(), 2);
        assert_eq!(inode.content().unwrap(), b"ab\0\0cd");
        assert_eq!(inode.size(), 6);
    }

    #[test]
    fn test_write_end_overflow_is_an_error() {
        let inode = file(b"ab");
        assert_eq!(inode.write_at(u64::MAX, b"x").unwrap_err(), VfsError::FileTooLarge);
        assert_eq!(inode.write_at(u64::MAX, b"").unwrap(), 0);
        assert_eq!(inode.content().unwrap(), b"ab");
    }

    #[test]
    fn test_read_at_clamps() {
        let inode = file(b"hello");
        let mut buf = [0u8; 8];
        assert_eq!(inode.read_at(3, &mut buf), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(inode.read_at(10, &mut buf), 0);
    }

    #[test]
    fn test_truncate_and_mode() {
        let inode = file(b"hello");
        inode.truncate(2);
        assert_eq!(inode.content().unwrap(), b"he");
        inode.set_mode(0o10644);
        assert_eq!(inode.attributes().mode, 0o644);
    }

    #[test]
    fn test_directory_never_reports_content() {
        let id = ObjectId::new(0, 0);
        let dir = Inode::new_directory(id, Attributes::new(0o755, 0, 0), Directory::new(id));
        assert!(dir.is_dir());
        assert!(dir.content().is_none());
        assert_eq!(dir.size(), 0);
        assert!(dir.as_dir().unwrap().is_empty());
    }
}
