//! Open handles and the registry of live handles.
//!
//! The registry doubles as the second root set for checkpointing: objects
//! with no name are only discoverable by walking it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::object::{Inode, ObjectId};
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (_, false) => AccessMode::ReadOnly,
            (false, true) => AccessMode::WriteOnly,
            (true, true) => AccessMode::ReadWrite,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// A live reference to one object, independent of the name used to open it.
#[derive(Debug)]
pub struct OpenHandle {
    id: HandleId,
    inode: Arc<Inode>,
    access: AccessMode,
    offset: Mutex<u64>,
}

impl OpenHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn object_id(&self) -> ObjectId {
        self.inode.id()
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn offset(&self) -> u64 {
        *sync::lock(&self.offset)
    }

    pub(crate) fn set_offset(&self, offset: u64) {
        *sync::lock(&self.offset) = offset;
    }

    /// Run `f` with the offset locked, storing the value it returns.
    pub(crate) fn advance<T>(&self, f: impl FnOnce(u64) -> (u64, T)) -> T {
        let mut offset = sync::lock(&self.offset);
        let (next, out) = f(*offset);
        *offset = next;
        out
    }
}

/// Registry of every live handle
pub struct HandleTable {
    handles: DashMap<HandleId, Arc<OpenHandle>>,
    next: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn insert(&self, inode: Arc<Inode>, access: AccessMode) -> Arc<OpenHandle> {
        let id = HandleId(self.next.fetch_add(1, Ordering::Relaxed));
        self.insert_with_id(id, inode, access, 0)
    }

    /// Register a handle under a known id (checkpoint restore)
    pub(crate) fn insert_with_id(
        &self,
        id: HandleId,
        inode: Arc<Inode>,
        access: AccessMode,
        offset: u64,
    ) -> Arc<OpenHandle> {
        self.next.fetch_max(id.0 + 1, Ordering::Relaxed);
        let handle = Arc::new(OpenHandle {
            id,
            inode,
            access,
            offset: Mutex::new(offset),
        });
        self.handles.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: HandleId) -> Option<Arc<OpenHandle>> {
        self.handles.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, id: HandleId) -> Option<Arc<OpenHandle>> {
        self.handles.remove(&id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.handles.contains_key(&id)
    }

    /// All live handles ordered by id
    pub fn snapshot(&self) -> Vec<Arc<OpenHandle>> {
        let mut handles: Vec<Arc<OpenHandle>> =
            self.handles.iter().map(|entry| entry.value().clone()).collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
