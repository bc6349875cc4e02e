//! # nsvfs-core
//!
//! In-memory namespace with POSIX removal semantics.
//!
//! Names live in directories; objects live in an arena-backed object
//! table with a link count (names) and an open count (handles). Removing
//! the last name of an object that is still open leaves it *orphaned*:
//! unreachable by path, fully usable through its handles, and reclaimed on
//! the last close.
//!
//! ## Layers
//!
//! - [`resolve`]: path resolution relative to the root or a handle
//! - [`perm`]: discretionary checks with explicit privilege overrides
//! - [`remove`]: the `unlink`/`rmdir` state machine
//! - [`table`]: reference counts and reclamation
//! - [`handle`]: the open-handle registry, walked by checkpointing
//! - [`task`]: syscall-shaped entry points over user memory

pub mod error;
pub mod handle;
pub mod object;
pub mod perm;
pub mod remove;
pub mod resolve;
pub mod restore;
mod sync;
pub mod table;
pub mod task;
pub mod vfs;

pub use error::{Result, VfsError};
pub use handle::{AccessMode, HandleId, HandleTable, OpenHandle};
pub use object::{Attributes, Directory, Inode, Metadata, ObjectId, ObjectKind, S_ISVTX};
pub use perm::{Access, Capability, CapabilitySet, Credentials, PrivilegeOverride};
pub use remove::RemoveFlags;
pub use resolve::{Base, ResolveFlags};
pub use restore::{ObjectContent, RestoreBuilder};
pub use table::{Disposition, ObjectTable, RefCounts, TableStats};
pub use task::{copy_in_path, MappedMemory, Task, UserMemory};
pub use vfs::{Frozen, OpenOptions, Vfs, VfsOptions};
