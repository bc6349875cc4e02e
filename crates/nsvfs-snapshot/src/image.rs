//! Checkpoint image of a whole filesystem.
//!
//! ```text
//! +------------------+
//! | Header (52B)     |  Magic, version, body length, BLAKE3 of body
//! +------------------+
//! | Body (bincode)   |  VfsImage
//! +------------------+
//! ```

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use nsvfs_config::{log_snapshot_debug, log_snapshot_info, log_snapshot_warn, SnapshotConfig};
use nsvfs_core::{
    AccessMode, Attributes, Frozen, HandleId, ObjectContent, ObjectId, Vfs, VfsOptions,
    RestoreBuilder,
};
use serde::{Deserialize, Serialize};

use crate::adapter::{enumerate_orphaned, restore_orphaned, OrphanRecord};
use crate::{Result, SnapshotError};

/// Magic bytes for image identification
const IMAGE_MAGIC: &[u8; 8] = b"NSVFSIMG";
/// Current image format version
const IMAGE_VERSION: u32 = 1;
/// Encoded size of [`ImageHeader`]
const HEADER_LEN: usize = 8 + 4 + 8 + 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageHeader {
    magic: [u8; 8],
    version: u32,
    body_len: u64,
    checksum: [u8; 32],
}

impl ImageHeader {
    fn new(body: &[u8]) -> Self {
        Self {
            magic: *IMAGE_MAGIC,
            version: IMAGE_VERSION,
            body_len: body.len() as u64,
            checksum: *blake3::hash(body).as_bytes(),
        }
    }

    fn validate(&self) -> Result<()> {
        if &self.magic != IMAGE_MAGIC {
            return Err(SnapshotError::Invalid("Bad magic bytes".to_string()));
        }
        if self.version != IMAGE_VERSION {
            return Err(SnapshotError::Invalid(format!(
                "Unsupported version: {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// Capture policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Capture unlinked-but-open objects. Backends that cannot reopen
    /// deleted files run with this off and refuse to checkpoint them.
    pub save_orphans: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self { save_orphans: true }
    }
}

impl From<&SnapshotConfig> for SnapshotOptions {
    fn from(config: &SnapshotConfig) -> Self {
        Self {
            save_orphans: config.save_orphans,
        }
    }
}

/// A namespace object reached from the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub attributes: Attributes,
    pub content: ObjectContent,
}

/// An open handle and the object it refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub handle: HandleId,
    pub object: ObjectId,
    pub access: AccessMode,
    pub offset: u64,
}

/// Counts shown by `nsvfs inspect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSummary {
    pub objects: usize,
    pub orphans: usize,
    pub handles: usize,
    pub content_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsImage {
    pub root: ObjectId,
    pub objects: Vec<ObjectRecord>,
    pub orphans: Vec<OrphanRecord>,
    pub handles: Vec<HandleRecord>,
}

impl VfsImage {
    /// Capture the filesystem at a quiescence point
    pub fn capture(frozen: &Frozen<'_>, options: &SnapshotOptions) -> Result<Self> {
        let vfs = frozen.vfs();
        let orphans = enumerate_orphaned(frozen);
        if !orphans.is_empty() && !options.save_orphans {
            log_snapshot_warn!("Refusing to capture open unlinked objects", count = orphans.len());
            return Err(SnapshotError::OrphansUnsupported {
                count: orphans.len(),
            });
        }

        let objects = walk_namespace(vfs);
        let handles: Vec<HandleRecord> = vfs
            .handles()
            .snapshot()
            .iter()
            .map(|h| HandleRecord {
                handle: h.id(),
                object: h.object_id(),
                access: h.access(),
                offset: h.offset(),
            })
            .collect();

        log_snapshot_info!(
            "Image captured",
            objects = objects.len(),
            orphans = orphans.len(),
            handles = handles.len()
        );
        Ok(Self {
            root: vfs.root_id(),
            objects,
            orphans,
            handles,
        })
    }

    /// Rebuild a filesystem with the same object ids, handle ids and content
    pub fn restore(self, options: VfsOptions) -> Result<Vfs> {
        let builder = RestoreBuilder::new(options);
        for record in self.objects {
            builder.install(record.id, record.attributes, record.content)?;
        }
        let orphan_count = self.orphans.len();
        for orphan in self.orphans {
            restore_orphaned(&builder, orphan)?;
        }
        for h in &self.handles {
            builder.bind_handle(h.handle, h.object, h.access, h.offset)?;
        }
        let vfs = builder.finish(self.root)?;
        log_snapshot_info!(
            "Image restored",
            objects = vfs.objects().len(),
            orphans = orphan_count,
            handles = vfs.handles().len()
        );
        Ok(vfs)
    }

    pub fn summary(&self) -> ImageSummary {
        let content_bytes = self
            .objects
            .iter()
            .map(|r| &r.content)
            .chain(self.orphans.iter().map(|o| &o.content))
            .map(|c| match c {
                ObjectContent::Regular(bytes) => bytes.len() as u64,
                ObjectContent::Directory { .. } => 0,
            })
            .sum();
        ImageSummary {
            objects: self.objects.len(),
            orphans: self.orphans.len(),
            handles: self.handles.len(),
            content_bytes,
        }
    }

    /// Write the image to `path`, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = bincode::serialize(self)?;
        let header = ImageHeader::new(&body);

        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, &header)?;
        writer.write_all(&body)?;
        writer.flush()?;
        log_snapshot_debug!("Image saved", path = %path.display(), bytes = body.len() + HEADER_LEN);
        Ok(())
    }

    /// Read and verify an image written by [`VfsImage::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::Invalid("File too small".to_string()));
        }

        let header: ImageHeader = bincode::deserialize(&bytes[..HEADER_LEN])?;
        header.validate()?;
        let body = &bytes[HEADER_LEN..];
        if body.len() as u64 != header.body_len {
            return Err(SnapshotError::Invalid(format!(
                "Body length {} does not match header {}",
                body.len(),
                header.body_len
            )));
        }
        if blake3::hash(body).as_bytes() != &header.checksum {
            return Err(SnapshotError::ChecksumMismatch);
        }

        let image: VfsImage = bincode::deserialize(body)?;
        log_snapshot_debug!("Image loaded", path = %path.display(), objects = image.objects.len());
        Ok(image)
    }
}

/// Breadth-first walk of every object with a name
fn walk_namespace(vfs: &Vfs) -> Vec<ObjectRecord> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([vfs.root().clone()]);

    while let Some(inode) = queue.pop_front() {
        if !seen.insert(inode.id()) {
            continue;
        }
        if let Some(dir) = inode.as_dir() {
            for (_, child) in dir.entries() {
                if let Some(child) = vfs.objects().get(child) {
                    queue.push_back(child);
                }
            }
        }
        records.push(ObjectRecord {
            id: inode.id(),
            attributes: inode.attributes(),
            content: ObjectContent::of(&inode),
        });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_len_matches_encoding() {
        let header = ImageHeader::new(b"body");
        assert_eq!(bincode::serialize(&header).unwrap().len(), HEADER_LEN);
    }

    #[test]
    fn test_header_rejects_bad_magic_and_version() {
        let mut header = ImageHeader::new(b"");
        header.magic = *b"NOTANIMG";
        assert!(matches!(header.validate(), Err(SnapshotError::Invalid(_))));

        let mut header = ImageHeader::new(b"");
        header.version = 99;
        assert!(matches!(header.validate(), Err(SnapshotError::Invalid(_))));
    }

    #[test]
    fn test_options_from_config() {
        let config = SnapshotConfig {
            save_orphans: false,
            ..SnapshotConfig::default()
        };
        assert!(!SnapshotOptions::from(&config).save_orphans);
        assert!(SnapshotOptions::default().save_orphans);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/fs.img");
        let vfs = Vfs::new(VfsOptions::default());
        let image = VfsImage::capture(&vfs.freeze(), &SnapshotOptions::default()).unwrap();
        image.save(&path).unwrap();

        let loaded = VfsImage::load(&path).unwrap();
        assert_eq!(loaded, image);
        assert_eq!(loaded.summary().objects, 1);
        assert_eq!(loaded.summary().handles, 0);
    }
}
