//! Mount backends
//!
//! A backend answers existence and content queries for the subtree mounted
//! under one mount point. Paths handed to a backend are local to it: relative,
//! `/`-separated, with `""` naming the backend's own root.

mod archive;
mod asset;
mod memory;
mod native;

pub use archive::ArchiveBackend;
pub use asset::{Asset, AssetBundleBackend, AssetStore, StaticAssets};
pub use memory::MemoryTree;
pub use native::NativeBackend;

use crate::error::{Result, VfsError};
use std::fmt::Debug;
use std::io::Read;
use std::path::Path;

/// Which variant a backend is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    Archive,
    Memory,
    AssetBundle,
}

/// Per-mount flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountFlags(u32);

impl MountFlags {
    /// Writes are never routed to this mount
    pub const READ_ONLY: MountFlags = MountFlags(0x0001);

    pub fn empty() -> Self {
        MountFlags(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: MountFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MountFlags {
    type Output = MountFlags;

    fn bitor(self, rhs: MountFlags) -> MountFlags {
        MountFlags(self.0 | rhs.0)
    }
}

/// Result of a compare-and-swap on a whole file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasOutcome {
    /// The contents matched and were replaced
    pub swapped: bool,
    /// Contents before the operation
    pub previous: Vec<u8>,
}

fn unsupported(kind: BackendKind, operation: &str) -> VfsError {
    VfsError::Unsupported(format!("{} on a {:?} mount", operation, kind))
}

/// Capability set shared by every mount variant
pub trait MountBackend: Send + Sync + Debug {
    fn kind(&self) -> BackendKind;

    /// Host file or directory behind this mount, if it has one
    fn physical_path(&self) -> Option<&Path> {
        None
    }

    fn exists(&self, path: &str) -> bool;

    fn is_directory(&self, path: &str) -> bool;

    fn is_regular_file(&self, path: &str) -> bool;

    fn open_for_read(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open_for_read(path)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Length in bytes
    fn size(&self, path: &str) -> Result<u64>;

    /// Length of a file the caller already has open
    ///
    /// Backends that can answer from the open stream override this.
    fn size_of_open(&self, path: &str, _stream: &mut (dyn Read + Send)) -> Result<u64> {
        self.size(path)
    }

    /// Modification time in seconds since the UNIX epoch; 0 when unknown
    fn timestamp(&self, path: &str) -> Result<u64>;

    /// Names of the immediate children of a directory, sorted
    fn list_children(&self, path: &str) -> Result<Vec<String>>;

    fn is_writable(&self) -> bool {
        false
    }

    fn write_file(&self, _path: &str, _data: &[u8]) -> Result<()> {
        Err(unsupported(self.kind(), "write_file"))
    }

    fn make_directory(&self, _path: &str) -> Result<()> {
        Err(unsupported(self.kind(), "make_directory"))
    }

    fn delete_file(&self, _path: &str) -> Result<()> {
        Err(unsupported(self.kind(), "delete_file"))
    }

    fn rename_file(&self, _from: &str, _to: &str) -> Result<()> {
        Err(unsupported(self.kind(), "rename_file"))
    }

    /// Replace the contents with `new` only if they currently equal `expected`
    fn atomic_compare_and_exchange_contents(
        &self,
        _path: &str,
        _expected: &[u8],
        _new: &[u8],
    ) -> Result<CasOutcome> {
        Err(unsupported(self.kind(), "atomic_compare_and_exchange_contents"))
    }

    /// Whole contents, read without interleaving with a concurrent swap
    ///
    /// A read-only backend has no swaps to race with, so a plain read will do.
    fn atomic_read_contents(&self, path: &str) -> Result<Vec<u8>> {
        if self.is_writable() {
            return Err(unsupported(self.kind(), "atomic_read_contents"));
        }
        self.read_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_flags() {
        let flags = MountFlags::empty() | MountFlags::READ_ONLY;
        assert!(flags.contains(MountFlags::READ_ONLY));
        assert!(!MountFlags::empty().contains(MountFlags::READ_ONLY));
    }

    #[test]
    fn test_default_write_side_is_unsupported() {
        let assets = AssetBundleBackend::new(StaticAssets::new());
        assert!(!assets.is_writable());
        let err = assets.write_file("x", b"1").unwrap_err();
        assert!(matches!(err, VfsError::Unsupported(_)));
        assert!(err.to_string().contains("AssetBundle"));
        assert!(assets.physical_path().is_none());
    }

    #[test]
    fn test_read_only_defaults() {
        let assets = AssetBundleBackend::new(StaticAssets::new().with_file("a.txt", b"abc"));
        assert_eq!(assets.atomic_read_contents("a.txt").unwrap(), b"abc");
        let mut stream = assets.open_for_read("a.txt").unwrap();
        assert_eq!(assets.size_of_open("a.txt", stream.as_mut()).unwrap(), 3);
    }
}
