//! layerfs-rs: layered virtual file system over archives, host directories and memory
//!
//! This library provides:
//! - Thread-safe stream access ([`LockedStream`], [`WindowedStream`])
//! - Archive containers in two on-disk formats: a legacy linear index with
//!   scale-factor offsets, and a ZIP-compatible layout with ZIP64 support
//! - Per-subfile compression (deflate/zlib, Zstandard), AES-GCM encryption
//!   and Ed25519 archive signatures
//! - Mount backends for host directories, archives, in-memory trees and
//!   read-only asset bundles
//! - A [`MountTable`] resolving virtual paths with mount precedence and
//!   composite directories
//!
//! # Example
//!
//! ```no_run
//! use layerfs_rs::{ArchiveContainer, ArchiveFormat, MountFlags, MountTable};
//!
//! // Build an archive
//! let mut archive = ArchiveContainer::open_write("models.mf", ArchiveFormat::Zip)?;
//! archive.add_subfile("box.egg", b"<Group> box { }", 6)?;
//! archive.close()?;
//!
//! // Mount it and read through the virtual file system
//! let table = MountTable::new();
//! table.mount_path("models.mf", "/models", MountFlags::empty(), None)?;
//! let data = table.read_file("/models/box.egg")?;
//! # Ok::<(), layerfs_rs::VfsError>(())
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod mount;
pub mod path;
pub mod stream;
pub mod table;

pub use archive::{
    ArchiveContainer, ArchiveFormat, ArchiveSigner, CompressionMethod, ContainerState,
    Ed25519Signer, EncryptionParams, SignatureCheck, SignatureStatus, SubfileOptions,
    VerifyReport,
};
pub use config::{MountDescriptor, MountOptions, VfsConfig};
pub use error::{ErrorKind, Result, VfsError};
pub use mount::{
    ArchiveBackend, AssetBundleBackend, AssetStore, BackendKind, CasOutcome, MemoryTree,
    MountBackend, MountFlags, NativeBackend, StaticAssets,
};
pub use stream::{LockedStream, Ownership, WindowedStream};
pub use table::{Mount, MountTable, VirtualFile};
