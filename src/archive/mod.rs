//! Archive containers
//!
//! An [`ArchiveContainer`] stores named subfiles in one of two on-disk
//! layouts: the ZIP-compatible format (central directory at the end, ZIP64
//! when needed) or the legacy linear-index format. Subfiles may be
//! compressed, encrypted, or both; signatures are stored as ordinary
//! subfiles under `META-INF/`.

pub mod compression;
mod container;
pub mod encryption;
pub mod linear;
pub mod signature;
mod subfile;
pub(crate) mod wire;
pub mod zip;

pub use compression::{CompressionMethod, DEFAULT_COMPRESSION_LEVEL};
pub use container::{
    ArchiveContainer, ArchiveFormat, ContainerState, VerifyFailure, VerifyReport,
};
pub use encryption::EncryptionParams;
pub use signature::{
    ArchiveSigner, Ed25519Signer, SignatureCheck, SignatureEntry, SignatureManifest,
    SignatureStatus, MANIFEST_NAME, SIGNATURE_PREFIX,
};
pub use subfile::{standardize_name, SubfileFlags, SubfileOptions, SubfileRecord};
