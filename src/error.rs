use std::io;
use thiserror::Error;

/// Result type for layerfs operations
pub type Result<T> = std::result::Result<T, VfsError>;

/// Coarse classification of every [`VfsError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    /// Directory where a regular file was expected, or the reverse
    WrongType,
    IoFailure,
    /// Unparsable index, or checksum/signature mismatch
    CorruptIndex,
    NameCollision,
    /// Algorithm or operation not available in this build or on this backend
    Unsupported,
    /// Caller error: read-only target, wrong container state, bad path or config
    InvalidUsage,
}

/// Unified error type for all layerfs operations
#[derive(Debug, Error)]
pub enum VfsError {
    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Name collision: {0}")]
    NameCollision(String),

    // Archive errors
    #[error("Corrupt archive index: {0}")]
    CorruptIndex(String),

    #[error("Invalid magic number in archive header")]
    InvalidMagic,

    #[error("Unsupported archive version: {major}.{minor}")]
    UnsupportedVersion { major: i16, minor: i16 },

    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // Encryption errors
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed (wrong password or corrupted data)")]
    DecryptionFailed,

    #[error("Subfile is encrypted but no password was supplied")]
    MissingPassword,

    // Signature errors
    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("Invalid signature format")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    // Usage errors
    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Archive is not open for {0}")]
    InvalidState(&'static str),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(String),
}

impl VfsError {
    /// Map this error onto its taxonomy class
    pub fn kind(&self) -> ErrorKind {
        match self {
            VfsError::NotFound(_) => ErrorKind::NotFound,
            VfsError::IsDirectory(_) | VfsError::NotDirectory(_) => ErrorKind::WrongType,
            VfsError::NameCollision(_) => ErrorKind::NameCollision,
            VfsError::CorruptIndex(_)
            | VfsError::InvalidMagic
            | VfsError::CrcMismatch { .. }
            | VfsError::DecompressionFailed(_)
            | VfsError::DecryptionFailed
            | VfsError::SignatureVerificationFailed(_)
            | VfsError::InvalidSignature
            | VfsError::InvalidPublicKey
            | VfsError::JsonError(_) => ErrorKind::CorruptIndex,
            VfsError::UnsupportedVersion { .. } | VfsError::Unsupported(_) => {
                ErrorKind::Unsupported
            }
            VfsError::Io(err) if err.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            VfsError::Io(_) | VfsError::CompressionFailed(_) | VfsError::EncryptionFailed => {
                ErrorKind::IoFailure
            }
            VfsError::MissingPassword
            | VfsError::ReadOnly(_)
            | VfsError::InvalidState(_)
            | VfsError::InvalidPath(_)
            | VfsError::InvalidConfig(_)
            | VfsError::TomlError(_) => ErrorKind::InvalidUsage,
        }
    }

    /// True for the ordinary "path does not exist" outcome
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<toml::de::Error> for VfsError {
    fn from(err: toml::de::Error) -> Self {
        VfsError::TomlError(err.to_string())
    }
}

impl From<toml::ser::Error> for VfsError {
    fn from(err: toml::ser::Error) -> Self {
        VfsError::TomlError(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for VfsError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        VfsError::SignatureVerificationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_mapping() {
        assert_eq!(VfsError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(VfsError::IsDirectory("x".into()).kind(), ErrorKind::WrongType);
        assert_eq!(VfsError::InvalidMagic.kind(), ErrorKind::CorruptIndex);
        assert_eq!(
            VfsError::Unsupported("bf-cbc".into()).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            VfsError::Io(io::Error::new(io::ErrorKind::NotFound, "gone")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            VfsError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "short")).kind(),
            ErrorKind::IoFailure
        );
    }
}
