use super::compression::CompressionMethod;
use crate::error::{Result, VfsError};

/// Per-subfile flags
///
/// Bit values match the linear-index on-disk flags so that format can store
/// them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubfileFlags(u16);

impl SubfileFlags {
    pub const COMPRESSED: SubfileFlags = SubfileFlags(0x0008);
    pub const ENCRYPTED: SubfileFlags = SubfileFlags(0x0010);
    pub const SIGNATURE: SubfileFlags = SubfileFlags(0x0020);
    pub const TEXT: SubfileFlags = SubfileFlags(0x0040);

    const ALL: u16 = 0x0078;

    pub fn empty() -> Self {
        SubfileFlags(0)
    }

    /// Keep only the bits this type knows about
    pub fn from_bits_truncate(bits: u16) -> Self {
        SubfileFlags(bits & Self::ALL)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, other: SubfileFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: SubfileFlags, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for SubfileFlags {
    type Output = SubfileFlags;

    fn bitor(self, rhs: SubfileFlags) -> SubfileFlags {
        SubfileFlags(self.0 | rhs.0)
    }
}

/// One named subfile inside an archive container
#[derive(Debug, Clone)]
pub struct SubfileRecord {
    /// Standardized name: posix separators, no leading `/` or `./`
    pub name: String,
    /// Offset of the index record (linear) or local header (ZIP); 0 if not yet indexed
    pub index_start: u64,
    pub index_length: u64,
    /// Absolute offset of the stored payload; 0 until a ZIP local header is parsed
    pub data_start: u64,
    /// Stored payload length (after compression and encryption)
    pub data_length: u64,
    pub uncompressed_length: u64,
    /// CRC-32 of the uncompressed bytes, when the format records one
    pub checksum: Option<u32>,
    /// Seconds since the UNIX epoch; 0 when not recorded
    pub timestamp: u64,
    pub flags: SubfileFlags,
    pub method: CompressionMethod,
    /// Write-time hint only, never persisted
    pub compression_level: u32,
    /// ZIP general-purpose bits as found on disk
    pub(crate) zip_flags: u16,
    /// ZIP method code as found on disk
    pub(crate) zip_method: u16,
    /// The on-disk index already describes this record
    pub(crate) indexed: bool,
}

impl SubfileRecord {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            index_start: 0,
            index_length: 0,
            data_start: 0,
            data_length: 0,
            uncompressed_length: 0,
            checksum: None,
            timestamp: 0,
            flags: SubfileFlags::empty(),
            method: CompressionMethod::Stored,
            compression_level: 0,
            zip_flags: 0,
            zip_method: 0,
            indexed: false,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(SubfileFlags::COMPRESSED)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(SubfileFlags::ENCRYPTED)
    }

    pub fn is_signature(&self) -> bool {
        self.flags.contains(SubfileFlags::SIGNATURE)
    }

    pub fn is_text(&self) -> bool {
        self.flags.contains(SubfileFlags::TEXT)
    }
}

/// Write-time options for a new subfile
#[derive(Debug, Clone, Default)]
pub struct SubfileOptions {
    /// 0 stores the payload; 1-9 compress with the format's default method
    pub compression_level: u32,
    /// Override the format's default compression method
    pub method: Option<CompressionMethod>,
    pub text: bool,
    /// Explicit timestamp; defaults to now when timestamps are recorded
    pub timestamp: Option<u64>,
}

impl SubfileOptions {
    pub fn level(compression_level: u32) -> Self {
        Self {
            compression_level,
            ..Self::default()
        }
    }
}

/// Standardize a subfile name
///
/// Collapses duplicate separators and `.` components and resolves `..`.
/// Names that are empty or climb above the archive root are rejected.
pub fn standardize_name(name: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(VfsError::InvalidPath(format!(
                        "{} escapes the archive root",
                        name
                    )));
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(VfsError::InvalidPath(format!("empty subfile name: {:?}", name)));
    }
    Ok(parts.join("/"))
}
