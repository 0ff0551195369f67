use crate::archive::subfile::SubfileFlags;
use crate::archive::wire::{read_bytes, read_u16, read_u32};
use crate::error::{Result, VfsError};
use std::io::{Read, Write};

/// Entry is a tombstone; its space is reclaimed by the next repack
pub const ENTRY_FLAG_DELETED: u16 = 0x0001;
/// Index record could not be trusted when it was written
pub const ENTRY_FLAG_INDEX_INVALID: u16 = 0x0002;
/// Payload could not be trusted when it was written
pub const ENTRY_FLAG_DATA_INVALID: u16 = 0x0004;

/// Offset of the flags field inside an entry
pub const FLAGS_OFFSET: u64 = 12;

/// Linear index entry
///
/// Entries form a singly linked chain starting right after the header. A
/// `next` of zero terminates the chain, so the terminator is a lone 4-byte
/// zero word.
///
/// Structure (20 bytes + optional 4 + name):
/// - Next entry: uint32, in scale-factor units
/// - Data start: uint32, in scale-factor units
/// - Data length: uint32
/// - Flags: uint16
/// - Uncompressed length: uint32 (present only when compressed or encrypted)
/// - Timestamp: uint32
/// - Name length: uint16
/// - Name: each byte XOR 0xFF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub next: u32,
    pub data_start: u32,
    pub data_length: u32,
    pub flags: u16,
    pub uncompressed_length: Option<u32>,
    pub timestamp: u32,
    pub name: String,
}

fn carries_uncompressed_length(flags: u16) -> bool {
    flags & (SubfileFlags::COMPRESSED.bits() | SubfileFlags::ENCRYPTED.bits()) != 0
}

fn obfuscate(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b ^ 0xFF).collect()
}

impl IndexEntry {
    /// The empty deleted entry that heads a chain
    pub fn anchor() -> Self {
        Self {
            next: 0,
            data_start: 0,
            data_length: 0,
            flags: ENTRY_FLAG_DELETED,
            uncompressed_length: None,
            timestamp: 0,
            name: String::new(),
        }
    }

    pub fn is_anchor(&self) -> bool {
        self.flags & ENTRY_FLAG_DELETED != 0 && self.name.is_empty() && self.data_length == 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & ENTRY_FLAG_DELETED != 0
    }

    pub fn is_invalid(&self) -> bool {
        self.flags & (ENTRY_FLAG_INDEX_INVALID | ENTRY_FLAG_DATA_INVALID) != 0
    }

    /// Bytes this entry occupies on disk
    pub fn size_on_disk(&self) -> usize {
        let extra = if carries_uncompressed_length(self.flags) { 4 } else { 0 };
        4 + 4 + 4 + 2 + extra + 4 + 2 + self.name.len()
    }

    /// Write index entry to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let name_len = u16::try_from(self.name.len())
            .map_err(|_| VfsError::InvalidPath(format!("name too long: {}", self.name)))?;

        writer.write_all(&self.next.to_le_bytes())?;
        writer.write_all(&self.data_start.to_le_bytes())?;
        writer.write_all(&self.data_length.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        if carries_uncompressed_length(self.flags) {
            let length = self.uncompressed_length.unwrap_or(self.data_length);
            writer.write_all(&length.to_le_bytes())?;
        }
        writer.write_all(&self.timestamp.to_le_bytes())?;
        writer.write_all(&name_len.to_le_bytes())?;
        writer.write_all(&obfuscate(self.name.as_bytes()))?;

        Ok(self.size_on_disk())
    }

    /// Read one entry; `None` at the chain terminator
    pub fn read_from<R: Read>(mut reader: R) -> Result<Option<Self>> {
        let next = read_u32(&mut reader)?;
        if next == 0 {
            return Ok(None);
        }

        let data_start = read_u32(&mut reader)?;
        let data_length = read_u32(&mut reader)?;
        let flags = read_u16(&mut reader)?;
        let uncompressed_length = if carries_uncompressed_length(flags) {
            Some(read_u32(&mut reader)?)
        } else {
            None
        };
        let timestamp = read_u32(&mut reader)?;
        let name_len = read_u16(&mut reader)? as usize;
        let name = obfuscate(&read_bytes(&mut reader, name_len)?);

        Ok(Some(Self {
            next,
            data_start,
            data_length,
            flags,
            uncompressed_length,
            timestamp,
            name: String::from_utf8_lossy(&name).into_owned(),
        }))
    }
}
