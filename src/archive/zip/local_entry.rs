use super::codepage;
use super::{FLAG_UTF8, ZIP64_EXTRA_TAG, ZIP64_SENTINEL};
use crate::archive::wire::{read_bytes, read_u16, read_u32, read_u64};
use crate::error::{Result, VfsError};
use std::io::{Read, Write};

/// Local file header signature
pub const LOCAL_ENTRY_SIGNATURE: u32 = 0x0403_4b50;

/// Optional data descriptor signature
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

/// Fixed part of a local file header
pub const LOCAL_ENTRY_FIXED_SIZE: usize = 30;

/// Local file header
///
/// Precedes each subfile's payload, enabling sequential streaming reads
/// without consulting the central directory.
///
/// Structure (30 bytes + name + extra):
/// - Signature: 0x04034b50 (4 bytes)
/// - Version needed: uint16
/// - General-purpose flags: uint16
/// - Compression method: uint16
/// - DOS time, DOS date: uint16 each
/// - CRC-32: uint32
/// - Compressed size, uncompressed size: uint32 each (0xFFFFFFFF => ZIP64 extra)
/// - Name length, extra length: uint16 each
/// - Name, extra field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntryHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub name: String,
}

impl LocalEntryHeader {
    fn needs_zip64(&self) -> bool {
        self.compressed_size >= ZIP64_SENTINEL as u64
            || self.uncompressed_size >= ZIP64_SENTINEL as u64
    }

    fn name_bytes(&self) -> &[u8] {
        // Non-ASCII names are always written with the UTF-8 flag
        self.name.as_bytes()
    }

    /// Bytes this header occupies on disk
    pub fn size_on_disk(&self) -> usize {
        let extra = if self.needs_zip64() { 4 + 16 } else { 0 };
        LOCAL_ENTRY_FIXED_SIZE + self.name_bytes().len() + extra
    }

    /// Write local entry header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let zip64 = self.needs_zip64();
        let name = self.name_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| VfsError::InvalidPath(format!("name too long: {}", self.name)))?;
        let mut flags = self.flags;
        if !self.name.is_ascii() {
            flags |= FLAG_UTF8;
        }

        writer.write_all(&LOCAL_ENTRY_SIGNATURE.to_le_bytes())?;
        writer.write_all(&self.version_needed.to_le_bytes())?;
        writer.write_all(&flags.to_le_bytes())?;
        writer.write_all(&self.method.to_le_bytes())?;
        writer.write_all(&self.dos_time.to_le_bytes())?;
        writer.write_all(&self.dos_date.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        if zip64 {
            writer.write_all(&ZIP64_SENTINEL.to_le_bytes())?;
            writer.write_all(&ZIP64_SENTINEL.to_le_bytes())?;
        } else {
            writer.write_all(&(self.compressed_size as u32).to_le_bytes())?;
            writer.write_all(&(self.uncompressed_size as u32).to_le_bytes())?;
        }
        writer.write_all(&name_len.to_le_bytes())?;
        let extra_len: u16 = if zip64 { 20 } else { 0 };
        writer.write_all(&extra_len.to_le_bytes())?;
        writer.write_all(name)?;

        if zip64 {
            writer.write_all(&ZIP64_EXTRA_TAG.to_le_bytes())?;
            writer.write_all(&16u16.to_le_bytes())?;
            writer.write_all(&self.uncompressed_size.to_le_bytes())?;
            writer.write_all(&self.compressed_size.to_le_bytes())?;
        }

        Ok(self.size_on_disk())
    }

    /// Read a local entry header; returns the header and its on-disk size
    pub fn read_from<R: Read>(mut reader: R) -> Result<(Self, usize)> {
        let signature = read_u32(&mut reader)?;
        if signature != LOCAL_ENTRY_SIGNATURE {
            return Err(VfsError::CorruptIndex(format!(
                "invalid local header signature {:08x}",
                signature
            )));
        }

        let version_needed = read_u16(&mut reader)?;
        let flags = read_u16(&mut reader)?;
        let method = read_u16(&mut reader)?;
        let dos_time = read_u16(&mut reader)?;
        let dos_date = read_u16(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let mut compressed_size = read_u32(&mut reader)? as u64;
        let mut uncompressed_size = read_u32(&mut reader)? as u64;
        let name_len = read_u16(&mut reader)? as usize;
        let extra_len = read_u16(&mut reader)? as usize;
        let name_bytes = read_bytes(&mut reader, name_len)?;
        let extra = read_bytes(&mut reader, extra_len)?;

        if let Some(field) = super::find_extra(&extra, ZIP64_EXTRA_TAG) {
            let mut field = field;
            if uncompressed_size == ZIP64_SENTINEL as u64 {
                uncompressed_size = read_u64(&mut field)?;
            }
            if compressed_size == ZIP64_SENTINEL as u64 {
                compressed_size = read_u64(&mut field)?;
            }
        }

        let header = Self {
            version_needed,
            flags,
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size,
            uncompressed_size,
            name: codepage::decode_name(&name_bytes, flags & FLAG_UTF8 != 0),
        };
        Ok((header, LOCAL_ENTRY_FIXED_SIZE + name_len + extra_len))
    }
}
