use super::codepage;
use super::{FLAG_UTF8, TIMESTAMP_EXTRA_TAG, ZIP64_EXTRA_TAG, ZIP64_SENTINEL};
use crate::archive::wire::{read_bytes, read_u16, read_u32, read_u64, read_u8};
use crate::error::{Result, VfsError};
use std::io::{Read, Write};

/// Central directory record signature
pub const CENTRAL_ENTRY_SIGNATURE: u32 = 0x0201_4b50;

/// Fixed part of a central directory record
pub const CENTRAL_ENTRY_FIXED_SIZE: usize = 46;

/// Central directory record
///
/// One per subfile, all grouped at the end of the archive so the whole index
/// can be read without touching any payload.
///
/// Structure (46 bytes + name + extra + comment):
/// - Signature: 0x02014b50
/// - Version made by, version needed: uint16 each
/// - Flags, method, DOS time, DOS date: uint16 each
/// - CRC-32, compressed size, uncompressed size: uint32 each
/// - Name, extra, comment lengths: uint16 each
/// - Disk number start, internal attributes: uint16 each
/// - External attributes, local header offset: uint32 each
/// - Name, extra fields (ZIP64 0x0001, UNIX time 0x5455), comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralEntry {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub header_offset: u64,
    pub name: String,
    pub comment: Vec<u8>,
    /// Modification time from the 0x5455 extra field
    pub unix_time: Option<u32>,
}

impl CentralEntry {
    fn zip64_fields(&self) -> (bool, bool, bool) {
        (
            self.uncompressed_size >= ZIP64_SENTINEL as u64,
            self.compressed_size >= ZIP64_SENTINEL as u64,
            self.header_offset >= ZIP64_SENTINEL as u64,
        )
    }

    fn zip64_extra_len(&self) -> usize {
        let (uncompressed, compressed, offset) = self.zip64_fields();
        let count = [uncompressed, compressed, offset].iter().filter(|&&f| f).count();
        if count == 0 {
            0
        } else {
            4 + 8 * count
        }
    }

    fn extra_len(&self) -> usize {
        let timestamp = if self.unix_time.is_some() { 4 + 5 } else { 0 };
        self.zip64_extra_len() + timestamp
    }

    /// True if any field needed the ZIP64 extension
    pub fn needs_zip64(&self) -> bool {
        self.zip64_extra_len() != 0
    }

    /// Bytes this record occupies on disk
    pub fn size_on_disk(&self) -> usize {
        CENTRAL_ENTRY_FIXED_SIZE + self.name.len() + self.extra_len() + self.comment.len()
    }

    /// Write central directory record to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let (zip64_uncompressed, zip64_compressed, zip64_offset) = self.zip64_fields();
        let name = self.name.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| VfsError::InvalidPath(format!("name too long: {}", self.name)))?;
        let comment_len = u16::try_from(self.comment.len())
            .map_err(|_| VfsError::InvalidPath(format!("comment too long on {}", self.name)))?;
        let mut flags = self.flags;
        if !self.name.is_ascii() {
            flags |= FLAG_UTF8;
        }
        let clamp = |value: u64, zip64: bool| if zip64 { ZIP64_SENTINEL } else { value as u32 };

        writer.write_all(&CENTRAL_ENTRY_SIGNATURE.to_le_bytes())?;
        writer.write_all(&self.version_made_by.to_le_bytes())?;
        writer.write_all(&self.version_needed.to_le_bytes())?;
        writer.write_all(&flags.to_le_bytes())?;
        writer.write_all(&self.method.to_le_bytes())?;
        writer.write_all(&self.dos_time.to_le_bytes())?;
        writer.write_all(&self.dos_date.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&clamp(self.compressed_size, zip64_compressed).to_le_bytes())?;
        writer.write_all(&clamp(self.uncompressed_size, zip64_uncompressed).to_le_bytes())?;
        writer.write_all(&name_len.to_le_bytes())?;
        writer.write_all(&(self.extra_len() as u16).to_le_bytes())?;
        writer.write_all(&comment_len.to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?; // disk number start
        writer.write_all(&self.internal_attributes.to_le_bytes())?;
        writer.write_all(&self.external_attributes.to_le_bytes())?;
        writer.write_all(&clamp(self.header_offset, zip64_offset).to_le_bytes())?;
        writer.write_all(name)?;

        if self.needs_zip64() {
            writer.write_all(&ZIP64_EXTRA_TAG.to_le_bytes())?;
            writer.write_all(&((self.zip64_extra_len() - 4) as u16).to_le_bytes())?;
            if zip64_uncompressed {
                writer.write_all(&self.uncompressed_size.to_le_bytes())?;
            }
            if zip64_compressed {
                writer.write_all(&self.compressed_size.to_le_bytes())?;
            }
            if zip64_offset {
                writer.write_all(&self.header_offset.to_le_bytes())?;
            }
        }

        if let Some(unix_time) = self.unix_time {
            writer.write_all(&TIMESTAMP_EXTRA_TAG.to_le_bytes())?;
            writer.write_all(&5u16.to_le_bytes())?;
            writer.write_all(&[0x01])?; // modification time present
            writer.write_all(&unix_time.to_le_bytes())?;
        }

        writer.write_all(&self.comment)?;
        Ok(self.size_on_disk())
    }

    /// Read central directory record from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let signature = read_u32(&mut reader)?;
        if signature != CENTRAL_ENTRY_SIGNATURE {
            return Err(VfsError::CorruptIndex(format!(
                "invalid central directory signature {:08x}",
                signature
            )));
        }

        let version_made_by = read_u16(&mut reader)?;
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
        let comment_len = read_u16(&mut reader)? as usize;
        let _disk_start = read_u16(&mut reader)?;
        let internal_attributes = read_u16(&mut reader)?;
        let external_attributes = read_u32(&mut reader)?;
        let mut header_offset = read_u32(&mut reader)? as u64;
        let name_bytes = read_bytes(&mut reader, name_len)?;
        let extra = read_bytes(&mut reader, extra_len)?;
        let comment = read_bytes(&mut reader, comment_len)?;

        if let Some(mut field) = super::find_extra(&extra, ZIP64_EXTRA_TAG) {
            if uncompressed_size == ZIP64_SENTINEL as u64 {
                uncompressed_size = read_u64(&mut field)?;
            }
            if compressed_size == ZIP64_SENTINEL as u64 {
                compressed_size = read_u64(&mut field)?;
            }
            if header_offset == ZIP64_SENTINEL as u64 {
                header_offset = read_u64(&mut field)?;
            }
        }

        let mut unix_time = None;
        if let Some(mut field) = super::find_extra(&extra, TIMESTAMP_EXTRA_TAG) {
            let present = read_u8(&mut field)?;
            if present & 0x01 != 0 {
                unix_time = Some(read_u32(&mut field)?);
            }
        }

        Ok(Self {
            version_made_by,
            version_needed,
            flags,
            method,
            dos_time,
            dos_date,
            crc32,
            compressed_size,
            uncompressed_size,
            internal_attributes,
            external_attributes,
            header_offset,
            name: codepage::decode_name(&name_bytes, flags & FLAG_UTF8 != 0),
            comment,
            unix_time,
        })
    }
}
