use super::{ZIP64_COUNT_SENTINEL, ZIP64_SENTINEL};
use crate::archive::wire::{read_bytes, read_u16, read_u32, read_u64};
use crate::error::{Result, VfsError};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// End of central directory signature
pub const END_RECORD_SIGNATURE: u32 = 0x0605_4b50;

/// ZIP64 end of central directory signature
pub const ZIP64_END_RECORD_SIGNATURE: u32 = 0x0606_4b50;

/// ZIP64 end of central directory locator signature
pub const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;

/// Classic end record size without its comment
pub const END_RECORD_SIZE: usize = 22;

pub const ZIP64_END_RECORD_SIZE: usize = 56;

pub const ZIP64_LOCATOR_SIZE: usize = 20;

/// Longest trailing comment a classic end record can describe
pub const MAX_COMMENT_LENGTH: usize = 0xFFFF;

/// End of central directory (EOCD)
///
/// Located at the very end of the archive, optionally followed only by its
/// comment. When a count, size or offset no longer fits the classic 16/32-bit
/// fields, a ZIP64 end record and locator are written first and the classic
/// fields hold sentinels.
///
/// Classic structure (22 bytes + comment):
/// - Signature: 0x06054b50
/// - Disk number, directory disk: uint16 each
/// - Entries on this disk, total entries: uint16 each
/// - Directory size, directory offset: uint32 each
/// - Comment length: uint16, comment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndRecord {
    pub entry_count: u64,
    pub directory_size: u64,
    pub directory_offset: u64,
    pub comment: Vec<u8>,
}

impl EndRecord {
    pub fn new(entry_count: u64, directory_size: u64, directory_offset: u64, comment: Vec<u8>) -> Self {
        Self {
            entry_count,
            directory_size,
            directory_offset,
            comment,
        }
    }

    /// True if the ZIP64 end record and locator must be written
    pub fn needs_zip64(&self) -> bool {
        self.entry_count >= ZIP64_COUNT_SENTINEL as u64
            || self.directory_size >= ZIP64_SENTINEL as u64
            || self.directory_offset >= ZIP64_SENTINEL as u64
    }

    /// Bytes written by [`EndRecord::write_to`]
    pub fn size_on_disk(&self) -> usize {
        let zip64 = if self.needs_zip64() {
            ZIP64_END_RECORD_SIZE + ZIP64_LOCATOR_SIZE
        } else {
            0
        };
        zip64 + END_RECORD_SIZE + self.comment.len()
    }

    /// Write the end record block, which will start at absolute `position`
    pub fn write_to<W: Write>(&self, mut writer: W, position: u64) -> Result<usize> {
        let comment_len = u16::try_from(self.comment.len()).map_err(|_| {
            VfsError::InvalidConfig(format!(
                "archive comment exceeds {} bytes",
                MAX_COMMENT_LENGTH
            ))
        })?;

        if self.needs_zip64() {
            writer.write_all(&ZIP64_END_RECORD_SIGNATURE.to_le_bytes())?;
            writer.write_all(&((ZIP64_END_RECORD_SIZE - 12) as u64).to_le_bytes())?;
            writer.write_all(&45u16.to_le_bytes())?; // version made by
            writer.write_all(&45u16.to_le_bytes())?; // version needed
            writer.write_all(&0u32.to_le_bytes())?; // this disk
            writer.write_all(&0u32.to_le_bytes())?; // directory disk
            writer.write_all(&self.entry_count.to_le_bytes())?;
            writer.write_all(&self.entry_count.to_le_bytes())?;
            writer.write_all(&self.directory_size.to_le_bytes())?;
            writer.write_all(&self.directory_offset.to_le_bytes())?;

            writer.write_all(&ZIP64_LOCATOR_SIGNATURE.to_le_bytes())?;
            writer.write_all(&0u32.to_le_bytes())?; // disk holding the ZIP64 record
            writer.write_all(&position.to_le_bytes())?;
            writer.write_all(&1u32.to_le_bytes())?; // total disks
        }

        let count = self.entry_count.min(ZIP64_COUNT_SENTINEL as u64) as u16;
        let size = self.directory_size.min(ZIP64_SENTINEL as u64) as u32;
        let offset = self.directory_offset.min(ZIP64_SENTINEL as u64) as u32;

        writer.write_all(&END_RECORD_SIGNATURE.to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?;
        writer.write_all(&count.to_le_bytes())?;
        writer.write_all(&count.to_le_bytes())?;
        writer.write_all(&size.to_le_bytes())?;
        writer.write_all(&offset.to_le_bytes())?;
        writer.write_all(&comment_len.to_le_bytes())?;
        writer.write_all(&self.comment)?;

        Ok(self.size_on_disk())
    }

    /// Find and parse the end record of a stream of length `stream_len`
    ///
    /// Scans backward from the end, treating each 16-bit candidate as a
    /// possible trailing-comment length and accepting the first position
    /// where stepping back over the fixed record lands on the signature. This
    /// tolerates comments up to 65535 bytes, including comments that contain
    /// the signature bytes themselves.
    ///
    /// Returns the record and the absolute offset where the block starts
    /// (the ZIP64 record when present, else the classic record).
    pub fn locate<R: Read + Seek>(mut reader: R, stream_len: u64) -> Result<(Self, u64)> {
        if stream_len < END_RECORD_SIZE as u64 {
            return Err(VfsError::CorruptIndex(
                "too short to hold an end of central directory record".to_string(),
            ));
        }

        let tail_len = stream_len.min((END_RECORD_SIZE + MAX_COMMENT_LENGTH) as u64);
        let tail_start = stream_len - tail_len;
        reader.seek(SeekFrom::Start(tail_start))?;
        let tail = read_bytes(&mut reader, tail_len as usize)?;

        let signature = END_RECORD_SIGNATURE.to_le_bytes();
        let mut found = None;
        let mut comment_len = 0usize;
        while comment_len <= MAX_COMMENT_LENGTH && END_RECORD_SIZE + comment_len <= tail.len() {
            // Candidate comment-length field sits just before the comment
            let field = tail.len() - comment_len - 2;
            let candidate = u16::from_le_bytes([tail[field], tail[field + 1]]) as usize;
            let record = field + 2 - END_RECORD_SIZE;
            if candidate == comment_len && tail[record..record + 4] == signature {
                found = Some(record);
                break;
            }
            comment_len += 1;
        }

        let record = found.ok_or_else(|| {
            VfsError::CorruptIndex("end of central directory record not found".to_string())
        })?;
        let mut fields = &tail[record + 4..];
        let _disk = read_u16(&mut fields)?;
        let _directory_disk = read_u16(&mut fields)?;
        let _disk_entries = read_u16(&mut fields)?;
        let entry_count = read_u16(&mut fields)? as u64;
        let directory_size = read_u32(&mut fields)? as u64;
        let directory_offset = read_u32(&mut fields)? as u64;
        let comment_len = read_u16(&mut fields)? as usize;
        let comment = fields[..comment_len].to_vec();

        let classic_offset = tail_start + record as u64;
        let mut end = Self::new(entry_count, directory_size, directory_offset, comment);

        let sentinel = entry_count == ZIP64_COUNT_SENTINEL as u64
            || directory_size == ZIP64_SENTINEL as u64
            || directory_offset == ZIP64_SENTINEL as u64;
        if let Some(zip64_offset) = Self::read_locator(&mut reader, classic_offset)? {
            end.read_zip64(&mut reader, zip64_offset)?;
            debug!(zip64_offset, entries = end.entry_count, "found ZIP64 end record");
            return Ok((end, zip64_offset));
        }
        if sentinel {
            return Err(VfsError::CorruptIndex(
                "ZIP64 sentinel without ZIP64 locator".to_string(),
            ));
        }

        Ok((end, classic_offset))
    }

    fn read_locator<R: Read + Seek>(reader: &mut R, classic_offset: u64) -> Result<Option<u64>> {
        if classic_offset < ZIP64_LOCATOR_SIZE as u64 {
            return Ok(None);
        }
        reader.seek(SeekFrom::Start(classic_offset - ZIP64_LOCATOR_SIZE as u64))?;
        if read_u32(&mut *reader)? != ZIP64_LOCATOR_SIGNATURE {
            return Ok(None);
        }
        let _disk = read_u32(&mut *reader)?;
        let zip64_offset = read_u64(&mut *reader)?;
        let _total_disks = read_u32(&mut *reader)?;
        if zip64_offset.saturating_add(ZIP64_END_RECORD_SIZE as u64) > classic_offset {
            return Err(VfsError::CorruptIndex(
                "ZIP64 locator points past the end record".to_string(),
            ));
        }
        Ok(Some(zip64_offset))
    }

    fn read_zip64<R: Read + Seek>(&mut self, reader: &mut R, offset: u64) -> Result<()> {
        reader.seek(SeekFrom::Start(offset))?;
        if read_u32(&mut *reader)? != ZIP64_END_RECORD_SIGNATURE {
            return Err(VfsError::CorruptIndex(
                "invalid ZIP64 end record signature".to_string(),
            ));
        }
        let _record_size = read_u64(&mut *reader)?;
        let _version_made_by = read_u16(&mut *reader)?;
        let _version_needed = read_u16(&mut *reader)?;
        let _disk = read_u32(&mut *reader)?;
        let _directory_disk = read_u32(&mut *reader)?;
        let _disk_entries = read_u64(&mut *reader)?;
        self.entry_count = read_u64(&mut *reader)?;
        self.directory_size = read_u64(&mut *reader)?;
        self.directory_offset = read_u64(&mut *reader)?;
        Ok(())
    }
}
