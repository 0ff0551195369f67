//! ZIP-compatible container format
//!
//! Local headers and payloads are laid down front to back as subfiles are
//! added; the central directory and end record follow the last payload and
//! are rewritten on every flush.

mod central_entry;
pub mod codepage;
pub mod dos_time;
mod end_record;
mod local_entry;

pub use central_entry::{CentralEntry, CENTRAL_ENTRY_FIXED_SIZE, CENTRAL_ENTRY_SIGNATURE};
pub use end_record::{
    EndRecord, END_RECORD_SIGNATURE, END_RECORD_SIZE, MAX_COMMENT_LENGTH,
    ZIP64_END_RECORD_SIGNATURE, ZIP64_END_RECORD_SIZE, ZIP64_LOCATOR_SIGNATURE,
    ZIP64_LOCATOR_SIZE,
};
pub use local_entry::{
    LocalEntryHeader, DATA_DESCRIPTOR_SIGNATURE, LOCAL_ENTRY_FIXED_SIZE, LOCAL_ENTRY_SIGNATURE,
};

use super::compression::{deflate_level_flags, CompressionMethod};
use super::signature::is_signature_name;
use super::subfile::{standardize_name, SubfileFlags, SubfileRecord};
use super::wire::corrupt_on_eof;
use crate::error::{Result, VfsError};
use crate::stream::LockedStream;
use std::io::{Cursor, Seek, SeekFrom};
use tracing::{debug, warn};

/// 32-bit field value meaning "see the ZIP64 extra field"
pub const ZIP64_SENTINEL: u32 = 0xFFFF_FFFF;

/// 16-bit entry count meaning "see the ZIP64 end record"
pub const ZIP64_COUNT_SENTINEL: u16 = 0xFFFF;

pub const ZIP64_EXTRA_TAG: u16 = 0x0001;

/// Extended timestamp extra field
pub const TIMESTAMP_EXTRA_TAG: u16 = 0x5455;

// General-purpose flag bits
pub const FLAG_ENCRYPTED: u16 = 0x0001;
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
pub const FLAG_STRONG_ENCRYPTION: u16 = 0x0040;
pub const FLAG_UTF8: u16 = 0x0800;

/// Version-made-by host byte for UNIX
const HOST_UNIX: u16 = 3;

/// Internal attribute bit marking text content
const ATTRIBUTE_TEXT: u16 = 0x0001;

/// Regular file, rw-r--r--
const DEFAULT_EXTERNAL_ATTRIBUTES: u32 = 0o100644 << 16;

/// Body of the extra-field record tagged `tag`, if present
pub(crate) fn find_extra(extra: &[u8], tag: u16) -> Option<&[u8]> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        let body = rest.get(4..4 + len)?;
        if id == tag {
            return Some(body);
        }
        rest = &rest[4 + len..];
    }
    None
}

fn version_needed(method: u16, zip64: bool) -> u16 {
    if zip64 {
        return 45;
    }
    match method {
        0 => 10,
        93 => 63,
        _ => 20,
    }
}

/// General-purpose flags for a subfile about to be written
pub(crate) fn general_flags(method: CompressionMethod, level: u32, encrypted: bool) -> u16 {
    let mut flags = 0;
    if encrypted {
        flags |= FLAG_ENCRYPTED;
    }
    if method == CompressionMethod::Deflate {
        flags |= deflate_level_flags(level);
    }
    flags
}

/// Zero padding that places the payload after a `header_len` header on a
/// 4-byte boundary
pub(crate) fn alignment_padding(cursor: u64, header_len: u64) -> u64 {
    (4 - (cursor + header_len) % 4) % 4
}

pub(crate) fn local_header_for(record: &SubfileRecord) -> LocalEntryHeader {
    let (dos_time, dos_date) = dos_time::to_dos(record.timestamp);
    let zip64 = record.data_length >= ZIP64_SENTINEL as u64
        || record.uncompressed_length >= ZIP64_SENTINEL as u64;
    LocalEntryHeader {
        version_needed: version_needed(record.zip_method, zip64),
        flags: record.zip_flags,
        method: record.zip_method,
        dos_time,
        dos_date,
        crc32: record.checksum.unwrap_or(0),
        compressed_size: record.data_length,
        uncompressed_size: record.uncompressed_length,
        name: record.name.clone(),
    }
}

pub(crate) fn central_entry_for(record: &SubfileRecord, record_timestamp: bool) -> CentralEntry {
    let (dos_time, dos_date) = dos_time::to_dos(record.timestamp);
    let unix_time = if record_timestamp && record.timestamp > dos_time::DOS_EPOCH {
        u32::try_from(record.timestamp).ok()
    } else {
        None
    };
    let mut entry = CentralEntry {
        version_made_by: (HOST_UNIX << 8) | 20,
        version_needed: version_needed(record.zip_method, false),
        flags: record.zip_flags,
        method: record.zip_method,
        dos_time,
        dos_date,
        crc32: record.checksum.unwrap_or(0),
        compressed_size: record.data_length,
        uncompressed_size: record.uncompressed_length,
        internal_attributes: if record.is_text() { ATTRIBUTE_TEXT } else { 0 },
        external_attributes: DEFAULT_EXTERNAL_ATTRIBUTES,
        header_offset: record.index_start,
        name: record.name.clone(),
        comment: Vec::new(),
        unix_time,
    };
    if entry.needs_zip64() {
        entry.version_made_by = (HOST_UNIX << 8) | 45;
        entry.version_needed = 45;
    }
    entry
}

fn record_from_central(entry: CentralEntry, name: String) -> SubfileRecord {
    let mut record = SubfileRecord::new(name);
    let method = CompressionMethod::from_zip_code(entry.method).unwrap_or(CompressionMethod::Stored);

    record.flags.set(SubfileFlags::COMPRESSED, entry.method != 0);
    record.flags.set(
        SubfileFlags::ENCRYPTED,
        entry.flags & (FLAG_ENCRYPTED | FLAG_STRONG_ENCRYPTION) != 0,
    );
    record.flags.set(SubfileFlags::TEXT, entry.internal_attributes & ATTRIBUTE_TEXT != 0);
    record.flags.set(SubfileFlags::SIGNATURE, is_signature_name(&record.name));

    record.index_start = entry.header_offset;
    record.data_length = entry.compressed_size;
    record.uncompressed_length = entry.uncompressed_size;
    record.checksum = Some(entry.crc32);
    record.timestamp = match entry.unix_time {
        Some(unix_time) => unix_time as u64,
        None => dos_time::from_dos(entry.dos_time, entry.dos_date),
    };
    record.method = method;
    record.zip_flags = entry.flags;
    record.zip_method = entry.method;
    record.indexed = true;
    record
}

/// Serialize the central directory plus end record that will start at `start`
pub(crate) fn encode_index(entries: &[CentralEntry], start: u64, comment: &[u8]) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(entries.len() * 64 + END_RECORD_SIZE + comment.len());
    for entry in entries {
        entry.write_to(&mut bytes)?;
    }
    let directory_size = bytes.len() as u64;
    let end = EndRecord::new(entries.len() as u64, directory_size, start, comment.to_vec());
    end.write_to(&mut bytes, start + directory_size)?;
    Ok(bytes)
}

/// In-memory form of a parsed ZIP index
#[derive(Debug)]
pub(crate) struct ZipIndex {
    pub records: Vec<SubfileRecord>,
    pub comment: Vec<u8>,
    pub directory_offset: u64,
    pub file_end: u64,
}

/// Locate and parse the central directory
pub(crate) fn read_index(stream: &LockedStream) -> Result<ZipIndex> {
    let file_end = stream.seek_to_end()?;
    let mut guard = stream.acquire()?;
    let (end, end_offset) = EndRecord::locate(&mut guard, file_end)
        .map_err(|e| corrupt_on_eof(e, "end of central directory"))?;

    let directory_end = end.directory_offset.checked_add(end.directory_size);
    if directory_end.map_or(true, |directory_end| directory_end > end_offset) {
        return Err(VfsError::CorruptIndex(format!(
            "central directory ({} bytes at {}) overlaps the end record at {}",
            end.directory_size, end.directory_offset, end_offset
        )));
    }
    if end.entry_count.saturating_mul(CENTRAL_ENTRY_FIXED_SIZE as u64) > end.directory_size {
        return Err(VfsError::CorruptIndex(format!(
            "{} entries cannot fit in a {}-byte central directory",
            end.entry_count, end.directory_size
        )));
    }

    guard.seek(SeekFrom::Start(end.directory_offset))?;
    let directory = super::wire::read_bytes(&mut guard, end.directory_size as usize)
        .map_err(|e| corrupt_on_eof(e, "central directory"))?;
    drop(guard);

    let mut cursor = Cursor::new(&directory[..]);
    let mut records = Vec::with_capacity(end.entry_count as usize);
    for _ in 0..end.entry_count {
        let entry = CentralEntry::read_from(&mut cursor)
            .map_err(|e| corrupt_on_eof(e, "central directory entry"))?;
        if entry.name.ends_with('/') {
            // Explicit directory entries are implied by their contents
            continue;
        }
        let name = match standardize_name(&entry.name) {
            Ok(name) => name,
            Err(err) => {
                warn!(name = %entry.name, error = %err, "skipping unusable subfile name");
                continue;
            }
        };
        if entry.header_offset >= end.directory_offset {
            return Err(VfsError::CorruptIndex(format!(
                "local header of {} lies inside the central directory",
                name
            )));
        }
        records.push(record_from_central(entry, name));
    }

    debug!(
        entries = records.len(),
        directory_offset = end.directory_offset,
        comment_len = end.comment.len(),
        "read central directory"
    );

    Ok(ZipIndex {
        records,
        comment: end.comment,
        directory_offset: end.directory_offset,
        file_end,
    })
}

/// Parse a subfile's local header; returns it with the absolute payload start
///
/// Holds the stream lock only for the header itself.
pub(crate) fn read_local_header(stream: &LockedStream, record: &SubfileRecord) -> Result<(LocalEntryHeader, u64)> {
    let mut guard = stream.acquire()?;
    guard.seek(SeekFrom::Start(record.index_start))?;
    let (header, size) = LocalEntryHeader::read_from(&mut guard)
        .map_err(|e| corrupt_on_eof(e, "local header"))?;
    Ok((header, record.index_start + size as u64))
}

/// Compare a local header against the central directory's view
pub(crate) fn check_local_header(header: &LocalEntryHeader, record: &SubfileRecord) -> Result<()> {
    let mismatch = |field: &str| {
        Err(VfsError::CorruptIndex(format!(
            "local header of {} disagrees with the central directory: {}",
            record.name, field
        )))
    };

    if header.method != record.zip_method {
        return mismatch("compression method");
    }
    if header.flags & FLAG_ENCRYPTED != record.zip_flags & FLAG_ENCRYPTED {
        return mismatch("encryption flag");
    }
    if header.flags & FLAG_DATA_DESCRIPTOR != 0 {
        // Sizes and CRC trail the payload; the central directory is authoritative
        return Ok(());
    }
    if Some(header.crc32) != record.checksum {
        return mismatch("crc32");
    }
    if header.compressed_size != record.data_length {
        return mismatch("compressed size");
    }
    if header.uncompressed_size != record.uncompressed_length {
        return mismatch("uncompressed size");
    }
    Ok(())
}

/// Strong encryption and unknown methods cannot be decoded by this build
pub(crate) fn read_method(record: &SubfileRecord) -> Result<CompressionMethod> {
    if record.zip_flags & FLAG_STRONG_ENCRYPTION != 0 {
        return Err(VfsError::Unsupported(format!(
            "strong encryption on {}",
            record.name
        )));
    }
    CompressionMethod::from_zip_code(record.zip_method)
}
