//! Linear-index container format
//!
//! A header, then a chain of index entries linked by forward offsets, with
//! payloads interleaved anywhere after the header. Offsets in the chain are
//! stored divided by the archive's scale factor, which lets a 32-bit field
//! address archives larger than 4 GiB.

mod header;
mod index_entry;

pub use header::{
    normalize_prefix, LinearHeader, CURRENT_MAJOR_VERSION, CURRENT_MINOR_VERSION, LINEAR_MAGIC,
};
pub use index_entry::{
    IndexEntry, ENTRY_FLAG_DATA_INVALID, ENTRY_FLAG_DELETED, ENTRY_FLAG_INDEX_INVALID,
    FLAGS_OFFSET,
};

use super::compression::CompressionMethod;
use super::signature::is_signature_name;
use super::subfile::{standardize_name, SubfileFlags, SubfileRecord};
use super::wire::{corrupt_on_eof, pad_to};
use crate::error::{Result, VfsError};
use crate::stream::LockedStream;
use std::io::{Seek, SeekFrom};
use tracing::{debug, warn};

/// Store an absolute offset in scale-factor units
pub(crate) fn scaled(pos: u64, scale: u64) -> Result<u32> {
    debug_assert!(scale > 0 && pos % scale == 0, "offset {} not aligned to {}", pos, scale);
    u32::try_from(pos / scale).map_err(|_| {
        VfsError::Unsupported(format!(
            "offset {} is out of range for scale factor {}",
            pos, scale
        ))
    })
}

pub(crate) fn entry_for(record: &SubfileRecord, scale: u64) -> Result<IndexEntry> {
    let too_large = || {
        VfsError::Unsupported(format!(
            "{} exceeds the 4 GiB subfile limit of the linear format",
            record.name
        ))
    };
    let flags = record.flags.bits();
    let uncompressed_length = if record.is_compressed() || record.is_encrypted() {
        Some(u32::try_from(record.uncompressed_length).map_err(|_| too_large())?)
    } else {
        None
    };
    Ok(IndexEntry {
        next: 0,
        data_start: scaled(record.data_start, scale)?,
        data_length: u32::try_from(record.data_length).map_err(|_| too_large())?,
        flags,
        uncompressed_length,
        timestamp: u32::try_from(record.timestamp).unwrap_or(u32::MAX),
        name: record.name.clone(),
    })
}

fn record_from_entry(entry: &IndexEntry, name: String, pos: u64, scale: u64) -> SubfileRecord {
    let flags = SubfileFlags::from_bits_truncate(entry.flags);
    let mut record = SubfileRecord::new(name);
    record.index_start = pos;
    record.index_length = entry.size_on_disk() as u64;
    record.data_start = entry.data_start as u64 * scale;
    record.data_length = entry.data_length as u64;
    record.uncompressed_length = entry.uncompressed_length.unwrap_or(entry.data_length) as u64;
    record.timestamp = entry.timestamp as u64;
    record.method = if flags.contains(SubfileFlags::COMPRESSED) {
        CompressionMethod::Zlib
    } else {
        CompressionMethod::Stored
    };
    record.flags = flags;
    record.flags.set(SubfileFlags::SIGNATURE, is_signature_name(&record.name));
    record.indexed = true;
    record
}

/// In-memory form of a parsed linear index
#[derive(Debug)]
pub(crate) struct LinearIndex {
    pub header: LinearHeader,
    pub first_index: u64,
    /// Position of the last entry in the chain, if the chain is not empty
    pub last_index: Option<u64>,
    pub records: Vec<SubfileRecord>,
    pub file_end: u64,
    /// Tombstones or invalid entries occupy space a repack would reclaim
    pub needs_repack: bool,
}

/// Offset of the first index entry for a given header
pub(crate) fn first_index_offset(header: &LinearHeader) -> u64 {
    pad_to(header.size_on_disk() as u64, header.scale_factor as u64)
}

/// Header, padding and an empty chain, ready to write at offset 0
pub(crate) fn encode_empty(header: &LinearHeader) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(header.size_on_disk() + 8);
    header.write_to(&mut bytes)?;
    bytes.resize(first_index_offset(header) as usize, 0);
    bytes.extend_from_slice(&0u32.to_le_bytes());
    Ok(bytes)
}

/// Walk the index chain
pub(crate) fn read_index(stream: &LockedStream) -> Result<LinearIndex> {
    let file_end = stream.seek_to_end()?;
    let mut guard = stream.acquire()?;
    guard.seek(SeekFrom::Start(0))?;
    let header = LinearHeader::read_from(&mut guard)
        .map_err(|e| corrupt_on_eof(e, "archive header"))?;
    let scale = header.scale_factor as u64;
    let first_index = first_index_offset(&header);

    let mut records = Vec::new();
    let mut last_index = None;
    let mut needs_repack = false;
    let mut pos = first_index;

    loop {
        if pos.saturating_add(4) > file_end {
            return Err(VfsError::CorruptIndex(format!(
                "index chain runs past end of archive at {}",
                pos
            )));
        }
        guard.seek(SeekFrom::Start(pos))?;
        let entry = match IndexEntry::read_from(&mut guard)
            .map_err(|e| corrupt_on_eof(e, "index entry"))?
        {
            Some(entry) => entry,
            None => break,
        };
        last_index = Some(pos);

        let next = entry.next as u64 * scale;
        if next <= pos || next > file_end {
            return Err(VfsError::CorruptIndex(format!(
                "index entry at {} links to {}",
                pos, next
            )));
        }

        if entry.is_deleted() {
            if !entry.is_anchor() {
                needs_repack = true;
            }
        } else if entry.is_invalid() {
            warn!(name = %entry.name, pos, "skipping invalid index entry");
            needs_repack = true;
        } else {
            let data_end = entry.data_start as u64 * scale + entry.data_length as u64;
            if data_end > file_end {
                return Err(VfsError::CorruptIndex(format!(
                    "payload of {} extends past end of archive",
                    entry.name
                )));
            }
            match standardize_name(&entry.name) {
                Ok(name) => records.push(record_from_entry(&entry, name, pos, scale)),
                Err(err) => {
                    warn!(name = %entry.name, error = %err, "skipping unusable subfile name");
                    needs_repack = true;
                }
            }
        }

        pos = next;
    }

    debug!(
        entries = records.len(),
        scale_factor = header.scale_factor,
        needs_repack,
        "read linear index"
    );

    Ok(LinearIndex {
        header,
        first_index,
        last_index,
        records,
        file_end,
        needs_repack,
    })
}

/// Entries encoded back to back for appending at `start`
#[derive(Debug)]
pub(crate) struct EncodedChain {
    pub bytes: Vec<u8>,
    /// Absolute position of each entry, in input order
    pub positions: Vec<u64>,
    /// Position of the trailing terminator
    pub terminator: u64,
}

impl EncodedChain {
    pub fn end(&self) -> u64 {
        self.terminator + 4
    }
}

/// Encode `entries` as a chain ending in a fresh terminator
///
/// `start` must be aligned to `scale`; each entry is padded so the next one
/// stays aligned.
pub(crate) fn encode_chain(entries: &mut [IndexEntry], start: u64, scale: u64) -> Result<EncodedChain> {
    let mut positions = Vec::with_capacity(entries.len());
    let mut pos = start;
    for entry in entries.iter() {
        positions.push(pos);
        pos = pad_to(pos + entry.size_on_disk() as u64, scale);
    }
    let terminator = pos;

    let mut bytes = Vec::with_capacity((terminator - start + 4) as usize);
    for (i, entry) in entries.iter_mut().enumerate() {
        let next = positions.get(i + 1).copied().unwrap_or(terminator);
        entry.next = scaled(next, scale)?;
        let at = (positions[i] - start) as usize;
        bytes.resize(at, 0);
        entry.write_to(&mut bytes)?;
    }
    bytes.resize((terminator - start) as usize, 0);
    bytes.extend_from_slice(&0u32.to_le_bytes());

    Ok(EncodedChain {
        bytes,
        positions,
        terminator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry(name: &str, data_start: u32, data_length: u32) -> IndexEntry {
        IndexEntry {
            next: 0,
            data_start,
            data_length,
            flags: 0,
            uncompressed_length: None,
            timestamp: 0,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_encode_chain_links_entries() {
        let mut entries = vec![entry("a", 0, 0), entry("bb", 0, 0)];
        let chain = encode_chain(&mut entries, 40, 4).unwrap();
        assert_eq!(chain.positions, vec![40, 64]);
        assert_eq!(chain.terminator, 88);
        assert_eq!(entries[0].next, 16);
        assert_eq!(entries[1].next, 22);
        assert_eq!(chain.bytes.len(), 52);
        assert_eq!(&chain.bytes[48..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_read_empty_archive() {
        let header = LinearHeader::new(1, 0);
        let bytes = encode_empty(&header).unwrap();
        let stream = LockedStream::owned(Cursor::new(bytes));
        let index = read_index(&stream).unwrap();
        assert!(index.records.is_empty());
        assert_eq!(index.last_index, None);
        assert_eq!(index.first_index, 18);
    }

    #[test]
    fn test_backward_link_is_corrupt() {
        let header = LinearHeader::new(1, 0);
        let mut bytes = encode_empty(&header).unwrap();
        bytes.truncate(18);
        let mut bad = entry("x", 0, 0);
        bad.next = 4;
        bad.write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&[0; 4]);
        let stream = LockedStream::owned(Cursor::new(bytes));
        assert!(matches!(read_index(&stream), Err(VfsError::CorruptIndex(_))));
    }

    #[test]
    fn test_scaled_rejects_overflow() {
        assert_eq!(scaled(4096, 16).unwrap(), 256);
        assert!(scaled(u64::from(u32::MAX) + 1, 1).is_err());
    }
}
