use crate::archive::wire::{read_i16, read_u32, read_u8};
use crate::error::{Result, VfsError};
use std::io::{Read, Write};

/// Magic bytes of a linear-index archive
pub const LINEAR_MAGIC: [u8; 6] = *b"pmf\0\n\r";

pub const CURRENT_MAJOR_VERSION: i16 = 1;
pub const CURRENT_MINOR_VERSION: i16 = 1;

/// Oldest minor version still readable; it predates the header timestamp
pub const MIN_MINOR_VERSION: i16 = 0;

/// Linear-index archive header
///
/// Structure:
/// - Prefix: zero or more lines starting with `#` (lets the file double as a script)
/// - Magic: "pmf\0\n\r" (6 bytes)
/// - Major, minor version: int16 each
/// - Scale factor: uint32
/// - Archive timestamp: uint32 (minor >= 1 only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearHeader {
    pub prefix: Vec<u8>,
    pub major: i16,
    pub minor: i16,
    pub scale_factor: u32,
    pub timestamp: u32,
}

impl LinearHeader {
    pub fn new(scale_factor: u32, timestamp: u32) -> Self {
        Self {
            prefix: Vec::new(),
            major: CURRENT_MAJOR_VERSION,
            minor: CURRENT_MINOR_VERSION,
            scale_factor,
            timestamp,
        }
    }

    fn has_timestamp(&self) -> bool {
        self.minor >= 1
    }

    /// Bytes this header occupies on disk
    pub fn size_on_disk(&self) -> usize {
        let timestamp = if self.has_timestamp() { 4 } else { 0 };
        self.prefix.len() + LINEAR_MAGIC.len() + 2 + 2 + 4 + timestamp
    }

    /// Offset of the timestamp field, if this version has one
    pub fn timestamp_offset(&self) -> Option<u64> {
        self.has_timestamp()
            .then(|| (self.prefix.len() + LINEAR_MAGIC.len() + 8) as u64)
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&self.prefix)?;
        writer.write_all(&LINEAR_MAGIC)?;
        writer.write_all(&self.major.to_le_bytes())?;
        writer.write_all(&self.minor.to_le_bytes())?;
        writer.write_all(&self.scale_factor.to_le_bytes())?;
        if self.has_timestamp() {
            writer.write_all(&self.timestamp.to_le_bytes())?;
        }
        Ok(self.size_on_disk())
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut prefix = Vec::new();
        let first = loop {
            let byte = read_u8(&mut reader)?;
            if byte != b'#' {
                break byte;
            }
            prefix.push(byte);
            loop {
                let byte = read_u8(&mut reader)?;
                prefix.push(byte);
                if byte == b'\n' {
                    break;
                }
            }
        };

        let mut magic = [0u8; 6];
        magic[0] = first;
        reader.read_exact(&mut magic[1..])?;
        if magic != LINEAR_MAGIC {
            return Err(VfsError::InvalidMagic);
        }

        let major = read_i16(&mut reader)?;
        let minor = read_i16(&mut reader)?;
        if major != CURRENT_MAJOR_VERSION || !(MIN_MINOR_VERSION..=CURRENT_MINOR_VERSION).contains(&minor) {
            return Err(VfsError::UnsupportedVersion { major, minor });
        }

        let scale_factor = read_u32(&mut reader)?;
        if scale_factor == 0 {
            return Err(VfsError::CorruptIndex("scale factor is zero".to_string()));
        }
        let timestamp = if minor >= 1 { read_u32(&mut reader)? } else { 0 };

        Ok(Self {
            prefix,
            major,
            minor,
            scale_factor,
            timestamp,
        })
    }

    /// True if `bytes` (the start of a stream) look like a linear-index archive
    pub fn detect(bytes: &[u8]) -> bool {
        let mut rest = bytes;
        while rest.first() == Some(&b'#') {
            match rest.iter().position(|&b| b == b'\n') {
                Some(end) => rest = &rest[end + 1..],
                None => return false,
            }
        }
        rest.starts_with(&LINEAR_MAGIC)
    }
}

/// Normalize a header prefix: every line starts with `#` and ends with a newline
pub fn normalize_prefix(prefix: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(prefix.len() + 1);
    for line in prefix.lines() {
        if !line.starts_with('#') {
            return Err(VfsError::InvalidConfig(format!(
                "header prefix line does not start with '#': {:?}",
                line
            )));
        }
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = LinearHeader::new(4, 1_700_000_000);
        header.prefix = b"#!/usr/bin/env run\n#second\n".to_vec();
        let mut buf = Vec::new();
        let written = header.write_to(&mut buf).unwrap();
        assert_eq!(written, 27 + 18);
        assert_eq!(buf.len(), written);
        assert!(LinearHeader::detect(&buf));

        let parsed = LinearHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.timestamp_offset(), Some(27 + 14));
    }

    #[test]
    fn test_minor_zero_has_no_timestamp() {
        let mut buf = LINEAR_MAGIC.to_vec();
        buf.extend_from_slice(&1i16.to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        let parsed = LinearHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed.minor, 0);
        assert_eq!(parsed.size_on_disk(), 14);
        assert_eq!(parsed.timestamp_offset(), None);
    }

    #[test]
    fn test_magic_validation() {
        let buf = b"PK\x03\x04 not a linear archive";
        assert!(!LinearHeader::detect(buf));
        assert!(matches!(
            LinearHeader::read_from(&buf[..]),
            Err(VfsError::InvalidMagic)
        ));
    }

    #[test]
    fn test_version_validation() {
        let mut header = LinearHeader::new(1, 0);
        header.major = 2;
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert!(matches!(
            LinearHeader::read_from(&buf[..]),
            Err(VfsError::UnsupportedVersion { major: 2, .. })
        ));
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("#a\n#b").unwrap(), b"#a\n#b\n".to_vec());
        assert!(normalize_prefix("#ok\nnot ok").is_err());
        assert!(normalize_prefix("").unwrap().is_empty());
    }
}
