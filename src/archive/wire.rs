//! Little-endian primitive readers shared by the index codecs

use crate::error::{Result, VfsError};
use std::io::{self, Read};

pub(crate) fn read_u8<R: Read>(mut reader: R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16<R: Read>(mut reader: R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_i16<R: Read>(mut reader: R) -> Result<i16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(i16::from_le_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(mut reader: R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(mut reader: R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_bytes<R: Read>(mut reader: R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Truncated index data is a corrupt index, not a transfer failure
pub(crate) fn corrupt_on_eof(err: VfsError, what: &str) -> VfsError {
    match err {
        VfsError::Io(ref io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
            VfsError::CorruptIndex(format!("truncated {}", what))
        }
        other => other,
    }
}

/// Round `pos` up to the next multiple of `scale`
pub(crate) fn pad_to(pos: u64, scale: u64) -> u64 {
    if scale <= 1 {
        return pos;
    }
    pos.div_ceil(scale) * scale
}
