use crate::error::{Result, VfsError};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};
use tracing::debug;

/// Default compression level when a caller asks for "compressed"
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Compression methods supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Payload stored verbatim
    Stored,
    /// Raw deflate stream (ZIP method 8)
    Deflate,
    /// Deflate wrapped in a zlib header (linear-index subfiles)
    Zlib,
    /// Zstandard (ZIP method 93)
    Zstd,
}

impl CompressionMethod {
    /// ZIP method code for this compression
    pub fn zip_code(&self) -> Option<u16> {
        match self {
            Self::Stored => Some(0),
            Self::Deflate => Some(8),
            Self::Zstd => Some(93),
            Self::Zlib => None,
        }
    }

    pub fn from_zip_code(code: u16) -> Result<Self> {
        match code {
            0 => Ok(Self::Stored),
            8 => Ok(Self::Deflate),
            93 => Ok(Self::Zstd),
            other => Err(VfsError::Unsupported(format!(
                "ZIP compression method {}",
                other
            ))),
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Self::Stored)
    }

    /// Compress `data` at `level` (1-9; higher is smaller)
    pub fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>> {
        let level = level.clamp(1, 9);
        let compressed = match self {
            Self::Stored => return Ok(data.to_vec()),
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Self::Zstd => zstd::encode_all(data, level as i32).map_err(|e| {
                VfsError::CompressionFailed(format!("Zstd compression failed: {}", e))
            })?,
        };
        debug!(method = ?self, level, from = data.len(), to = compressed.len(), "compressed payload");
        Ok(compressed)
    }

    /// Decompress a whole payload
    ///
    /// Output stops one byte past `expected_size`, so a payload that inflates
    /// beyond its recorded length is caught by the caller's length check
    /// instead of exhausting memory. Pre-allocation is capped for the same
    /// reason.
    pub fn decompress(&self, data: &[u8], expected_size: u64) -> Result<Vec<u8>> {
        let capacity = expected_size.min(64 * 1024 * 1024) as usize;
        let mut output = Vec::with_capacity(capacity);
        let decoder = self.decoder(data)?;
        let limit = expected_size.saturating_add(1);
        decoder.take(limit).read_to_end(&mut output).map_err(|e| {
            VfsError::DecompressionFailed(format!("{:?} stream: {}", self, e))
        })?;
        Ok(output)
    }

    /// Streaming decoder over `reader`
    pub fn decoder<'a, R: Read + Send + 'a>(&self, reader: R) -> Result<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            Self::Stored => Box::new(reader),
            Self::Deflate => Box::new(DeflateDecoder::new(reader)),
            Self::Zlib => Box::new(ZlibDecoder::new(reader)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(reader).map_err(|e| {
                VfsError::DecompressionFailed(format!("Zstd stream: {}", e))
            })?),
        })
    }
}

/// General-purpose flag bits 1-2 recording the deflate level class
pub fn deflate_level_flags(level: u32) -> u16 {
    match level {
        0..=1 => 0x0006,
        2..=5 => 0x0004,
        6 => 0x0000,
        _ => 0x0002,
    }
}
