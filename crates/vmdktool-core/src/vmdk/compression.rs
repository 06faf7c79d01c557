//! Grain compression.
//!
//! Compressed grains are stored as a 12-byte [`CompressedGrainHeader`]
//! followed by a zlib stream. The grain index walker only sees a
//! [`CompressionMethod`]; adding an algorithm means adding a variant here.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// Size of the compressed grain header in bytes.
pub const COMPRESSED_GRAIN_HEADER_SIZE: usize = 12;

/// How grain data is stored in an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Grains are stored verbatim.
    None,
    /// Grains are zlib-compressed with a [`CompressedGrainHeader`].
    Deflate,
}

impl CompressionMethod {
    /// Decode the header's compression algorithm field.
    pub fn from_header_value(value: u16) -> Result<Self> {
        match value {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Deflate),
            other => Err(Error::unsupported(format!(
                "unsupported compression algorithm: {}",
                other
            ))),
        }
    }

    /// Returns the contents of the grain stored at byte offset `start` of
    /// `file`, exactly `grain_size` bytes long.
    ///
    /// Uncompressed grains that run past end of file are zero padded.
    /// Compressed grains are inflated whole.
    pub fn read_grain<'a>(&self, file: &'a [u8], start: u64, grain_size: usize) -> Result<Cow<'a, [u8]>> {
        match self {
            CompressionMethod::None => {
                let len = file.len() as u64;
                if start >= len {
                    return Ok(Cow::Owned(vec![0u8; grain_size]));
                }
                let start = start as usize;
                let end = start.saturating_add(grain_size);
                if end <= file.len() {
                    Ok(Cow::Borrowed(&file[start..end]))
                } else {
                    let mut grain = file[start..].to_vec();
                    grain.resize(grain_size, 0);
                    Ok(Cow::Owned(grain))
                }
            }
            CompressionMethod::Deflate => {
                let (_, payload) = CompressedGrainHeader::locate(file, start)?;
                Ok(Cow::Owned(decompress_grain(payload, grain_size)?))
            }
        }
    }
}

/// Header preceding a compressed grain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedGrainHeader {
    /// Logical sector of the grain within the extent.
    pub lba: u64,
    /// Size of the compressed payload in bytes.
    pub size: u32,
}

impl CompressedGrainHeader {
    /// Creates a new grain header.
    pub fn new(lba: u64, size: u32) -> Self {
        Self { lba, size }
    }

    /// Parse a grain header from the first 12 bytes of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < COMPRESSED_GRAIN_HEADER_SIZE {
            return Err(Error::structural("compressed grain header truncated"));
        }
        let lba = u64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);
        let size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        Ok(Self { lba, size })
    }

    /// Serializes the grain header to 12 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; COMPRESSED_GRAIN_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.lba.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Parse the header at byte offset `start` of `file` and return it with
    /// its payload slice.
    pub fn locate(file: &[u8], start: u64) -> Result<(Self, &[u8])> {
        let header_end = start
            .checked_add(COMPRESSED_GRAIN_HEADER_SIZE as u64)
            .filter(|&end| end <= file.len() as u64)
            .ok_or_else(|| Error::structural("compressed grain header extends beyond file"))?;
        let header = Self::from_bytes(&file[start as usize..header_end as usize])?;

        if header.size == 0 {
            return Err(Error::structural("compressed grain has zero size"));
        }
        let payload_end = header_end + u64::from(header.size);
        if payload_end > file.len() as u64 {
            return Err(Error::structural("compressed grain data extends beyond file"));
        }

        Ok((header, &file[header_end as usize..payload_end as usize]))
    }
}

/// Inflate a zlib grain payload to exactly `grain_size` bytes.
///
/// Output shorter than a grain is zero padded; output beyond a grain is ignored.
pub fn decompress_grain(payload: &[u8], grain_size: usize) -> Result<Vec<u8>> {
    let mut grain = Vec::with_capacity(grain_size);
    ZlibDecoder::new(payload)
        .take(grain_size as u64)
        .read_to_end(&mut grain)
        .map_err(|e| Error::structural(format!("failed to decompress grain: {}", e)))?;
    grain.resize(grain_size, 0);
    Ok(grain)
}

/// Compresses grain data into a zlib stream.
///
/// # Arguments
///
/// * `data` - The uncompressed grain data.
/// * `level` - Compression level (0-9, where 6 is default).
pub fn compress_grain(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn framed(lba: u64, data: &[u8]) -> Vec<u8> {
        let payload = compress_grain(data, 6).unwrap();
        let mut out = CompressedGrainHeader::new(lba, payload.len() as u32).to_bytes();
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn test_from_header_value() {
        assert_eq!(
            CompressionMethod::from_header_value(0).unwrap(),
            CompressionMethod::None
        );
        assert_eq!(
            CompressionMethod::from_header_value(1).unwrap(),
            CompressionMethod::Deflate
        );
        assert_eq!(
            CompressionMethod::from_header_value(7).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn test_grain_header_to_bytes() {
        let bytes = CompressedGrainHeader::new(128, 4096).to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(
            CompressedGrainHeader::from_bytes(&bytes).unwrap(),
            CompressedGrainHeader::new(128, 4096)
        );
    }

    #[test]
    fn test_deflate_grain_is_padded() {
        let mut file = vec![0u8; 512];
        file.extend(framed(0, b"hello grain"));

        let grain = CompressionMethod::Deflate
            .read_grain(&file, 512, 4096)
            .unwrap();
        assert_eq!(grain.len(), 4096);
        assert_eq!(&grain[..11], b"hello grain");
        assert!(grain[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_deflate_grain_truncated_payload() {
        let mut file = framed(0, &[0xAB; 1024]);
        file.truncate(file.len() - 1);
        let err = CompressionMethod::Deflate
            .read_grain(&file, 0, 1024)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
    }

    #[test]
    fn test_deflate_grain_zero_size() {
        let file = CompressedGrainHeader::new(0, 0).to_bytes();
        assert!(CompressionMethod::Deflate.read_grain(&file, 0, 512).is_err());
    }

    #[test]
    fn test_deflate_garbage_payload() {
        let mut file = CompressedGrainHeader::new(0, 4).to_bytes();
        file.extend_from_slice(&[1, 2, 3, 4]);
        assert!(CompressionMethod::Deflate.read_grain(&file, 0, 512).is_err());
    }

    #[test]
    fn test_uncompressed_grain_past_end_is_zero_filled() {
        let file = vec![7u8; 600];
        let grain = CompressionMethod::None.read_grain(&file, 512, 512).unwrap();
        assert_eq!(&grain[..88], &[7u8; 88][..]);
        assert!(grain[88..].iter().all(|&b| b == 0));

        let grain = CompressionMethod::None.read_grain(&file, 4096, 512).unwrap();
        assert!(grain.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_uncompressed_grain_borrows() {
        let file = vec![1u8; 2048];
        let grain = CompressionMethod::None.read_grain(&file, 512, 1024).unwrap();
        assert!(matches!(grain, Cow::Borrowed(_)));
    }
}
