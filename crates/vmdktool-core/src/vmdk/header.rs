//! Sparse extent header.
//!
//! Every hosted sparse extent starts with a 512-byte header (magic `KDMV`)
//! that locates the embedded descriptor and the grain directories and
//! describes the grain geometry. StreamOptimized extents may defer the grain
//! directory location to a footer copy of the header near the end of file.

use crate::error::{Error, Result};

/// VMDK magic number ("KDMV" on disk, little-endian "VMDK").
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// ESX sparse (COWD) magic number ("COWD" on disk).
pub const COWD_MAGIC: u32 = 0x44574F43;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Size of the on-disk header in bytes.
pub const HEADER_SIZE: usize = 512;

/// Grain directory offset value meaning "see the footer".
pub const GD_AT_END: u64 = 0xFFFFFFFFFFFFFFFF;

/// Distance of the footer header from end of file (footer + end-of-stream marker).
pub const FOOTER_OFFSET_FROM_END: u64 = 2 * SECTOR_SIZE;

/// Bit 0: the newline detection characters are valid.
pub const FLAG_VALID_NEWLINE: u32 = 1 << 0;
/// Bit 1: use the secondary (redundant) grain directory.
pub const FLAG_USE_SECONDARY_GD: u32 = 1 << 1;
/// Bit 2: a grain table entry of 1 marks a zeroed grain.
pub const FLAG_ZEROED_GTE: u32 = 1 << 2;
/// Bit 16: grains are compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 16;
/// Bit 17: the extent contains stream markers.
pub const FLAG_MARKERS: u32 = 1 << 17;

const NEWLINE_CHARS: [u8; 4] = [b'\n', b' ', b'\r', b'\n'];

/// Parsed sparse extent header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    /// Format version (1 to 3).
    pub version: u32,
    /// Flags.
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Embedded descriptor offset in sectors (0 if none).
    pub descriptor_offset: u64,
    /// Embedded descriptor size in sectors.
    pub descriptor_size: u64,
    /// Number of grain table entries per grain table.
    pub num_gtes_per_gt: u32,
    /// Secondary (redundant) grain directory offset in sectors.
    pub rgd_offset: u64,
    /// Primary grain directory offset in sectors.
    pub gd_offset: u64,
    /// Metadata overhead in sectors.
    pub overhead: u64,
    /// Set when the extent was not closed cleanly.
    pub unclean_shutdown: u8,
    /// Newline detection characters.
    pub newline_chars: [u8; 4],
    /// Compression algorithm (0 = none, 1 = deflate).
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Creates a header for an uncompressed sparse extent.
    pub fn new(capacity: u64, grain_size: u64, num_gtes_per_gt: u32) -> Self {
        Self {
            version: 1,
            flags: FLAG_VALID_NEWLINE,
            capacity,
            grain_size,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt,
            rgd_offset: 0,
            gd_offset: 0,
            overhead: 0,
            unclean_shutdown: 0,
            newline_chars: NEWLINE_CHARS,
            compress_algorithm: 0,
        }
    }

    /// Parse and validate a header from at least 512 bytes.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for COWD extents, unknown versions and unknown
    /// compression algorithms, and `Structural` for anything else malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::structural("sparse header too short"));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic == COWD_MAGIC {
            return Err(Error::unsupported("COWD (ESX sparse) extents are not supported"));
        }
        if magic != VMDK_MAGIC {
            return Err(Error::structural(format!(
                "invalid sparse extent magic: expected 0x{:X}, got 0x{:X}",
                VMDK_MAGIC, magic
            )));
        }

        let header = Self {
            version: read_u32(data, 4),
            flags: read_u32(data, 8),
            capacity: read_u64(data, 12),
            grain_size: read_u64(data, 20),
            descriptor_offset: read_u64(data, 28),
            descriptor_size: read_u64(data, 36),
            num_gtes_per_gt: read_u32(data, 44),
            rgd_offset: read_u64(data, 48),
            gd_offset: read_u64(data, 56),
            overhead: read_u64(data, 64),
            unclean_shutdown: data[72],
            newline_chars: [data[73], data[74], data[75], data[76]],
            compress_algorithm: u16::from_le_bytes([data[77], data[78]]),
        };

        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > 3 {
            return Err(Error::unsupported(format!(
                "unsupported sparse extent version: {}",
                self.version
            )));
        }
        if self.grain_size <= 8 || !self.grain_size.is_power_of_two() {
            return Err(Error::structural(format!(
                "invalid grain size: {} sectors",
                self.grain_size
            )));
        }
        if self.grain_size > u64::from(u32::MAX) / SECTOR_SIZE {
            return Err(Error::structural(format!(
                "grain size too large: {} sectors",
                self.grain_size
            )));
        }
        if self.num_gtes_per_gt == 0 {
            return Err(Error::structural("grain table has no entries"));
        }
        if self.capacity > u64::MAX / SECTOR_SIZE {
            return Err(Error::structural("capacity overflows"));
        }
        if self.flags & FLAG_VALID_NEWLINE != 0 && self.newline_chars != NEWLINE_CHARS {
            return Err(Error::structural(
                "newline detection characters mismatch (corrupted by text-mode transfer)",
            ));
        }
        match self.compress_algorithm {
            0 if self.is_compressed() => {
                return Err(Error::structural(
                    "compressed flag set without a compression algorithm",
                ))
            }
            0 | 1 => {}
            other => {
                return Err(Error::unsupported(format!(
                    "unsupported compression algorithm: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Serializes the header to exactly 512 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        buf[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        buf[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.overhead.to_le_bytes());
        buf[72] = self.unclean_shutdown;
        buf[73..77].copy_from_slice(&self.newline_chars);
        buf[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());

        buf
    }

    /// Check if grains are compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Check if this is a streamOptimized extent with markers.
    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }

    /// Check if a grain table entry of 1 means "zeroed grain".
    pub fn has_zeroed_grain_entries(&self) -> bool {
        (self.flags & FLAG_ZEROED_GTE) != 0
    }

    /// Returns true if the grain directory location is stored in the footer.
    pub fn needs_footer(&self) -> bool {
        self.gd_offset == GD_AT_END
    }

    /// Grain directory sector to decode: the secondary one when the flag asks
    /// for it, the primary one otherwise.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the selected directory offset is 0.
    pub fn active_gd_offset(&self) -> Result<u64> {
        let (offset, which) = if self.flags & FLAG_USE_SECONDARY_GD != 0 {
            (self.rgd_offset, "secondary")
        } else {
            (self.gd_offset, "primary")
        };
        if offset == 0 {
            return Err(Error::structural(format!(
                "missing {} grain directory offset",
                which
            )));
        }
        Ok(offset)
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity * SECTOR_SIZE
    }

    /// Number of grains needed to cover the capacity.
    pub fn grain_count(&self) -> u64 {
        self.capacity.div_ceil(self.grain_size)
    }

    /// Number of grain directory entries.
    pub fn gd_entry_count(&self) -> u64 {
        self.grain_count().div_ceil(u64::from(self.num_gtes_per_gt))
    }

    /// Byte range of the embedded descriptor, if the extent carries one.
    pub fn descriptor_range(&self) -> Option<std::ops::Range<u64>> {
        if self.descriptor_offset == 0 || self.descriptor_size == 0 {
            return None;
        }
        let start = self.descriptor_offset.checked_mul(SECTOR_SIZE)?;
        let len = self.descriptor_size.checked_mul(SECTOR_SIZE)?;
        Some(start..start.checked_add(len)?)
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes([
        data[at],
        data[at + 1],
        data[at + 2],
        data[at + 3],
        data[at + 4],
        data[at + 5],
        data[at + 6],
        data[at + 7],
    ])
}
