//! VMDK descriptor file parsing.
//!
//! This module handles parsing VMDK descriptor text (standalone descriptor
//! files or the descriptor embedded in a sparse extent) into the header
//! values, the ordered extent list and the disk database entries.

use crate::error::{Error, Result};

/// Signature line that opens every descriptor.
pub const DESCRIPTOR_SIGNATURE: &str = "# Disk DescriptorFile";

/// Parent content identifier value meaning "no parent".
pub const NO_PARENT_CID: u32 = 0xffff_ffff;

/// The type of a VMDK extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentType {
    /// Flat extent - raw disk data in a separate file.
    Flat,
    /// Sparse extent - uses grain tables for allocation.
    Sparse,
    /// Zero extent - represents zeroed data without storage.
    Zero,
    /// VMFS extent - raw data on a VMFS volume.
    Vmfs,
    /// VMFS sparse extent (COWD).
    VmfsSparse,
    /// VMFS raw device mapping.
    VmfsRdm,
    /// VMFS raw extent.
    VmfsRaw,
}

impl ExtentType {
    /// Parse an extent type from a string.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(ExtentType::Flat),
            "SPARSE" => Ok(ExtentType::Sparse),
            "ZERO" => Ok(ExtentType::Zero),
            "VMFS" => Ok(ExtentType::Vmfs),
            "VMFSSPARSE" => Ok(ExtentType::VmfsSparse),
            "VMFSRDM" => Ok(ExtentType::VmfsRdm),
            "VMFSRAW" => Ok(ExtentType::VmfsRaw),
            _ => Err(Error::descriptor(format!("unknown extent type: {}", s))),
        }
    }

    /// Returns true if extents of this type are backed by a file.
    pub fn has_file(&self) -> bool {
        !matches!(self, ExtentType::Zero)
    }
}

/// Access mode of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// `RW`
    ReadWrite,
    /// `RDONLY`
    ReadOnly,
    /// `NOACCESS`
    NoAccess,
}

impl AccessMode {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "RW" => Some(AccessMode::ReadWrite),
            "RDONLY" => Some(AccessMode::ReadOnly),
            "NOACCESS" => Some(AccessMode::NoAccess),
            _ => None,
        }
    }
}

/// The `createType` of a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskType {
    /// Single raw extent file with a separate descriptor.
    MonolithicFlat,
    /// Single sparse extent file containing its own descriptor.
    MonolithicSparse,
    /// Raw extent files of at most 2 GB each.
    TwoGbMaxExtentFlat,
    /// Sparse extent files of at most 2 GB each.
    TwoGbMaxExtentSparse,
    /// Single compressed sparse extent with stream markers.
    StreamOptimized,
    /// Descriptor with arbitrary extents.
    Custom,
    /// Full physical device.
    FullDevice,
    /// Physical device accessed per partition.
    PartitionedDevice,
    /// Raw extent on VMFS (and its preallocation variants).
    Vmfs,
    /// VMFS sparse (COWD) redo log.
    VmfsSparse,
    /// Raw device mapping.
    VmfsRaw,
    /// Any other value, kept verbatim.
    Unknown(String),
}

impl DiskType {
    /// Decode a `createType` value. Never fails; unknown values are preserved.
    pub fn from_create_type(s: &str) -> Self {
        match s {
            "monolithicFlat" => DiskType::MonolithicFlat,
            "monolithicSparse" => DiskType::MonolithicSparse,
            "2GbMaxExtentFlat" | "twoGbMaxExtentFlat" => DiskType::TwoGbMaxExtentFlat,
            "2GbMaxExtentSparse" | "twoGbMaxExtentSparse" => DiskType::TwoGbMaxExtentSparse,
            "streamOptimized" => DiskType::StreamOptimized,
            "custom" => DiskType::Custom,
            "fullDevice" => DiskType::FullDevice,
            "partitionedDevice" => DiskType::PartitionedDevice,
            "vmfs" | "vmfsEagerZeroedThick" | "vmfsPreallocated" | "vmfsThin" => DiskType::Vmfs,
            "vmfsSparse" => DiskType::VmfsSparse,
            "vmfsRaw" | "vmfsRDM" | "vmfsRDMP" => DiskType::VmfsRaw,
            other => DiskType::Unknown(other.to_string()),
        }
    }
}

/// A VMDK extent entry describing a portion of the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentDescriptor {
    /// Access mode.
    pub access: AccessMode,
    /// Size of this extent in 512-byte sectors.
    pub size_sectors: u64,
    /// Type of the extent.
    pub extent_type: ExtentType,
    /// Filename of the extent file; `None` for ZERO extents.
    pub filename: Option<String>,
    /// Offset within the extent file (in sectors). Only meaningful for flat extents.
    pub offset: u64,
    /// First logical sector of this extent within the virtual disk.
    pub logical_start_sector: u64,
}

/// Parsed VMDK descriptor containing disk metadata.
#[derive(Debug, Clone)]
pub struct VmdkDescriptor {
    /// Descriptor format version.
    pub version: u32,
    /// Descriptor text encoding.
    pub encoding: String,
    /// Content ID for change tracking.
    pub cid: u32,
    /// Parent content ID for delta disks.
    pub parent_cid: u32,
    /// Path hint to the parent image of a delta disk.
    pub parent_file_name_hint: Option<String>,
    /// The raw `createType` value.
    pub create_type: String,
    /// List of extent entries, in logical order.
    pub extents: Vec<ExtentDescriptor>,
    /// Disk geometry: cylinders.
    pub cylinders: u64,
    /// Disk geometry: heads.
    pub heads: u32,
    /// Disk geometry: sectors per track.
    pub sectors: u32,
    /// Virtual hardware version.
    pub hw_version: String,
    /// Disk adapter type (e.g., "lsilogic", "ide", "buslogic").
    pub adapter_type: String,
    /// Disk UUID from the disk database.
    pub uuid: Option<String>,
    /// Guest tools version from the disk database.
    pub tools_version: Option<String>,
}

impl VmdkDescriptor {
    /// Descriptor of a standalone sparse extent file without an embedded
    /// descriptor: one SPARSE extent of `capacity` sectors.
    pub fn for_sparse_extent(filename: &str, capacity: u64) -> Self {
        Self {
            version: 1,
            encoding: String::from("UTF-8"),
            cid: 0,
            parent_cid: NO_PARENT_CID,
            parent_file_name_hint: None,
            create_type: String::from("monolithicSparse"),
            extents: vec![ExtentDescriptor {
                access: AccessMode::ReadWrite,
                size_sectors: capacity,
                extent_type: ExtentType::Sparse,
                filename: Some(filename.to_string()),
                offset: 0,
                logical_start_sector: 0,
            }],
            cylinders: 0,
            heads: 0,
            sectors: 0,
            hw_version: String::new(),
            adapter_type: String::new(),
            uuid: None,
            tools_version: None,
        }
    }

    /// Calculate the total disk size in bytes.
    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_sectors() * 512
    }

    /// Calculate the total disk size in sectors.
    pub fn disk_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }

    /// Decoded `createType`.
    pub fn disk_type(&self) -> DiskType {
        DiskType::from_create_type(&self.create_type)
    }

    /// Returns true if this disk is a delta of a parent image.
    pub fn has_parent(&self) -> bool {
        self.parent_cid != NO_PARENT_CID
    }

    /// Check the extent layout: at least one extent, positive sector counts,
    /// contiguous logical ranges from sector 0, a filename for every file-backed
    /// extent, and a total size that fits in a byte offset.
    pub fn validate(&self) -> Result<()> {
        if self.extents.is_empty() {
            return Err(Error::structural("descriptor has no extents"));
        }

        let mut next_start = 0u64;
        for (i, extent) in self.extents.iter().enumerate() {
            if extent.size_sectors == 0 {
                return Err(Error::structural(format!(
                    "extent {} has zero sectors",
                    i + 1
                )));
            }
            if extent.logical_start_sector != next_start {
                return Err(Error::structural(format!(
                    "extent {} starts at sector {}, expected {}",
                    i + 1,
                    extent.logical_start_sector,
                    next_start
                )));
            }
            if extent.extent_type.has_file() && extent.filename.is_none() {
                return Err(Error::structural(format!(
                    "extent {} has no filename",
                    i + 1
                )));
            }
            next_start = next_start
                .checked_add(extent.size_sectors)
                .filter(|&s| s <= u64::MAX / 512)
                .ok_or_else(|| Error::structural("total extent size overflows"))?;
        }

        Ok(())
    }
}

/// Returns true if `content` contains the descriptor signature line before any
/// non-comment text.
pub fn has_descriptor_signature(content: &str) -> bool {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('#') {
            return false;
        }
        if line.eq_ignore_ascii_case(DESCRIPTOR_SIGNATURE) {
            return true;
        }
    }
    false
}

/// Parse a VMDK descriptor from its text content.
///
/// Extent logical start sectors are assigned cumulatively in the order the
/// extent lines appear.
///
/// # Errors
///
/// Returns an error if a value or an extent line is malformed.
pub fn parse_descriptor(content: &str) -> Result<VmdkDescriptor> {
    let mut version = 1;
    let mut encoding = String::from("UTF-8");
    let mut cid = 0u32;
    let mut parent_cid = NO_PARENT_CID;
    let mut parent_file_name_hint = None;
    let mut create_type = String::new();
    let mut extents: Vec<ExtentDescriptor> = Vec::new();
    let mut cylinders = 0u64;
    let mut heads = 0u32;
    let mut sectors = 0u32;
    let mut hw_version = String::new();
    let mut adapter_type = String::new();
    let mut uuid = None;
    let mut tools_version = None;

    // The embedded descriptor region is zero padded.
    let content = content.trim_end_matches('\0');

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Check for extent line (starts with access mode)
        if line.starts_with("RW ") || line.starts_with("RDONLY ") || line.starts_with("NOACCESS ") {
            let next_start = extents
                .last()
                .map(|e| e.logical_start_sector.saturating_add(e.size_sectors))
                .unwrap_or(0);
            let extent = parse_extent_line(line, next_start)?;
            extents.push(extent);
            continue;
        }

        // Parse key=value or key = value pairs
        if let Some((key, value)) = parse_key_value(line) {
            match key.as_str() {
                "version" => {
                    version = value
                        .parse()
                        .map_err(|_| Error::descriptor(format!("invalid version: {}", value)))?;
                }
                "encoding" => {
                    encoding = value;
                }
                "CID" => {
                    cid = u32::from_str_radix(&value, 16)
                        .map_err(|_| Error::descriptor(format!("invalid CID: {}", value)))?;
                }
                "parentCID" => {
                    parent_cid = u32::from_str_radix(&value, 16)
                        .map_err(|_| Error::descriptor(format!("invalid parentCID: {}", value)))?;
                }
                "parentFileNameHint" => {
                    parent_file_name_hint = Some(value);
                }
                "createType" => {
                    create_type = value;
                }
                "ddb.virtualHWVersion" => {
                    hw_version = value;
                }
                "ddb.geometry.cylinders" => {
                    cylinders = value
                        .parse()
                        .map_err(|_| Error::descriptor(format!("invalid cylinders: {}", value)))?;
                }
                "ddb.geometry.heads" => {
                    heads = value
                        .parse()
                        .map_err(|_| Error::descriptor(format!("invalid heads: {}", value)))?;
                }
                "ddb.geometry.sectors" => {
                    sectors = value
                        .parse()
                        .map_err(|_| Error::descriptor(format!("invalid sectors: {}", value)))?;
                }
                "ddb.adapterType" => {
                    adapter_type = value;
                }
                "ddb.uuid" => {
                    uuid = Some(value);
                }
                "ddb.toolsVersion" => {
                    tools_version = Some(value);
                }
                _ => {
                    // Ignore unknown keys
                }
            }
        }
    }

    Ok(VmdkDescriptor {
        version,
        encoding,
        cid,
        parent_cid,
        parent_file_name_hint,
        create_type,
        extents,
        cylinders,
        heads,
        sectors,
        hw_version,
        adapter_type,
        uuid,
        tools_version,
    })
}

/// Parse a key=value or key = value line.
///
/// Returns None if the line doesn't contain an equals sign.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let mut value = line[eq_pos + 1..].trim().to_string();

    // Remove surrounding quotes if present
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }

    Some((key, value))
}

/// Parse an extent line like: `RW 838860800 FLAT "TestVM-flat.vmdk" 0`.
///
/// The filename and offset are optional (ZERO extents carry neither).
fn parse_extent_line(line: &str, logical_start_sector: u64) -> Result<ExtentDescriptor> {
    let (access_str, rest) = next_token(line);
    let access = AccessMode::from_str(access_str)
        .ok_or_else(|| Error::descriptor(format!("invalid extent access mode: {}", access_str)))?;

    let (size_str, rest) = next_token(rest);
    let size_sectors: u64 = size_str
        .parse()
        .map_err(|_| Error::descriptor(format!("invalid extent size in line: {}", line)))?;

    let (type_str, rest) = next_token(rest);
    if type_str.is_empty() {
        return Err(Error::descriptor(format!("invalid extent line: {}", line)));
    }
    let extent_type = ExtentType::from_str(type_str)?;

    let rest = rest.trim();
    let (filename, offset) = if rest.is_empty() {
        (None, 0)
    } else {
        let (filename, offset_str) = parse_quoted_filename_and_offset(rest)?;
        // Raw device extents may append a partition UUID after the offset.
        let offset_str = offset_str.split_whitespace().next().unwrap_or("");
        let offset = if offset_str.is_empty() {
            0
        } else {
            offset_str
                .parse()
                .map_err(|_| Error::descriptor(format!("invalid extent offset: {}", offset_str)))?
        };
        (Some(filename), offset)
    };

    Ok(ExtentDescriptor {
        access,
        size_sectors,
        extent_type,
        filename,
        offset,
        logical_start_sector,
    })
}

/// Split off the first whitespace-delimited token.
fn next_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], &s[end..]),
        None => (s, ""),
    }
}

/// Parse a quoted filename followed by an offset from a string like: "filename.vmdk" 0
fn parse_quoted_filename_and_offset(s: &str) -> Result<(String, String)> {
    let s = s.trim();

    if !s.starts_with('"') {
        return Err(Error::descriptor(format!(
            "expected quoted filename, got: {}",
            s
        )));
    }

    // Find the closing quote
    let end_quote = s[1..]
        .find('"')
        .ok_or_else(|| Error::descriptor(format!("unclosed quote in: {}", s)))?
        + 1;

    let filename = s[1..end_quote].to_string();
    let offset_str = s[end_quote + 1..].trim().to_string();

    Ok((filename, offset_str))
}
