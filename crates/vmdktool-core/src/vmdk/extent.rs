//! Extents: one contiguous logical range of the disk and its backing data.
//!
//! An [`Extent`] starts out `Described` (only its descriptor entry and the
//! resolved file path are known) and becomes `DataReady` once its file has
//! been mapped and, for sparse extents, its grain index decoded.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

use super::compression::CompressionMethod;
use super::descriptor::{AccessMode, ExtentDescriptor, ExtentType};
use super::grain_table::{GrainIndex, GrainLocation};
use super::header::{SparseExtentHeader, FOOTER_OFFSET_FROM_END, HEADER_SIZE, SECTOR_SIZE};
use super::reader::MappedFile;
use crate::error::{Error, Result};

/// Data source for the grains a delta extent does not store itself.
pub trait BackingImage {
    /// Read into `buf` from logical `offset` of the backing image.
    ///
    /// Returns the number of bytes produced; fewer than `buf.len()` only at the
    /// end of the backing image.
    fn read_backing(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

/// Lifecycle of an extent's backing data.
#[derive(Debug)]
enum ExtentState {
    Described,
    DataReady(ExtentData),
}

/// Opened backing data of an extent.
#[derive(Debug)]
pub(crate) enum ExtentData {
    Zero,
    Flat { file: MappedFile, start: u64 },
    Sparse(SparseData),
}

#[derive(Debug)]
pub(crate) struct SparseData {
    file: MappedFile,
    header: SparseExtentHeader,
    index: GrainIndex,
    compression: CompressionMethod,
    /// Last inflated grain, keyed by grain number.
    last_grain: Mutex<Option<(u64, Vec<u8>)>>,
}

/// One extent of a virtual disk.
#[derive(Debug)]
pub struct Extent {
    descriptor: ExtentDescriptor,
    path: Option<PathBuf>,
    state: ExtentState,
}

impl Extent {
    /// Create a described extent backed by `path` (`None` for ZERO extents).
    pub fn new(descriptor: ExtentDescriptor, path: Option<PathBuf>) -> Self {
        Self {
            descriptor,
            path,
            state: ExtentState::Described,
        }
    }

    /// The descriptor entry of this extent.
    pub fn descriptor(&self) -> &ExtentDescriptor {
        &self.descriptor
    }

    /// File name as declared in the descriptor.
    pub fn filename(&self) -> Option<&str> {
        self.descriptor.filename.as_deref()
    }

    /// Resolved path of the backing file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn extent_type(&self) -> ExtentType {
        self.descriptor.extent_type
    }

    pub fn access(&self) -> AccessMode {
        self.descriptor.access
    }

    /// Logical byte offset of the first byte of this extent.
    pub fn logical_offset(&self) -> u64 {
        self.descriptor.logical_start_sector * SECTOR_SIZE
    }

    /// Size of this extent in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size_sectors * SECTOR_SIZE
    }

    /// Returns true once the backing data is open.
    pub fn is_data_ready(&self) -> bool {
        matches!(self.state, ExtentState::DataReady(_))
    }

    /// Header of an opened sparse extent.
    pub fn sparse_header(&self) -> Option<&SparseExtentHeader> {
        match &self.state {
            ExtentState::DataReady(ExtentData::Sparse(sparse)) => Some(&sparse.header),
            _ => None,
        }
    }

    /// Grain index of an opened sparse extent.
    pub fn grain_index(&self) -> Option<&GrainIndex> {
        match &self.state {
            ExtentState::DataReady(ExtentData::Sparse(sparse)) => Some(&sparse.index),
            _ => None,
        }
    }

    /// Open the backing file and decode its addressing structures without
    /// changing this extent's state.
    pub(crate) fn load_data(&self) -> Result<ExtentData> {
        match self.descriptor.extent_type {
            ExtentType::Zero => Ok(ExtentData::Zero),
            ExtentType::Flat | ExtentType::Vmfs => {
                let file = MappedFile::open(self.backing_path()?)?;
                let start = self
                    .descriptor
                    .offset
                    .checked_mul(SECTOR_SIZE)
                    .ok_or_else(|| Error::structural("flat extent offset overflows"))?;
                debug!(
                    "opened flat extent {} ({} bytes, data at {})",
                    file.path().display(),
                    file.size(),
                    start
                );
                Ok(ExtentData::Flat { file, start })
            }
            ExtentType::Sparse => self.load_sparse().map(ExtentData::Sparse),
            ExtentType::VmfsSparse | ExtentType::VmfsRdm | ExtentType::VmfsRaw => {
                Err(Error::unsupported(format!(
                    "{:?} extents are not supported",
                    self.descriptor.extent_type
                )))
            }
        }
    }

    fn load_sparse(&self) -> Result<SparseData> {
        let file = MappedFile::open(self.backing_path()?)?;
        let data = file.data();

        let mut header = SparseExtentHeader::from_bytes(data)?;
        if header.needs_footer() {
            let footer_start = file
                .size()
                .checked_sub(FOOTER_OFFSET_FROM_END)
                .filter(|&start| start >= HEADER_SIZE as u64)
                .ok_or_else(|| Error::structural("file too small for a footer"))?
                as usize;
            header = SparseExtentHeader::from_bytes(&data[footer_start..footer_start + HEADER_SIZE])?;
            if header.needs_footer() {
                return Err(Error::structural("footer has no grain directory offset"));
            }
        }

        if header.capacity_bytes() != self.size() {
            warn!(
                "{}: header capacity {} bytes differs from descriptor extent size {} bytes",
                file.path().display(),
                header.capacity_bytes(),
                self.size()
            );
        }

        let compression = if header.is_compressed() {
            CompressionMethod::from_header_value(header.compress_algorithm)?
        } else {
            CompressionMethod::None
        };
        let index = GrainIndex::decode(data, &header)?;

        debug!(
            "opened sparse extent {}: {} grains of {} bytes, {:?}",
            file.path().display(),
            index.grain_count(),
            index.grain_size_bytes(),
            compression
        );

        Ok(SparseData {
            file,
            header,
            index,
            compression,
            last_grain: Mutex::new(None),
        })
    }

    fn backing_path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| Error::structural("extent has no backing file"))
    }

    pub(crate) fn attach(&mut self, data: ExtentData) {
        self.state = ExtentState::DataReady(data);
    }

    /// Read into `buf` from `offset` bytes into this extent.
    ///
    /// The request is clamped to the extent end; the returned count is the
    /// number of bytes produced. Unallocated grains read through `parent` when
    /// one is given and as zeros otherwise.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` before the data is open, `Unsupported` for
    /// `NOACCESS` extents and a structural error for corrupt compressed grains.
    pub fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
        parent: Option<&dyn BackingImage>,
    ) -> Result<usize> {
        let data = match &self.state {
            ExtentState::DataReady(data) => data,
            ExtentState::Described => {
                return Err(Error::not_open("extent data file is not open"));
            }
        };
        if self.descriptor.access == AccessMode::NoAccess {
            return Err(Error::unsupported("extent has no access"));
        }

        let size = self.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (size - offset).min(buf.len() as u64) as usize;
        let buf = &mut buf[..len];

        match data {
            ExtentData::Zero => buf.fill(0),
            ExtentData::Flat { file, start } => {
                let n = file.read_at(start.saturating_add(offset), buf);
                buf[n..].fill(0);
            }
            ExtentData::Sparse(sparse) => {
                sparse.read(buf, offset, self.logical_offset(), parent)?;
            }
        }

        Ok(len)
    }
}

impl SparseData {
    /// Fill `buf` grain by grain starting at extent offset `offset`.
    fn read(
        &self,
        buf: &mut [u8],
        offset: u64,
        logical_base: u64,
        parent: Option<&dyn BackingImage>,
    ) -> Result<()> {
        let grain_size = self.index.grain_size_bytes();
        let mut done = 0usize;

        while done < buf.len() {
            let pos = offset + done as u64;
            let grain = pos / grain_size;
            let in_grain = pos % grain_size;
            let take = ((grain_size - in_grain) as usize).min(buf.len() - done);
            let out = &mut buf[done..done + take];

            match self.index.lookup(grain) {
                GrainLocation::Unallocated => match parent {
                    Some(parent) => {
                        let n = parent.read_backing(out, logical_base + pos)?;
                        out[n..].fill(0);
                    }
                    None => out.fill(0),
                },
                GrainLocation::Zeroed => out.fill(0),
                GrainLocation::Allocated { sector } => {
                    let from = in_grain as usize;
                    if self.compression == CompressionMethod::None {
                        let grain_data = self.compression.read_grain(
                            self.file.data(),
                            sector * SECTOR_SIZE,
                            grain_size as usize,
                        )?;
                        out.copy_from_slice(&grain_data[from..from + take]);
                    } else {
                        let mut cached = self.last_grain.lock().unwrap_or_else(|e| e.into_inner());
                        let hit = matches!(&*cached, Some((number, _)) if *number == grain);
                        if !hit {
                            let grain_data = self.compression.read_grain(
                                self.file.data(),
                                sector * SECTOR_SIZE,
                                grain_size as usize,
                            )?;
                            *cached = Some((grain, grain_data.into_owned()));
                        }
                        if let Some((_, grain_data)) = &*cached {
                            out.copy_from_slice(&grain_data[from..from + take]);
                        }
                    }
                }
            }

            done += take;
        }

        Ok(())
    }
}
