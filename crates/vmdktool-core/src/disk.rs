//! The virtual disk handle.
//!
//! [`VirtualDisk`] opens a descriptor file or a sparse extent, builds the
//! extent set and presents the disk as one seekable byte stream.
//!
//! Opening happens in two steps: [`VirtualDisk::open`] parses metadata only,
//! [`VirtualDisk::open_extent_data_files`] maps the extent files and decodes
//! the grain indexes. Reads are only possible after the second step.
//!
//! # Example
//!
//! ```no_run
//! use vmdktool_core::VirtualDisk;
//! use std::io::SeekFrom;
//!
//! let mut disk = VirtualDisk::open("disk.vmdk").unwrap();
//! disk.open_extent_data_files().unwrap();
//!
//! let mut sector = [0u8; 512];
//! disk.seek_to(SeekFrom::Start(0)).unwrap();
//! disk.read_buffer(&mut sector).unwrap();
//! ```

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::signature::{detect_file_type, read_signature_bytes, FileType};
use crate::vmdk::descriptor::{parse_descriptor, DiskType, VmdkDescriptor};
use crate::vmdk::extent::{BackingImage, Extent};
use crate::vmdk::extent_set::ExtentSet;
use crate::vmdk::header::SparseExtentHeader;
use crate::vmdk::reader::MappedFile;

/// Longest parent chain followed by [`VirtualDisk::open_parent`].
pub const MAX_PARENT_DEPTH: usize = 32;

/// Options for opening a disk.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Directory used to resolve extent and parent file names instead of the
    /// descriptor's directory.
    pub extent_data_path: Option<PathBuf>,
    /// Verify at open time that every referenced extent file exists.
    pub check_extent_files: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            extent_data_path: None,
            check_extent_files: true,
        }
    }
}

impl OpenOptions {
    /// Create open options with specified settings.
    pub fn new(extent_data_path: Option<PathBuf>, check_extent_files: bool) -> Self {
        Self {
            extent_data_path,
            check_extent_files,
        }
    }

    /// Resolve extent files against `path`.
    pub fn with_extent_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extent_data_path = Some(path.into());
        self
    }

    /// Defer extent file existence checks to data-file opening.
    pub fn metadata_only() -> Self {
        Self {
            extent_data_path: None,
            check_extent_files: false,
        }
    }
}

/// Lifecycle state of a [`VirtualDisk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    /// Metadata parsed; extent data not open.
    Described,
    /// Extent data open; reads allowed.
    DataReady,
}

/// An opened VMDK virtual disk.
#[derive(Debug)]
pub struct VirtualDisk {
    path: PathBuf,
    data_dir: PathBuf,
    options: OpenOptions,
    descriptor: VmdkDescriptor,
    extents: ExtentSet,
    state: DiskState,
    cursor: u64,
    parent: Option<Box<VirtualDisk>>,
}

impl VirtualDisk {
    /// Open a disk with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    /// Open a disk: parse its descriptor and build the extent set.
    ///
    /// `path` is either a descriptor file or a sparse extent with an embedded
    /// descriptor. Extent data files are not opened.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, `Unsupported` for
    /// COWD files and a structural error for anything that is not a valid
    /// VMDK descriptor or layout.
    pub fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let head = read_signature_bytes(path)?;

        let (descriptor, own_file) = match detect_file_type(&head) {
            Some(FileType::VmdkSparse) => (read_embedded_descriptor(path)?, Some(path)),
            Some(FileType::Descriptor) => (read_descriptor_file(path)?, None),
            Some(FileType::CowdSparse) => {
                return Err(Error::unsupported("COWD (ESX sparse) disks are not supported"));
            }
            None => {
                return Err(Error::structural(format!(
                    "{} is not a VMDK descriptor or sparse extent",
                    path.display()
                )));
            }
        };

        let data_dir = match &options.extent_data_path {
            Some(dir) => dir.clone(),
            None => match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            },
        };

        let extents =
            ExtentSet::from_descriptor(&descriptor, &data_dir, own_file, options.check_extent_files)?;

        info!(
            "opened {} ({}, {} extents, {} bytes)",
            path.display(),
            descriptor.create_type,
            extents.len(),
            extents.media_size()
        );

        Ok(Self {
            path: path.to_path_buf(),
            data_dir,
            options,
            descriptor,
            extents,
            state: DiskState::Described,
            cursor: 0,
            parent: None,
        })
    }

    /// Open every extent data file and decode the sparse grain indexes.
    ///
    /// Calling this again after success does nothing. On failure no extent is
    /// left open and the disk stays `Described`.
    pub fn open_extent_data_files(&mut self) -> Result<()> {
        if self.state == DiskState::DataReady {
            return Ok(());
        }
        self.extents.open_data_files()?;
        self.state = DiskState::DataReady;
        debug!("{}: extent data files open", self.path.display());
        Ok(())
    }

    /// Path the disk was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> DiskState {
        self.state
    }

    pub fn is_data_ready(&self) -> bool {
        self.state == DiskState::DataReady
    }

    /// Total size of the virtual disk in bytes.
    pub fn media_size(&self) -> u64 {
        self.extents.media_size()
    }

    /// Number of extents.
    pub fn number_of_extents(&self) -> usize {
        self.extents.len()
    }

    /// Extent by 1-based index.
    ///
    /// # Errors
    ///
    /// Returns a bounds error for 0 or an index beyond the extent count.
    pub fn extent(&self, index: usize) -> Result<&Extent> {
        index
            .checked_sub(1)
            .and_then(|i| self.extents.get(i))
            .ok_or_else(|| {
                Error::bounds(format!(
                    "extent index {} out of range 1..={}",
                    index,
                    self.extents.len()
                ))
            })
    }

    /// All extents in logical order.
    pub fn extents(&self) -> &ExtentSet {
        &self.extents
    }

    /// The parsed descriptor.
    pub fn descriptor(&self) -> &VmdkDescriptor {
        &self.descriptor
    }

    pub fn disk_type(&self) -> DiskType {
        self.descriptor.disk_type()
    }

    /// Content identifier (`CID`).
    pub fn content_identifier(&self) -> u32 {
        self.descriptor.cid
    }

    /// Parent content identifier (`parentCID`).
    pub fn parent_content_identifier(&self) -> u32 {
        self.descriptor.parent_cid
    }

    /// Parent file name hint of a delta disk.
    pub fn parent_filename(&self) -> Option<&str> {
        self.descriptor.parent_file_name_hint.as_deref()
    }

    /// Returns true if this disk is a delta of a parent image.
    pub fn has_parent(&self) -> bool {
        self.descriptor.has_parent()
    }

    /// The attached parent image.
    pub fn parent(&self) -> Option<&VirtualDisk> {
        self.parent.as_deref()
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Move the cursor.
    ///
    /// Positions from 0 up to and including the media size are valid.
    ///
    /// # Errors
    ///
    /// Returns a bounds error, leaving the cursor unchanged, for a target
    /// before 0 or beyond the media size.
    pub fn seek_to(&mut self, pos: SeekFrom) -> Result<u64> {
        let media_size = i128::from(self.media_size());
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.cursor) + i128::from(delta),
            SeekFrom::End(delta) => media_size + i128::from(delta),
        };

        if target < 0 {
            return Err(Error::bounds(format!(
                "seek to {} is before the start of the disk",
                target
            )));
        }
        if target > media_size {
            return Err(Error::bounds(format!(
                "seek to {} is beyond the end of the disk ({} bytes)",
                target, media_size
            )));
        }

        self.cursor = target as u64;
        Ok(self.cursor)
    }

    /// Read from the cursor and advance it by the number of bytes read.
    ///
    /// Returns fewer bytes than requested only at the end of the disk.
    pub fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Read from `offset` without moving the cursor.
    ///
    /// Returns fewer bytes than requested only at the end of the disk; an
    /// offset at or past the end yields 0.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` before [`open_extent_data_files`](Self::open_extent_data_files)
    /// succeeded or when a delta disk has no parent attached.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if self.state != DiskState::DataReady {
            return Err(Error::not_open("extent data files are not open"));
        }
        if self.has_parent() && self.parent.is_none() {
            return Err(Error::not_open("parent image of delta disk is not attached"));
        }

        let parent = self.parent.as_deref().map(|p| p as &dyn BackingImage);
        self.extents.read_at(buf, offset, parent)
    }

    /// Attach the parent image of a delta disk.
    ///
    /// # Errors
    ///
    /// Returns a structural error if this disk is not a delta disk or the
    /// parent's content identifier does not match, and `NotOpen` if the
    /// parent's data files are not open.
    pub fn set_parent(&mut self, parent: VirtualDisk) -> Result<()> {
        if !self.has_parent() {
            return Err(Error::structural(format!(
                "{} is not a delta disk",
                self.path.display()
            )));
        }
        if !parent.is_data_ready() {
            return Err(Error::not_open("parent extent data files are not open"));
        }
        if parent.content_identifier() != self.parent_content_identifier() {
            return Err(Error::structural(format!(
                "parent content identifier {:08x} does not match expected {:08x}",
                parent.content_identifier(),
                self.parent_content_identifier()
            )));
        }

        debug!(
            "{}: attached parent {}",
            self.path.display(),
            parent.path.display()
        );
        self.parent = Some(Box::new(parent));
        Ok(())
    }

    /// Open the parent named by `parentFileNameHint`, its data files and its
    /// own parents, and attach it.
    pub fn open_parent(&mut self) -> Result<()> {
        self.open_parent_chain(MAX_PARENT_DEPTH)
    }

    fn open_parent_chain(&mut self, depth: usize) -> Result<()> {
        if depth == 0 {
            return Err(Error::structural("parent chain is too deep"));
        }
        let hint = self
            .parent_filename()
            .ok_or_else(|| Error::structural("delta disk has no parent file name hint"))?;

        let hint_path = Path::new(hint);
        let parent_path = if hint_path.is_absolute() {
            hint_path.to_path_buf()
        } else {
            self.data_dir.join(hint_path)
        };

        let options = OpenOptions {
            extent_data_path: None,
            ..self.options.clone()
        };
        let mut parent = VirtualDisk::open_with(&parent_path, options)?;
        parent.open_extent_data_files()?;
        if parent.has_parent() {
            parent.open_parent_chain(depth - 1)?;
        }
        self.set_parent(parent)
    }
}

impl BackingImage for VirtualDisk {
    fn read_backing(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_at(buf, offset)
    }
}

impl Read for VirtualDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_buffer(buf).map_err(io::Error::from)
    }
}

impl Seek for VirtualDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_to(pos).map_err(io::Error::from)
    }
}

/// Read the descriptor embedded in a sparse extent, or synthesize one.
fn read_embedded_descriptor(path: &Path) -> Result<VmdkDescriptor> {
    let file = MappedFile::open(path)?;
    let data = file.data();
    let header = SparseExtentHeader::from_bytes(data)?;

    match header.descriptor_range() {
        Some(range) => {
            if range.end > data.len() as u64 {
                return Err(Error::structural(format!(
                    "embedded descriptor at {}..{} extends beyond file",
                    range.start, range.end
                )));
            }
            let text = String::from_utf8_lossy(&data[range.start as usize..range.end as usize]);
            parse_descriptor(&text)
        }
        None => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!("{}: no embedded descriptor", path.display());
            Ok(VmdkDescriptor::for_sparse_extent(&name, header.capacity))
        }
    }
}

fn read_descriptor_file(path: &Path) -> Result<VmdkDescriptor> {
    let bytes = fs::read(path).map_err(|e| Error::io(e, path))?;
    parse_descriptor(&String::from_utf8_lossy(&bytes))
}
