//! Ordered extents covering the whole virtual disk.

use std::path::{Path, PathBuf};

use log::debug;

use super::descriptor::{ExtentType, VmdkDescriptor};
use super::extent::{BackingImage, Extent};
use crate::error::{Error, Result};

/// A piece of a logical range that falls inside one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentSpan {
    /// Zero-based index of the extent.
    pub extent: usize,
    /// Offset within the extent in bytes.
    pub extent_offset: u64,
    /// Length of the piece in bytes.
    pub length: u64,
}

/// The extents of a disk, ordered by logical offset, covering
/// `[0, media_size)` without gaps or overlaps.
#[derive(Debug)]
pub struct ExtentSet {
    extents: Vec<Extent>,
    media_size: u64,
}

impl ExtentSet {
    /// Build the extent set of a descriptor.
    ///
    /// Relative extent file names resolve against `data_dir`. When `own_file`
    /// is given (the disk was opened from a sparse extent carrying its own
    /// descriptor) a single SPARSE extent is backed by that file whatever name
    /// the descriptor declares.
    ///
    /// # Errors
    ///
    /// Returns a structural error when the extent layout is invalid or, with
    /// `check_files`, when a referenced extent file does not exist.
    pub fn from_descriptor(
        descriptor: &VmdkDescriptor,
        data_dir: &Path,
        own_file: Option<&Path>,
        check_files: bool,
    ) -> Result<Self> {
        descriptor.validate()?;

        let single_sparse = descriptor.extents.len() == 1
            && descriptor.extents[0].extent_type == ExtentType::Sparse;

        let mut extents = Vec::with_capacity(descriptor.extents.len());
        for entry in &descriptor.extents {
            let path = match (&entry.filename, own_file) {
                _ if !entry.extent_type.has_file() => None,
                (_, Some(own)) if single_sparse => Some(own.to_path_buf()),
                (Some(name), _) => Some(resolve_extent_path(data_dir, name)),
                (None, _) => None,
            };

            if check_files {
                if let Some(path) = &path {
                    if !path.exists() {
                        return Err(Error::structural(format!(
                            "extent file not found: {}",
                            path.display()
                        )));
                    }
                }
            }

            extents.push(Extent::new(entry.clone(), path));
        }

        let media_size = descriptor.disk_size_bytes();
        debug!(
            "extent set: {} extents, {} bytes",
            extents.len(),
            media_size
        );

        Ok(Self {
            extents,
            media_size,
        })
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Extent at zero-based `index`.
    pub fn get(&self, index: usize) -> Option<&Extent> {
        self.extents.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    /// Sum of the extent sizes in bytes.
    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    /// Returns true once every extent's data is open.
    pub fn is_data_ready(&self) -> bool {
        self.extents.iter().all(Extent::is_data_ready)
    }

    /// Open the data of every extent.
    ///
    /// Either every extent becomes data-ready or none changes state; files
    /// opened before a failure are released.
    pub fn open_data_files(&mut self) -> Result<()> {
        let loaded = self
            .extents
            .iter()
            .map(Extent::load_data)
            .collect::<Result<Vec<_>>>()?;

        for (extent, data) in self.extents.iter_mut().zip(loaded) {
            extent.attach(data);
        }
        Ok(())
    }

    /// Split the logical range `[offset, offset + length)` into per-extent
    /// pieces, in order. The part beyond the media size is omitted.
    pub fn resolve(&self, offset: u64, length: u64) -> Vec<ExtentSpan> {
        let end = offset.saturating_add(length).min(self.media_size);
        let mut spans = Vec::new();
        if offset >= end {
            return spans;
        }

        let mut index = self
            .extents
            .partition_point(|e| e.logical_offset() + e.size() <= offset);
        let mut pos = offset;

        while pos < end && index < self.extents.len() {
            let extent = &self.extents[index];
            let extent_offset = pos - extent.logical_offset();
            let length = (extent.size() - extent_offset).min(end - pos);
            spans.push(ExtentSpan {
                extent: index,
                extent_offset,
                length,
            });
            pos += length;
            index += 1;
        }

        spans
    }

    /// Read into `buf` from logical `offset`, across extent boundaries.
    ///
    /// Returns the number of bytes produced, fewer than `buf.len()` only at
    /// the end of the media.
    pub fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
        parent: Option<&dyn BackingImage>,
    ) -> Result<usize> {
        let mut total = 0usize;
        for span in self.resolve(offset, buf.len() as u64) {
            let out = &mut buf[total..total + span.length as usize];
            let n = self.extents[span.extent].read_at(out, span.extent_offset, parent)?;
            total += n;
            if n < out.len() {
                break;
            }
        }
        Ok(total)
    }
}

fn resolve_extent_path(data_dir: &Path, name: &str) -> PathBuf {
    let name = Path::new(name);
    if name.is_absolute() {
        name.to_path_buf()
    } else {
        data_dir.join(name)
    }
}
