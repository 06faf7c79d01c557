//! Memory-mapped extent files.
//!
//! Extent data files are mapped read-only so that grain tables and grains can
//! be addressed as slices and positioned reads need no shared file cursor.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A read-only memory-mapped file.
///
/// Cloning is cheap; clones share the mapping.
#[derive(Debug, Clone)]
pub struct MappedFile {
    /// The memory-mapped file data. `None` for empty files.
    mmap: Option<Arc<Mmap>>,
    /// The size of the file in bytes.
    size: u64,
    path: PathBuf,
}

impl MappedFile {
    /// Opens a file and maps it into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist
    /// - The file cannot be opened (permissions, etc.)
    /// - Memory mapping fails
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        let metadata = file.metadata().map_err(|e| Error::io(e, path))?;
        let size = metadata.len();

        // mmap doesn't work with empty files
        if size == 0 {
            return Ok(Self {
                mmap: None,
                size: 0,
                path: path.to_path_buf(),
            });
        }

        // Safety: We're mapping a read-only file that we just opened.
        // The file will remain valid for the lifetime of the Mmap.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self {
            mmap: Some(Arc::new(mmap)),
            size,
            path: path.to_path_buf(),
        })
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a reference to the raw memory-mapped data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..],
            None => &[],
        }
    }

    /// Copy bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, which is less than `buf.len()` only
    /// when the file ends first.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.data();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        len
    }
}
