//! Sentinel-style handle for language bindings.
//!
//! [`Handle`] wraps a [`VirtualDisk`] behind the calling convention bindings
//! expect: numeric results use `-1` for failure, the failure text is kept
//! in [`Handle::error`], and invalid extent lookups return an
//! [`ExtentHandle`] carrying its own error instead of nothing.

use std::io::SeekFrom;
use std::path::Path;

use crate::disk::VirtualDisk;
use crate::error::{Error, Result};
use crate::signature;

/// Origin of a [`Handle::seek`] offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the disk.
    Set,
    /// From the current position.
    Cur,
    /// From the end of the disk.
    End,
}

impl Whence {
    /// Decode the conventional `SEEK_SET`/`SEEK_CUR`/`SEEK_END` values.
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// Extent as seen through a [`Handle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentHandle {
    filename: String,
    error: String,
}

impl ExtentHandle {
    /// File name declared for the extent (empty for ZERO extents or on error).
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Error text; empty when the extent was looked up successfully.
    pub fn error(&self) -> &str {
        &self.error
    }
}

#[derive(Debug, Default)]
enum HandleState {
    #[default]
    Closed,
    Failed,
    Open(VirtualDisk),
}

/// A disk handle with sentinel return values.
#[derive(Debug, Default)]
pub struct Handle {
    state: HandleState,
    last_error: String,
}

impl Handle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a disk. Returns 1 on success, -1 on failure.
    pub fn open(&mut self, path: impl AsRef<Path>) -> i32 {
        match VirtualDisk::open(path) {
            Ok(disk) => {
                self.state = HandleState::Open(disk);
                self.last_error.clear();
                1
            }
            Err(e) => {
                self.state = HandleState::Failed;
                self.last_error = e.to_string();
                -1
            }
        }
    }

    /// Open the extent data files. Returns 1 on success, -1 on failure.
    pub fn open_extent_data_files(&mut self) -> i32 {
        let result = self.disk_mut().and_then(VirtualDisk::open_extent_data_files);
        self.record(result.map(|_| 1))
    }

    /// Media size in bytes, or -1.
    pub fn media_size(&mut self) -> i64 {
        let result = self.disk().map(|d| d.media_size() as i64);
        self.record(result)
    }

    /// Number of extents: 0 if never opened, -1 after a failed open.
    pub fn number_of_extents(&mut self) -> i32 {
        match &self.state {
            HandleState::Closed => 0,
            HandleState::Failed => -1,
            HandleState::Open(disk) => {
                let count = disk.number_of_extents() as i32;
                self.last_error.clear();
                count
            }
        }
    }

    /// Extent by 1-based index. A failed lookup sets the error text of both
    /// the returned extent and the handle.
    pub fn extent(&mut self, index: i32) -> ExtentHandle {
        let lookup = self.disk().and_then(|disk| {
            let index = usize::try_from(index)
                .map_err(|_| Error::bounds(format!("extent index {} out of range", index)))?;
            disk.extent(index)
                .map(|e| e.filename().unwrap_or_default().to_string())
        });
        match lookup {
            Ok(filename) => {
                self.last_error.clear();
                ExtentHandle {
                    filename,
                    error: String::new(),
                }
            }
            Err(e) => {
                self.last_error = e.to_string();
                ExtentHandle {
                    filename: String::new(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Read at the cursor. Returns the byte count or -1.
    pub fn read(&mut self, buf: &mut [u8]) -> i64 {
        let result = self.disk_mut().and_then(|d| d.read_buffer(buf));
        self.record(result.map(|n| n as i64))
    }

    /// Read at `offset` without moving the cursor. Returns the byte count or -1.
    pub fn read_offset(&mut self, buf: &mut [u8], offset: i64) -> i64 {
        let result = self.disk().and_then(|d| {
            let offset = u64::try_from(offset)
                .map_err(|_| Error::bounds(format!("negative read offset {}", offset)))?;
            d.read_at(buf, offset)
        });
        self.record(result.map(|n| n as i64))
    }

    /// Move the cursor. Returns the new position or -1.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> i64 {
        let pos = match whence {
            Whence::Set => match u64::try_from(offset) {
                Ok(o) => SeekFrom::Start(o),
                Err(_) => {
                    return self.record(Err(Error::bounds(format!(
                        "seek to {} is before the start of the disk",
                        offset
                    ))))
                }
            },
            Whence::Cur => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        let result = self.disk_mut().and_then(|d| d.seek_to(pos));
        self.record(result.map(|p| p as i64))
    }

    /// Probe `path` for a VMDK signature. An unopenable path gives `false`
    /// and sets the error text.
    pub fn check_file_signature(&mut self, path: impl AsRef<Path>) -> bool {
        let result = signature::check_file_signature(path);
        match result {
            Ok(found) => {
                self.last_error.clear();
                found
            }
            Err(e) => {
                self.last_error = e.to_string();
                false
            }
        }
    }

    /// Error text of the last failed call; empty after a successful call.
    pub fn error(&self) -> &str {
        &self.last_error
    }

    /// Release the disk and all its extents.
    pub fn close(&mut self) {
        self.state = HandleState::Closed;
        self.last_error.clear();
    }

    /// The wrapped disk, when open.
    pub fn disk(&self) -> Result<&VirtualDisk> {
        match &self.state {
            HandleState::Open(disk) => Ok(disk),
            _ => Err(Error::not_open("disk is not open")),
        }
    }

    fn disk_mut(&mut self) -> Result<&mut VirtualDisk> {
        match &mut self.state {
            HandleState::Open(disk) => Ok(disk),
            _ => Err(Error::not_open("disk is not open")),
        }
    }

    fn record<T: From<i8>>(&mut self, result: Result<T>) -> T {
        match result {
            Ok(value) => {
                self.last_error.clear();
                value
            }
            Err(e) => {
                self.last_error = e.to_string();
                T::from(-1)
            }
        }
    }
}
