//! File signature detection.
//!
//! A cheap discriminator looking at the start of a file: sparse extents are
//! recognised by their magic, descriptor files by the `# Disk DescriptorFile`
//! line. Nothing beyond that prefix is validated.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::vmdk::descriptor::has_descriptor_signature;
use crate::vmdk::header::{COWD_MAGIC, VMDK_MAGIC};

/// Number of bytes read to look for a descriptor signature.
pub const SIGNATURE_READ_SIZE: usize = 512;

/// Kind of VMDK file recognised by [`detect_file_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Hosted sparse extent (`KDMV`).
    VmdkSparse,
    /// ESX sparse extent (`COWD`).
    CowdSparse,
    /// Text descriptor file.
    Descriptor,
}

/// Classify a file from its first bytes.
pub fn detect_file_type(data: &[u8]) -> Option<FileType> {
    if data.len() >= 4 {
        match u32::from_le_bytes([data[0], data[1], data[2], data[3]]) {
            VMDK_MAGIC => return Some(FileType::VmdkSparse),
            COWD_MAGIC => return Some(FileType::CowdSparse),
            _ => {}
        }
    }

    let text = String::from_utf8_lossy(data);
    if has_descriptor_signature(&text) {
        Some(FileType::Descriptor)
    } else {
        None
    }
}

/// Read up to [`SIGNATURE_READ_SIZE`] bytes from the start of `path`.
///
/// A read failure after the file was opened yields the bytes read so far.
///
/// # Errors
///
/// Returns an I/O error only if the file cannot be opened.
pub fn read_signature_bytes(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut data = Vec::with_capacity(SIGNATURE_READ_SIZE);
    let mut reader = file.take(SIGNATURE_READ_SIZE as u64);
    if let Err(e) = reader.read_to_end(&mut data) {
        log::debug!("{}: signature read failed: {}", path.display(), e);
    }
    Ok(data)
}

/// Returns true if `path` starts with a known VMDK signature.
///
/// Short or unreadable contents give `false`.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened.
pub fn check_file_signature(path: impl AsRef<Path>) -> Result<bool> {
    let data = read_signature_bytes(path.as_ref())?;
    Ok(detect_file_type(&data).is_some())
}
