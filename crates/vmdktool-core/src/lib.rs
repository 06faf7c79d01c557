//! vmdktool Core Library
//!
//! This crate reads VMware virtual disks (VMDK) and exposes them as a linear,
//! randomly addressable byte stream.
//!
//! # Overview
//!
//! A disk is described by a text descriptor (standalone, or embedded in a
//! sparse extent) listing its extents. Each extent is a flat file region, a
//! sparse grain-indexed file (optionally zlib-compressed), or an implicit
//! zero range. [`VirtualDisk`] resolves logical offsets to extents and
//! extents to file data, zero-filling unallocated grains and reading through
//! to the parent image of delta disks.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`signature`] - Cheap VMDK signature check
//! - [`vmdk`] - Descriptor, sparse header, grain index and extent handling
//! - [`disk`] - The virtual disk handle
//! - [`handle`] - Sentinel-style adapter for language bindings
//! - [`scan`] - Parallel whole-media hashing
//!
//! # Quick Start
//!
//! ```no_run
//! use vmdktool_core::VirtualDisk;
//!
//! let mut disk = VirtualDisk::open("/path/to/disk.vmdk").unwrap();
//! disk.open_extent_data_files().unwrap();
//!
//! let mut buf = vec![0u8; 4096];
//! let n = disk.read_at(&mut buf, 0).unwrap();
//! println!("read {} of {} bytes", n, disk.media_size());
//! ```

pub mod disk;
pub mod error;
pub mod handle;
pub mod scan;
pub mod signature;
pub mod vmdk;

pub use error::{Error, ErrorKind, Result};

// Re-export the disk surface for convenience
pub use disk::{DiskState, OpenOptions, VirtualDisk};
pub use handle::{ExtentHandle, Handle, Whence};
pub use scan::{scan_media, MediaSummary, ProgressCallback, ScanOptions, ScanProgress};
pub use signature::{check_file_signature, FileType};
