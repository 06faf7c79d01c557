//! VMDK format handling.
//!
//! This module provides the building blocks of a virtual disk: descriptor
//! parsing, the sparse extent header, grain compression, grain index
//! decoding, extents and the ordered extent set.

pub mod compression;
pub mod descriptor;
pub mod extent;
pub mod extent_set;
pub mod grain_table;
pub mod header;
pub mod reader;

pub use compression::{compress_grain, CompressedGrainHeader, CompressionMethod};
pub use descriptor::{
    parse_descriptor, AccessMode, DiskType, ExtentDescriptor, ExtentType, VmdkDescriptor,
};
pub use extent::{BackingImage, Extent};
pub use extent_set::{ExtentSet, ExtentSpan};
pub use grain_table::{GrainIndex, GrainLocation};
pub use header::{SparseExtentHeader, SECTOR_SIZE, VMDK_MAGIC};
pub use reader::MappedFile;
