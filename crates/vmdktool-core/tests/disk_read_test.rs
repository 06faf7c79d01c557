//! Integration tests for reading monolithic sparse disks.

mod common;

use std::io::{Read, Seek, SeekFrom};

use common::{reference_image, SparseImageBuilder};
use tempfile::TempDir;
use vmdktool_core::vmdk::{DiskType, ExtentType};
use vmdktool_core::{check_file_signature, ErrorKind, VirtualDisk};

fn open_reference(dir: &TempDir) -> VirtualDisk {
    let path = reference_image(&dir.path().join("LibVMDKTest.vmdk"));
    let mut disk = VirtualDisk::open(&path).expect("Failed to open test image");
    disk.open_extent_data_files()
        .expect("Failed to open extent data files");
    disk
}

#[test]
fn test_reference_image_metadata() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let disk = open_reference(&dir);

    assert_eq!(disk.media_size(), 2048 * 512);
    assert_eq!(disk.number_of_extents(), 1);
    assert_eq!(disk.disk_type(), DiskType::MonolithicSparse);
    assert_eq!(disk.content_identifier(), 0x4ad3_1d2f);
    assert!(!disk.has_parent());

    let extent = disk.extent(1).expect("Failed to get extent 1");
    assert_eq!(extent.filename(), Some("LibVMDKTest.vmdk"));
    assert_eq!(extent.extent_type(), ExtentType::Sparse);
    assert_eq!(extent.sparse_header().map(|h| h.grain_size), Some(128));

    assert_eq!(disk.extent(0).unwrap_err().kind(), ErrorKind::Bounds);
    assert_eq!(disk.extent(2).unwrap_err().kind(), ErrorKind::Bounds);
}

#[test]
fn test_read_from_beginning() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut disk = open_reference(&dir);

    let mut buffer = [0u8; 8];
    assert_eq!(disk.read_buffer(&mut buffer).expect("Failed to read"), 8);
    assert_eq!(buffer, [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(disk.position(), 8);
}

#[test]
fn test_read_from_offset_leaves_cursor() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut disk = open_reference(&dir);
    disk.seek_to(SeekFrom::Start(100)).expect("Failed to seek");

    let mut buffer = [0u8; 8];
    assert_eq!(disk.read_at(&mut buffer, 512).expect("Failed to read"), 8);
    assert_eq!(buffer, [0xDE, 0xAD, 0xCA, 0xFE, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(disk.position(), 100);
}

#[test]
fn test_seek_and_read() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut disk = open_reference(&dir);

    let mut buffer = [0u8; 8];
    assert_eq!(disk.seek_to(SeekFrom::Start(1024)).expect("Failed to seek"), 1024);
    assert_eq!(disk.read_buffer(&mut buffer).expect("Failed to read"), 8);
    assert_eq!(buffer, [0xDE, 0xAD, 0xC0, 0xDE, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn test_file_signature() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = reference_image(&dir.path().join("LibVMDKTest.vmdk"));
    assert!(check_file_signature(&path).expect("Failed to check signature"));
}

#[test]
fn test_seek_read_matches_positioned_read() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut disk = open_reference(&dir);

    for &(offset, len) in &[(0u64, 8usize), (500, 40), (1020, 4096), (65530, 20)] {
        let mut positioned = vec![0u8; len];
        let n = disk.read_at(&mut positioned, offset).expect("Failed to read");

        disk.seek_to(SeekFrom::Start(offset)).expect("Failed to seek");
        let mut sequential = vec![0u8; len];
        let m = disk.read_buffer(&mut sequential).expect("Failed to read");

        assert_eq!(n, m);
        assert_eq!(positioned, sequential, "mismatch at offset {}", offset);
    }
}

#[test]
fn test_repeated_reads_are_identical() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut disk = open_reference(&dir);

    let mut first = vec![0u8; 3000];
    let mut second = vec![0u8; 3000];
    disk.seek_to(SeekFrom::Start(10)).expect("Failed to seek");
    disk.read_buffer(&mut first).expect("Failed to read");
    disk.seek_to(SeekFrom::Start(10)).expect("Failed to seek");
    disk.read_buffer(&mut second).expect("Failed to read");
    assert_eq!(first, second);
}

#[test]
fn test_unallocated_grains_read_as_zero() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let disk = open_reference(&dir);

    // Grain 1 onwards is unallocated
    let mut buffer = vec![0xFFu8; 128 * 512];
    assert_eq!(
        disk.read_at(&mut buffer, 128 * 512).expect("Failed to read"),
        buffer.len()
    );
    assert!(buffer.iter().all(|&b| b == 0));
}

#[test]
fn test_read_past_end_is_short() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut disk = open_reference(&dir);
    let media_size = disk.media_size();

    let mut buffer = vec![0u8; 100];
    assert_eq!(disk.read_at(&mut buffer, media_size - 30).expect("Failed to read"), 30);
    assert_eq!(disk.read_at(&mut buffer, media_size).expect("Failed to read"), 0);
    assert_eq!(disk.read_at(&mut buffer, media_size + 4096).expect("Failed to read"), 0);

    disk.seek_to(SeekFrom::End(-10)).expect("Failed to seek");
    assert_eq!(disk.read_buffer(&mut buffer).expect("Failed to read"), 10);
    assert_eq!(disk.position(), media_size);
    assert_eq!(disk.read_buffer(&mut buffer).expect("Failed to read"), 0);
}

#[test]
fn test_read_before_data_files_open() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = reference_image(&dir.path().join("LibVMDKTest.vmdk"));
    let disk = VirtualDisk::open(&path).expect("Failed to open test image");

    let mut buffer = [0u8; 8];
    let err = disk.read_at(&mut buffer, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotOpen);
    assert_eq!(disk.number_of_extents(), 1);
}

#[test]
fn test_grain_spanning_read() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("span.vmdk");
    SparseImageBuilder::new(64 * 4, 16)
        .gtes_per_table(2)
        .grain(0, &[0x11; 16 * 512])
        .grain(1, &[0x22; 16 * 512])
        .grain(3, &[0x44; 16 * 512])
        .write(&path);

    let mut disk = VirtualDisk::open(&path).expect("Failed to open image");
    disk.open_extent_data_files()
        .expect("Failed to open extent data files");

    let grain = 16 * 512;
    let mut buffer = vec![0u8; grain * 3];
    assert_eq!(
        disk.read_at(&mut buffer, (grain / 2) as u64).expect("Failed to read"),
        buffer.len()
    );
    assert!(buffer[..grain / 2].iter().all(|&b| b == 0x11));
    assert!(buffer[grain / 2..grain + grain / 2].iter().all(|&b| b == 0x22));
    assert!(buffer[grain + grain / 2..2 * grain + grain / 2]
        .iter()
        .all(|&b| b == 0));
    assert!(buffer[2 * grain + grain / 2..].iter().all(|&b| b == 0x44));
}

#[test]
fn test_zeroed_grain_entries() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("zeroed.vmdk");
    SparseImageBuilder::new(32, 16)
        .grain(0, &[0x77; 512])
        .zeroed_grain(1)
        .write(&path);

    let mut disk = VirtualDisk::open(&path).expect("Failed to open image");
    disk.open_extent_data_files()
        .expect("Failed to open extent data files");
    let index = disk
        .extent(1)
        .expect("Failed to get extent")
        .grain_index()
        .expect("Sparse extent has a grain index");
    assert_eq!(index.allocated_grains(), 1);

    let mut buffer = vec![0xFFu8; 16 * 512];
    disk.read_at(&mut buffer, 16 * 512).expect("Failed to read");
    assert!(buffer.iter().all(|&b| b == 0));
}

#[test]
fn test_sparse_without_embedded_descriptor() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("bare.vmdk");
    SparseImageBuilder::new(256, 16)
        .grain(2, b"bare grain")
        .write(&path);

    let mut disk = VirtualDisk::open(&path).expect("Failed to open image");
    assert_eq!(disk.media_size(), 256 * 512);
    assert_eq!(disk.extent(1).expect("Failed to get extent").filename(), Some("bare.vmdk"));

    disk.open_extent_data_files()
        .expect("Failed to open extent data files");
    let mut buffer = [0u8; 10];
    disk.read_at(&mut buffer, 2 * 16 * 512).expect("Failed to read");
    assert_eq!(&buffer, b"bare grain");
}

#[test]
fn test_std_io_traits() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut disk = open_reference(&dir);

    disk.seek(SeekFrom::Start(1024)).expect("Failed to seek");
    let mut buffer = [0u8; 4];
    disk.read_exact(&mut buffer).expect("Failed to read");
    assert_eq!(buffer, [0xDE, 0xAD, 0xC0, 0xDE]);

    let mut all = Vec::new();
    disk.rewind().expect("Failed to rewind");
    disk.read_to_end(&mut all).expect("Failed to read to end");
    assert_eq!(all.len() as u64, disk.media_size());
    assert_eq!(&all[512..516], &[0xDE, 0xAD, 0xCA, 0xFE]);
}

#[test]
fn test_corrupt_grain_directory_fails_data_open() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("corrupt.vmdk");
    let mut image = SparseImageBuilder::new(256, 16).grain(0, b"x").build();
    // Point the grain directory far beyond end of file
    image[56..64].copy_from_slice(&1_000_000u64.to_le_bytes());
    std::fs::write(&path, image).expect("Failed to write image");

    let mut disk = VirtualDisk::open(&path).expect("Metadata open should succeed");
    let err = disk.open_extent_data_files().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert!(!disk.is_data_ready());
}

#[test]
fn test_missing_grain_directory_fails_data_open() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("no-gd.vmdk");
    let mut image = SparseImageBuilder::new(256, 16).grain(0, b"x").build();
    image[56..64].copy_from_slice(&0u64.to_le_bytes());
    std::fs::write(&path, image).expect("Failed to write image");

    let mut disk = VirtualDisk::open(&path).expect("Metadata open should succeed");
    let err = disk.open_extent_data_files().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert!(err.to_string().contains("missing primary grain directory offset"));
}
