//! Synthetic VMDK image builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use vmdktool_core::vmdk::compression::{compress_grain, CompressedGrainHeader};
use vmdktool_core::vmdk::header::{
    SparseExtentHeader, FLAG_COMPRESSED, FLAG_MARKERS, FLAG_ZEROED_GTE, GD_AT_END, SECTOR_SIZE,
};

const SECTOR: usize = SECTOR_SIZE as usize;

fn sectors_for(bytes: usize) -> u64 {
    bytes.div_ceil(SECTOR) as u64
}

fn pad_to_sector(buf: &mut Vec<u8>) {
    let len = buf.len().div_ceil(SECTOR) * SECTOR;
    buf.resize(len, 0);
}

/// Builds a hosted sparse extent file in memory.
///
/// Layout: header, embedded descriptor, grain directory, the grain tables
/// that are needed, then the grains in grain order. Compressed images can
/// put the real header in a footer, like streamOptimized files.
#[derive(Debug, Clone)]
pub struct SparseImageBuilder {
    capacity: u64,
    grain_size: u64,
    num_gtes_per_gt: u32,
    descriptor: Option<String>,
    compressed: bool,
    footer: bool,
    grains: BTreeMap<u64, Vec<u8>>,
    zeroed: Vec<u64>,
}

impl SparseImageBuilder {
    /// A sparse extent of `capacity` sectors with `grain_size`-sector grains.
    pub fn new(capacity: u64, grain_size: u64) -> Self {
        Self {
            capacity,
            grain_size,
            num_gtes_per_gt: 512,
            descriptor: None,
            compressed: false,
            footer: false,
            grains: BTreeMap::new(),
            zeroed: Vec::new(),
        }
    }

    pub fn gtes_per_table(mut self, entries: u32) -> Self {
        self.num_gtes_per_gt = entries;
        self
    }

    pub fn descriptor(mut self, text: &str) -> Self {
        self.descriptor = Some(text.to_string());
        self
    }

    /// Store grains zlib-compressed.
    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    /// Store the grain directory location only in a footer (implies compressed).
    pub fn with_footer(mut self) -> Self {
        self.compressed = true;
        self.footer = true;
        self
    }

    /// Store `data` (zero padded to a grain) as grain `index`.
    pub fn grain(mut self, index: u64, data: &[u8]) -> Self {
        self.grains.insert(index, data.to_vec());
        self
    }

    /// Mark grain `index` as explicitly zeroed.
    pub fn zeroed_grain(mut self, index: u64) -> Self {
        self.zeroed.push(index);
        self
    }

    fn header(&self) -> SparseExtentHeader {
        let mut header = SparseExtentHeader::new(self.capacity, self.grain_size, self.num_gtes_per_gt);
        if !self.zeroed.is_empty() {
            header.flags |= FLAG_ZEROED_GTE;
        }
        if self.compressed {
            header.flags |= FLAG_COMPRESSED;
            header.compress_algorithm = 1;
        }
        if self.footer {
            header.version = 3;
            header.flags |= FLAG_MARKERS;
        }
        header
    }

    pub fn build(&self) -> Vec<u8> {
        let grain_bytes = (self.grain_size * SECTOR_SIZE) as usize;
        let gtes = u64::from(self.num_gtes_per_gt);
        let grain_count = self.capacity.div_ceil(self.grain_size);
        let table_count = grain_count.div_ceil(gtes);

        let descriptor_sectors = self
            .descriptor
            .as_ref()
            .map(|d| sectors_for(d.len()).max(1))
            .unwrap_or(0);
        let gd_sector = 1 + descriptor_sectors;
        let gt_sectors = sectors_for(gtes as usize * 4);

        let mut next_sector = gd_sector + sectors_for(table_count as usize * 4);
        let mut table_sectors: BTreeMap<u64, u64> = BTreeMap::new();
        for table in 0..table_count {
            let used = self
                .grains
                .keys()
                .chain(self.zeroed.iter())
                .any(|g| g / gtes == table);
            if used {
                table_sectors.insert(table, next_sector);
                next_sector += gt_sectors;
            }
        }
        let overhead = next_sector;

        // Grain data
        let mut body = Vec::new();
        let mut entries: BTreeMap<u64, u32> = BTreeMap::new();
        for (&index, data) in &self.grains {
            let sector = overhead + (body.len() / SECTOR) as u64;
            entries.insert(index, sector as u32);

            let mut grain = data.clone();
            grain.resize(grain_bytes, 0);
            if self.compressed {
                let payload = compress_grain(&grain, 6).expect("Failed to compress grain");
                let marker =
                    CompressedGrainHeader::new(index * self.grain_size, payload.len() as u32);
                body.extend_from_slice(&marker.to_bytes());
                body.extend_from_slice(&payload);
            } else {
                body.extend_from_slice(&grain);
            }
            pad_to_sector(&mut body);
        }
        for &index in &self.zeroed {
            entries.insert(index, 1);
        }

        let mut header = self.header();
        header.gd_offset = gd_sector;
        header.overhead = overhead;
        if self.descriptor.is_some() {
            header.descriptor_offset = 1;
            header.descriptor_size = descriptor_sectors;
        }

        let mut file = vec![0u8; overhead as usize * SECTOR];
        if let Some(text) = &self.descriptor {
            file[SECTOR..SECTOR + text.len()].copy_from_slice(text.as_bytes());
        }
        for (&table, &sector) in &table_sectors {
            let gd_at = gd_sector as usize * SECTOR + table as usize * 4;
            file[gd_at..gd_at + 4].copy_from_slice(&(sector as u32).to_le_bytes());
            for (&grain, &entry) in entries.range(table * gtes..(table + 1) * gtes) {
                let at = sector as usize * SECTOR + (grain - table * gtes) as usize * 4;
                file[at..at + 4].copy_from_slice(&entry.to_le_bytes());
            }
        }
        file.extend_from_slice(&body);

        if self.footer {
            let mut start_header = header.clone();
            start_header.gd_offset = GD_AT_END;
            file[..SECTOR].copy_from_slice(&start_header.to_bytes());

            // Footer marker, footer, end-of-stream marker
            let mut marker = vec![0u8; SECTOR];
            marker[0..8].copy_from_slice(&1u64.to_le_bytes());
            marker[12..16].copy_from_slice(&3u32.to_le_bytes());
            file.extend_from_slice(&marker);
            file.extend_from_slice(&header.to_bytes());
            file.extend_from_slice(&[0u8; SECTOR]);
        } else {
            file[..SECTOR].copy_from_slice(&header.to_bytes());
        }

        file
    }

    /// Build and write to `path`.
    pub fn write(&self, path: &Path) -> PathBuf {
        fs::write(path, self.build()).expect("Failed to write sparse image");
        path.to_path_buf()
    }
}

/// Descriptor text for a disk made of `extents` lines.
pub fn descriptor_text(create_type: &str, cid: u32, parent: Option<(u32, &str)>, extents: &[&str]) -> String {
    let mut text = String::from("# Disk DescriptorFile\nversion=1\nencoding=\"UTF-8\"\n");
    text.push_str(&format!("CID={:08x}\n", cid));
    match parent {
        Some((parent_cid, hint)) => {
            text.push_str(&format!("parentCID={:08x}\n", parent_cid));
            text.push_str(&format!("createType=\"{}\"\n", create_type));
            text.push_str(&format!("parentFileNameHint=\"{}\"\n", hint));
        }
        None => {
            text.push_str("parentCID=ffffffff\n");
            text.push_str(&format!("createType=\"{}\"\n", create_type));
        }
    }
    text.push_str("\n# Extent description\n");
    for line in extents {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str("\n# The Disk Data Base\n#DDB\n\nddb.adapterType = \"lsilogic\"\n");
    text
}

/// Write `size` bytes where byte `i` is `(i / 512 + seed) as u8` (each sector
/// filled with one value).
pub fn write_flat(path: &Path, size: usize, seed: u8) -> Vec<u8> {
    let data: Vec<u8> = (0..size)
        .map(|i| ((i / SECTOR) as u8).wrapping_add(seed))
        .collect();
    fs::write(path, &data).expect("Failed to write flat extent");
    data
}

/// The single-extent monolithic sparse image used by the reference test
/// suite: `DE AD BE EF` at 0, `DE AD CA FE` at 512, `DE AD C0 DE` at 1024.
pub fn reference_image(path: &Path) -> PathBuf {
    let mut grain = vec![0u8; 2048];
    grain[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    grain[512..516].copy_from_slice(&[0xDE, 0xAD, 0xCA, 0xFE]);
    grain[1024..1028].copy_from_slice(&[0xDE, 0xAD, 0xC0, 0xDE]);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let descriptor = descriptor_text(
        "monolithicSparse",
        0x4ad3_1d2f,
        None,
        &[&format!("RW 2048 SPARSE \"{}\"", name)],
    );

    SparseImageBuilder::new(2048, 128)
        .descriptor(&descriptor)
        .grain(0, &grain)
        .write(path)
}
