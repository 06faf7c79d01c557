//! Grain directory and grain table decoding.
//!
//! A sparse extent maps grains through two levels: the grain directory holds
//! sector offsets of grain tables, and each grain table holds sector offsets
//! of grains. Both levels are decoded once into a [`GrainIndex`]; tables are
//! copied into one contiguous arena and the directory keeps each table's
//! start index within it.

use std::collections::HashMap;

use log::debug;

use super::header::{SparseExtentHeader, SECTOR_SIZE};
use crate::error::{Error, Result};

/// Where the data of one grain lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainLocation {
    /// Not stored in this extent; reads as zero (or from the parent image).
    Unallocated,
    /// Explicitly zeroed; reads as zero even in a delta image.
    Zeroed,
    /// Stored at this sector of the extent file.
    Allocated { sector: u64 },
}

#[derive(Debug, Clone, Copy)]
struct TableSlot {
    start: usize,
    len: usize,
}

/// Flattened grain number to grain location mapping for one sparse extent.
#[derive(Debug, Clone)]
pub struct GrainIndex {
    grain_size_bytes: u64,
    entries_per_table: u64,
    grain_count: u64,
    zeroed_entries: bool,
    /// Per directory entry: its table's range in `arena`, or `None` when the
    /// directory entry is zero.
    directory: Vec<Option<TableSlot>>,
    arena: Vec<u32>,
}

impl GrainIndex {
    /// Decode the grain directory named by `header` and every grain table it
    /// references from the extent file contents.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the grain directory or any referenced
    /// grain table lies outside the file.
    pub fn decode(file: &[u8], header: &SparseExtentHeader) -> Result<Self> {
        let grain_count = header.grain_count();
        let entries_per_table = u64::from(header.num_gtes_per_gt).min(grain_count.max(1));
        let table_count = header.gd_entry_count();

        let gd_start = header
            .active_gd_offset()?
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| Error::structural("grain directory offset overflows"))?;
        let gd_bytes = read_region(file, gd_start, table_count, "grain directory")?;

        let mut directory = Vec::with_capacity(table_count as usize);
        let mut arena: Vec<u32> = Vec::new();
        // Tables referenced more than once share their arena slot.
        let mut seen: HashMap<u32, TableSlot> = HashMap::new();

        for (table, entry) in gd_bytes.chunks_exact(4).enumerate() {
            let gt_sector = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            if gt_sector == 0 {
                directory.push(None);
                continue;
            }
            if let Some(&slot) = seen.get(&gt_sector) {
                directory.push(Some(slot));
                continue;
            }

            let first_grain = table as u64 * entries_per_table;
            let entries = entries_per_table.min(grain_count - first_grain);
            let gt_start = u64::from(gt_sector) * SECTOR_SIZE;
            let gt_bytes = read_region(file, gt_start, entries, "grain table")?;

            let start = arena.len();
            arena.extend(
                gt_bytes
                    .chunks_exact(4)
                    .map(|e| u32::from_le_bytes([e[0], e[1], e[2], e[3]])),
            );
            let slot = TableSlot {
                start,
                len: arena.len() - start,
            };
            seen.insert(gt_sector, slot);
            directory.push(Some(slot));
        }

        debug!(
            "decoded grain index: {} grains, {} tables, {} distinct tables loaded",
            grain_count,
            table_count,
            seen.len()
        );

        Ok(Self {
            grain_size_bytes: header.grain_size_bytes(),
            entries_per_table,
            grain_count,
            zeroed_entries: header.has_zeroed_grain_entries(),
            directory,
            arena,
        })
    }

    /// Look up the location of `grain`.
    ///
    /// Grains beyond the indexed range are unallocated.
    pub fn lookup(&self, grain: u64) -> GrainLocation {
        if grain >= self.grain_count {
            return GrainLocation::Unallocated;
        }
        let table = (grain / self.entries_per_table) as usize;
        let slot = (grain % self.entries_per_table) as usize;

        let entry = match self.directory.get(table).copied().flatten() {
            // A shared table loaded for a short final slot may be narrower.
            Some(t) if slot < t.len => self.arena[t.start + slot],
            _ => return GrainLocation::Unallocated,
        };

        match entry {
            0 => GrainLocation::Unallocated,
            1 if self.zeroed_entries => GrainLocation::Zeroed,
            sector => GrainLocation::Allocated {
                sector: u64::from(sector),
            },
        }
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size_bytes
    }

    /// Number of grains covered by the index.
    pub fn grain_count(&self) -> u64 {
        self.grain_count
    }

    /// Number of grains stored in the extent file.
    pub fn allocated_grains(&self) -> u64 {
        (0..self.grain_count)
            .filter(|&g| matches!(self.lookup(g), GrainLocation::Allocated { .. }))
            .count() as u64
    }
}

/// Borrow `entries` little-endian u32 values starting at byte `start`.
fn read_region<'a>(file: &'a [u8], start: u64, entries: u64, what: &str) -> Result<&'a [u8]> {
    let end = entries
        .checked_mul(4)
        .and_then(|len| start.checked_add(len))
        .filter(|&end| end <= file.len() as u64)
        .ok_or_else(|| {
            Error::structural(format!(
                "{} at byte {} ({} entries) extends beyond file",
                what, start, entries
            ))
        })?;
    Ok(&file[start as usize..end as usize])
}
