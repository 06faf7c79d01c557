//! Whole-media scan.
//!
//! Reads the full virtual disk in fixed-size chunks, in parallel batches on a
//! rayon pool, and folds the chunks in order into a SHA-256 digest while
//! counting all-zero chunks.

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::disk::VirtualDisk;
use crate::error::{Error, Result};

/// Default chunk size for scanning (4 MB).
pub const DEFAULT_SCAN_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Options for [`scan_media`].
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Size of chunks to read (default 4 MB).
    pub chunk_size: usize,
    /// Number of threads to use (0 = auto).
    pub num_threads: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_SCAN_CHUNK_SIZE,
            num_threads: 0,
        }
    }
}

impl ScanOptions {
    /// Create scan options with specified settings.
    pub fn new(chunk_size: usize, num_threads: usize) -> Self {
        Self {
            chunk_size,
            num_threads,
        }
    }
}

/// Progress information for a scan.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    /// Bytes processed so far.
    pub bytes_processed: u64,
    /// Total bytes to process.
    pub bytes_total: u64,
}

impl ScanProgress {
    /// Calculate percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(ScanProgress) + Send>;

/// Result of a media scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSummary {
    /// SHA-256 of the media contents.
    pub sha256: [u8; 32],
    /// Number of bytes read.
    pub bytes: u64,
    /// Number of chunks read.
    pub chunks: u64,
    /// Number of chunks containing only zero bytes.
    pub zero_chunks: u64,
}

impl MediaSummary {
    /// Lowercase hex rendering of the digest.
    pub fn sha256_hex(&self) -> String {
        self.sha256.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Scan the whole media of a data-ready disk.
///
/// # Errors
///
/// Returns `NotOpen` if the disk's data files are not open, and the first
/// read error otherwise.
pub fn scan_media(
    disk: &VirtualDisk,
    options: &ScanOptions,
    progress_callback: Option<ProgressCallback>,
) -> Result<MediaSummary> {
    if !disk.is_data_ready() {
        return Err(Error::not_open("extent data files are not open"));
    }
    if options.chunk_size == 0 {
        return Err(Error::bounds("scan chunk size must be positive"));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.num_threads)
        .build()
        .map_err(|e| Error::io_simple(std::io::Error::other(e)))?;

    let media_size = disk.media_size();
    let chunk_size = options.chunk_size as u64;
    let total_chunks = media_size.div_ceil(chunk_size);
    let batch = pool.current_num_threads().max(1) as u64 * 2;

    let mut hasher = Sha256::new();
    let mut summary = MediaSummary {
        sha256: [0u8; 32],
        bytes: 0,
        chunks: 0,
        zero_chunks: 0,
    };

    let mut first = 0u64;
    while first < total_chunks {
        let last = (first + batch).min(total_chunks);

        let chunks: Vec<Vec<u8>> = pool.install(|| {
            (first..last)
                .into_par_iter()
                .map(|index| -> Result<Vec<u8>> {
                    let offset = index * chunk_size;
                    let len = chunk_size.min(media_size - offset) as usize;
                    let mut chunk = vec![0u8; len];
                    let n = disk.read_at(&mut chunk, offset)?;
                    chunk.truncate(n);
                    Ok(chunk)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        for chunk in &chunks {
            hasher.update(chunk);
            summary.bytes += chunk.len() as u64;
            summary.chunks += 1;
            if chunk.iter().all(|&b| b == 0) {
                summary.zero_chunks += 1;
            }
        }

        if let Some(ref callback) = progress_callback {
            callback(ScanProgress {
                bytes_processed: summary.bytes,
                bytes_total: media_size,
            });
        }

        first = last;
    }

    summary.sha256 = hasher.finalize().into();
    Ok(summary)
}
