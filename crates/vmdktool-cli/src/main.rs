//! vmdktool CLI - Inspect and read VMware virtual disks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use vmdktool_core::{
    check_file_signature, scan_media, ProgressCallback, ScanOptions, ScanProgress, VirtualDisk,
};

/// Read-only access to VMware VMDK virtual disks.
#[derive(Parser)]
#[command(name = "vmdktool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display information about a virtual disk.
    Info {
        /// Path to the descriptor or sparse extent file.
        path: PathBuf,
    },

    /// Check whether a file carries a VMDK signature.
    Check {
        /// File to check.
        path: PathBuf,
    },

    /// Hex dump a range of the virtual disk.
    Read {
        /// Path to the descriptor or sparse extent file.
        path: PathBuf,

        /// Logical byte offset to start at.
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Number of bytes to dump.
        #[arg(long, default_value = "512")]
        length: usize,
    },

    /// Write the virtual disk contents to a raw image.
    Export {
        /// Path to the descriptor or sparse extent file.
        path: PathBuf,

        /// Output raw image path.
        #[arg(short, long)]
        output: PathBuf,

        /// Chunk size in megabytes for copying.
        #[arg(long, default_value = "4")]
        chunk_size: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Compute the SHA-256 of the virtual disk contents.
    Hash {
        /// Path to the descriptor or sparse extent file.
        path: PathBuf,

        /// Number of threads to use (0 = auto-detect).
        #[arg(short, long, default_value = "0")]
        threads: usize,

        /// Chunk size in megabytes for reading.
        #[arg(long, default_value = "4")]
        chunk_size: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info { path } => show_info(&path)?,
        Commands::Check { path } => run_check(&path)?,
        Commands::Read {
            path,
            offset,
            length,
        } => run_read(&path, offset, length)?,
        Commands::Export {
            path,
            output,
            chunk_size,
            quiet,
        } => run_export(&path, &output, chunk_size, quiet)?,
        Commands::Hash {
            path,
            threads,
            chunk_size,
            quiet,
        } => run_hash(&path, threads, chunk_size, quiet)?,
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Open a disk, its extent data files and, for delta disks, its parents.
fn open_disk(path: &Path) -> Result<VirtualDisk> {
    let mut disk =
        VirtualDisk::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    disk.open_extent_data_files()
        .with_context(|| format!("Failed to open extent data files of {}", path.display()))?;
    if disk.has_parent() {
        disk.open_parent()
            .with_context(|| format!("Failed to open parent of {}", path.display()))?;
        info!("opened parent chain of {}", path.display());
    }
    Ok(disk)
}

fn show_info(path: &Path) -> Result<()> {
    let disk =
        VirtualDisk::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let descriptor = disk.descriptor();

    println!("Disk Information");
    println!("================");
    println!();
    println!("Type:      {}", descriptor.create_type);
    println!("CID:       {:08x}", disk.content_identifier());
    if disk.has_parent() {
        println!("Parent:    {}", disk.parent_filename().unwrap_or("(no hint)"));
        println!("ParentCID: {:08x}", disk.parent_content_identifier());
    }
    println!(
        "Size:      {} ({} bytes)",
        format_bytes(disk.media_size()),
        disk.media_size()
    );
    if descriptor.cylinders > 0 {
        println!(
            "Geometry:  {}/{}/{}",
            descriptor.cylinders, descriptor.heads, descriptor.sectors
        );
    }
    if !descriptor.adapter_type.is_empty() {
        println!("Adapter:   {}", descriptor.adapter_type);
    }
    println!();

    println!("Extents:");
    for (i, extent) in disk.extents().iter().enumerate() {
        println!(
            "  {}. {:?} {:?} {} at {} - {}",
            i + 1,
            extent.access(),
            extent.extent_type(),
            extent.filename().unwrap_or("-"),
            extent.logical_offset(),
            format_bytes(extent.size())
        );
    }

    Ok(())
}

fn run_check(path: &Path) -> Result<()> {
    if !check_file_signature(path)? {
        bail!("{}: no VMDK signature", path.display());
    }
    println!("{}: VMDK signature found", path.display());
    Ok(())
}

fn run_read(path: &Path, offset: u64, length: usize) -> Result<()> {
    let disk = open_disk(path)?;

    let mut buffer = vec![0u8; length];
    let n = disk.read_at(&mut buffer, offset)?;
    buffer.truncate(n);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    hex_dump(&mut out, offset, &buffer)?;
    Ok(())
}

fn run_export(path: &Path, output: &Path, chunk_size_mb: usize, quiet: bool) -> Result<()> {
    let mut disk = open_disk(path)?;
    let media_size = disk.media_size();

    if !quiet {
        println!("Disk:      {}", path.display());
        println!("Size:      {}", format_bytes(media_size));
        println!("Output:    {}", output.display());
        println!();
    }

    let progress_bar = if quiet {
        None
    } else {
        Some(progress_bar(media_size)?)
    };

    let file = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let mut buffer = vec![0u8; chunk_size_mb.max(1) * 1024 * 1024];

    loop {
        let n = disk.read_buffer(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        if let Some(pb) = &progress_bar {
            pb.set_position(disk.position());
        }
    }
    writer.flush()?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Complete!");
    }
    if !quiet {
        println!();
        println!("Export completed successfully: {}", output.display());
    }

    Ok(())
}

fn run_hash(path: &Path, threads: usize, chunk_size_mb: usize, quiet: bool) -> Result<()> {
    let disk = open_disk(path)?;
    let options = ScanOptions::new(chunk_size_mb.max(1) * 1024 * 1024, threads);

    let progress_bar = if quiet {
        None
    } else {
        Some(progress_bar(disk.media_size())?)
    };
    let callback: Option<ProgressCallback> = progress_bar.clone().map(|pb| {
        Box::new(move |progress: ScanProgress| pb.set_position(progress.bytes_processed))
            as ProgressCallback
    });

    let summary = scan_media(&disk, &options, callback)?;

    if let Some(pb) = progress_bar {
        pb.finish_and_clear();
    }

    println!("{}  {}", summary.sha256_hex(), path.display());
    if !quiet {
        println!(
            "{} read, {} of {} chunks empty",
            format_bytes(summary.bytes),
            summary.zero_chunks,
            summary.chunks
        );
    }

    Ok(())
}

fn progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
        .progress_chars("#>-");
    pb.set_style(style);
    Ok(pb)
}

/// Write `data` as 16-byte rows of offset, hex and printable ASCII.
fn hex_dump(out: &mut impl Write, base: u64, data: &[u8]) -> std::io::Result<()> {
    for (row, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        writeln!(
            out,
            "{:010x}  {:<47}  |{}|",
            base + (row * 16) as u64,
            hex.join(" "),
            ascii
        )?;
    }
    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
