use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use led_matrix_display::ota::bundle::{encode_header, parse_header, BundleHeader, HEADER_SIZE};

// Stock partition table: 0x1E0000 per app slot, 0x80000 filesystem
const APP_SLOT_SIZE: usize = 0x1E0000;
const FS_PARTITION_SIZE: usize = 0x80000;
const WRITE_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "bundle")]
#[command(about = "LED Matrix LMWB bundle tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Combine a firmware and a filesystem image into one bundle
    Pack {
        /// Application image (.bin)
        #[arg(short, long)]
        firmware: PathBuf,

        /// LittleFS image (.bin)
        #[arg(short = 's', long)]
        filesystem: PathBuf,

        /// Output bundle path
        #[arg(short, long, default_value = "bundle.bin")]
        output: PathBuf,
    },
    /// Print a bundle's header and check its length
    Inspect {
        bundle: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Pack {
            firmware,
            filesystem,
            output,
        } => pack(&firmware, &filesystem, &output),
        Command::Inspect { bundle } => inspect(&bundle),
    };
    if let Err(e) = result {
        eprintln!("{} {}", "❌".red(), e);
        std::process::exit(1);
    }
}

fn read(path: &Path, what: &str) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|e| format!("Failed to read {} {}: {}", what, path.display(), e))
}

fn pack(firmware: &Path, filesystem: &Path, output: &Path) -> Result<(), String> {
    let app = read(firmware, "firmware")?;
    let fs_image = read(filesystem, "filesystem")?;
    let bundle = build_bundle(&app, &fs_image)?;

    println!("{} Packing LMWB bundle", "📦".blue());
    println!("{}Firmware:   {} bytes", "   ".dimmed(), app.len());
    println!("{}Filesystem: {} bytes", "   ".dimmed(), fs_image.len());
    if app.len() > APP_SLOT_SIZE || fs_image.len() > FS_PARTITION_SIZE {
        println!(
            "{} Larger than the stock partition layout, the device may refuse it",
            "⚠️".yellow()
        );
    }

    let mut file = fs::File::create(output)
        .map_err(|e| format!("Failed to create {}: {}", output.display(), e))?;
    let pb = ProgressBar::new(bundle.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .map_err(|e| e.to_string())?
            .progress_chars("#>-"),
    );
    for chunk in bundle.chunks(WRITE_CHUNK) {
        file.write_all(chunk)
            .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    println!(
        "{} Wrote {} ({} bytes)",
        "✅".green(),
        output.display(),
        bundle.len()
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<(), String> {
    let data = read(path, "bundle")?;
    let header = check_bundle(&data)?;

    println!("{} {}", "🔍".blue(), path.display());
    println!("{}Firmware:   {} bytes", "   ".dimmed(), header.app_size);
    println!("{}Filesystem: {} bytes", "   ".dimmed(), header.fs_size);
    println!("{}Total:      {} bytes", "   ".dimmed(), header.total_len());
    println!("{} Bundle is consistent", "✅".green());
    Ok(())
}

fn build_bundle(app: &[u8], fs_image: &[u8]) -> Result<Vec<u8>, String> {
    if app.is_empty() || fs_image.is_empty() {
        return Err("Both images must be non-empty".to_string());
    }
    let app_size = u32::try_from(app.len()).map_err(|_| "Firmware image too large")?;
    let fs_size = u32::try_from(fs_image.len()).map_err(|_| "Filesystem image too large")?;

    let mut bundle = Vec::with_capacity(HEADER_SIZE + app.len() + fs_image.len());
    bundle.extend_from_slice(&encode_header(app_size, fs_size));
    bundle.extend_from_slice(app);
    bundle.extend_from_slice(fs_image);
    Ok(bundle)
}

fn check_bundle(data: &[u8]) -> Result<BundleHeader, String> {
    let raw: &[u8; HEADER_SIZE] = data
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| format!("File is only {} bytes, too small for a bundle", data.len()))?;
    let header = parse_header(raw).map_err(|e| e.to_string())?;
    if data.len() != header.total_len() {
        return Err(format!(
            "Length mismatch: file has {} bytes, header describes {}",
            data.len(),
            header.total_len()
        ));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_bundle_passes_inspection() {
        let bundle = build_bundle(&[0xE9; 1000], &[0xFF; 2000]).unwrap();
        assert_eq!(bundle.len(), 3016);
        let header = check_bundle(&bundle).unwrap();
        assert_eq!(header.app_size, 1000);
        assert_eq!(header.fs_size, 2000);
    }

    #[test]
    fn truncated_bundle_is_reported() {
        let bundle = build_bundle(&[1; 100], &[2; 100]).unwrap();
        let err = check_bundle(&bundle[..150]).unwrap_err();
        assert!(err.contains("Length mismatch"));
        assert!(check_bundle(&bundle[..10]).is_err());
    }

    #[test]
    fn empty_images_are_refused() {
        assert!(build_bundle(&[], &[1]).is_err());
        assert!(build_bundle(&[1], &[]).is_err());
    }
}
