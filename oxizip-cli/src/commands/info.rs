//! Info command implementation.

use crate::utils::savings;
use oxizip_archive::{Zip64Option, ZipArchive};
use std::path::Path;

pub fn cmd_info(archive: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let zip = ZipArchive::open(archive)?;
    let metadata = std::fs::metadata(archive)?;
    let entries = zip.entries();

    println!("Archive Information");
    println!("===================");
    println!("File: {}", archive.display());
    println!("Size: {} bytes", metadata.len());
    if zip.disk_count() > 1 {
        println!("Volumes: {} (split archive)", zip.disk_count());
    }
    println!(
        "ZIP64: {}",
        if zip.zip64() == Zip64Option::Always {
            "yes"
        } else {
            "no"
        }
    );
    if zip.was_recovered() {
        println!("Central directory: missing (recovered from local headers)");
    }
    if !zip.comment().is_empty() {
        println!("Comment: {}", zip.comment());
    }

    let total_size: u64 = entries.iter().map(|e| e.uncompressed_size()).sum();
    let total_compressed: u64 = entries.iter().map(|e| e.compressed_size()).sum();
    let encrypted = entries.iter().filter(|e| e.is_encrypted()).count();

    println!();
    println!("Contents:");
    println!(
        "  Files: {}",
        entries.iter().filter(|e| !e.is_directory()).count()
    );
    println!(
        "  Directories: {}",
        entries.iter().filter(|e| e.is_directory()).count()
    );
    if encrypted > 0 {
        println!("  Encrypted: {}", encrypted);
    }
    println!("  Total size: {} bytes", total_size);
    println!("  Compressed size: {} bytes", total_compressed);
    if total_size > 0 {
        println!(
            "  Compression ratio: {:.1}%",
            savings(total_size, total_compressed)
        );
    }

    let mut methods: Vec<&str> = entries
        .iter()
        .map(|e| e.compression_method().name())
        .collect();
    methods.sort_unstable();
    methods.dedup();
    if !methods.is_empty() {
        println!("  Methods: {}", methods.join(", "));
    }

    Ok(())
}
