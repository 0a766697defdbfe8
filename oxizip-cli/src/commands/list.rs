//! List command implementation.

use crate::utils::{filter_entries, print_entries, read_options, savings};
use oxizip_archive::{ZipArchive, ZipEntry};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// JSON serializable entry data for archive listings.
#[derive(Debug, Serialize, Deserialize)]
struct EntryJson {
    name: String,
    size: u64,
    compressed_size: u64,
    ratio: f64,
    method: String,
    crc: u32,
    mtime: i64,
    is_dir: bool,
    encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    encryption: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    comment: String,
}

impl EntryJson {
    fn from_entry(entry: &ZipEntry) -> Self {
        Self {
            name: entry.name().to_string(),
            size: entry.uncompressed_size(),
            compressed_size: entry.compressed_size(),
            ratio: savings(entry.uncompressed_size(), entry.compressed_size()),
            method: entry.compression_method().name().to_string(),
            crc: entry.crc32(),
            mtime: entry.modified().timestamp(),
            is_dir: entry.is_directory(),
            encrypted: entry.is_encrypted(),
            encryption: entry
                .is_encrypted()
                .then(|| format!("{:?}", entry.encryption())),
            comment: entry.comment().to_string(),
        }
    }
}

/// JSON output for archive listing.
#[derive(Debug, Serialize, Deserialize)]
struct ArchiveListJson {
    archive: String,
    volumes: u32,
    zip64: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    comment: String,
    entries: Vec<EntryJson>,
}

/// Options for listing archive contents.
pub struct ListOptions<'a> {
    pub verbose: bool,
    pub json: bool,
    pub include: &'a [String],
    pub exclude: &'a [String],
    pub encoding: Option<&'a str>,
}

pub fn cmd_list(archive: &Path, options: &ListOptions) -> Result<(), Box<dyn std::error::Error>> {
    let zip = ZipArchive::open_with(archive, read_options(None, options.encoding)?)?;
    let filtered = filter_entries(zip.entries(), options.include, options.exclude);

    if options.json {
        let output = ArchiveListJson {
            archive: archive.display().to_string(),
            volumes: zip.disk_count(),
            zip64: zip.zip64() == oxizip_archive::Zip64Option::Always,
            comment: zip.comment().to_string(),
            entries: filtered.iter().map(|e| EntryJson::from_entry(e)).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Archive: {}", archive.display());
    if zip.was_recovered() {
        println!("  (central directory missing; entries recovered from local headers)");
    }
    println!();
    print_entries(&filtered, options.verbose);
    if options.verbose && !zip.comment().is_empty() {
        println!();
        println!("Comment: {}", zip.comment());
    }
    Ok(())
}
