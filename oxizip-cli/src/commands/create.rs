//! Create command implementation.

use crate::utils::{create_progress_bar, parse_size};
use clap::ValueEnum;
use dialoguer::Password;
use oxizip_archive::{
    CompressionMethod, EncryptionAlgorithm, ParallelDeflate, Reply, SaveOutcome, Zip64Option,
    ZipArchive, ZipEvent,
};
use std::path::{Path, PathBuf};

/// Entries at least this large are deflated on all cores with `--parallel`.
const PARALLEL_THRESHOLD: u64 = 1024 * 1024;

/// Compression level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum CompressionLevel {
    /// Store without compression
    Store,
    /// Fast compression
    Fast,
    /// Normal compression (default)
    #[default]
    Normal,
    /// Best compression
    Best,
}

impl CompressionLevel {
    fn method_and_level(self) -> (CompressionMethod, u32) {
        match self {
            Self::Store => (CompressionMethod::Stored, 0),
            Self::Fast => (CompressionMethod::Deflated, 1),
            Self::Normal => (CompressionMethod::Deflated, 6),
            Self::Best => (CompressionMethod::Deflated, 9),
        }
    }
}

/// Entry encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum EncryptionChoice {
    /// No encryption
    #[default]
    None,
    /// Traditional PKWARE encryption (weak, widely supported)
    Zipcrypto,
    /// WinZip AES, 128-bit key
    Aes128,
    /// WinZip AES, 192-bit key
    Aes192,
    /// WinZip AES, 256-bit key
    Aes256,
}

impl From<EncryptionChoice> for EncryptionAlgorithm {
    fn from(choice: EncryptionChoice) -> Self {
        match choice {
            EncryptionChoice::None => Self::None,
            EncryptionChoice::Zipcrypto => Self::PkzipWeak,
            EncryptionChoice::Aes128 => Self::WinZipAes128,
            EncryptionChoice::Aes192 => Self::WinZipAes192,
            EncryptionChoice::Aes256 => Self::WinZipAes256,
        }
    }
}

/// ZIP64 policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Zip64Choice {
    /// Fail if the archive needs ZIP64
    Never,
    /// Only when sizes, offsets or counts overflow
    #[default]
    AsNeeded,
    /// Always write ZIP64 records
    Always,
}

impl From<Zip64Choice> for Zip64Option {
    fn from(choice: Zip64Choice) -> Self {
        match choice {
            Zip64Choice::Never => Self::Never,
            Zip64Choice::AsNeeded => Self::AsNecessary,
            Zip64Choice::Always => Self::Always,
        }
    }
}

/// Options for archive creation.
pub struct CreateOptions<'a> {
    pub compression: CompressionLevel,
    pub encryption: EncryptionChoice,
    pub password: Option<String>,
    pub split: Option<&'a str>,
    pub zip64: Zip64Choice,
    pub comment: Option<String>,
    pub parallel: bool,
    pub verbose: bool,
    pub progress: bool,
}

pub fn cmd_create(
    archive: &Path,
    files: &[PathBuf],
    options: CreateOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    if files.is_empty() {
        return Err("no input files".into());
    }

    let mut zip = ZipArchive::new();
    let (method, level) = options.compression.method_and_level();
    zip.set_compression_method(method);
    zip.set_compression_level(level);
    zip.set_zip64(options.zip64.into());
    if let Some(comment) = options.comment {
        zip.set_comment(comment);
    }
    if let Some(split) = options.split {
        zip.set_max_segment_size(parse_size(split)?)?;
    }
    if options.parallel {
        zip.set_parallel_deflate(ParallelDeflate::with_threshold(PARALLEL_THRESHOLD));
    }

    let encryption = EncryptionAlgorithm::from(options.encryption);
    if encryption.is_encrypted() {
        let password = match options.password {
            Some(password) => password,
            None => Password::new()
                .with_prompt("Password")
                .with_confirmation("Repeat password", "Passwords do not match")
                .interact()?,
        };
        zip.set_password(Some(password));
        zip.set_encryption(encryption);
    }

    for path in files {
        add_path(&mut zip, path, options.verbose)?;
    }

    let pb = create_progress_bar(zip.len() as u64, options.progress && !options.verbose);
    let bar = pb.clone();
    let verbose = options.verbose;
    zip.set_event_sink(move |event: &ZipEvent<'_>| {
        match event {
            ZipEvent::SaveEntryStarted { name, .. } => {
                if verbose {
                    println!("  adding: {name}");
                }
                bar.set_message(name.to_string());
            }
            ZipEvent::SaveEntryCompleted { .. } => bar.inc(1),
            ZipEvent::SaveError { name, error } => {
                bar.suspend(|| eprintln!("  skipping {name}: {error}"));
                return Reply::Skip;
            }
            _ => {}
        }
        Reply::Continue
    });

    match zip.save_as(archive)? {
        SaveOutcome::Saved => {
            pb.finish_with_message("done");
            let volumes = zip.disk_count();
            if volumes > 1 {
                println!(
                    "Created {} ({} entries, {} volumes)",
                    archive.display(),
                    zip.len(),
                    volumes
                );
            } else {
                println!("Created {} ({} entries)", archive.display(), zip.len());
            }
            Ok(())
        }
        SaveOutcome::Cancelled => Err("archive creation cancelled".into()),
        SaveOutcome::Unchanged => Ok(()),
    }
}

fn add_path(zip: &mut ZipArchive, path: &Path, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("cannot add {}", path.display()))?;

    if path.is_dir() {
        let added = zip.add_directory(path, &name)?;
        if verbose {
            println!("  queued: {}/ ({} entries)", name, added);
        }
    } else {
        zip.add_file(path, "")?;
        if verbose {
            println!("  queued: {}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_level_mapping() {
        assert_eq!(
            CompressionLevel::Store.method_and_level(),
            (CompressionMethod::Stored, 0)
        );
        assert_eq!(
            CompressionLevel::Best.method_and_level(),
            (CompressionMethod::Deflated, 9)
        );
    }

    #[test]
    fn test_create_from_tree() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("data");
        std::fs::create_dir(&src)?;
        std::fs::write(src.join("one.txt"), "one")?;
        let single = dir.path().join("single.txt");
        std::fs::write(&single, "single")?;
        let target = dir.path().join("out.zip");

        cmd_create(
            &target,
            &[src, single],
            CreateOptions {
                compression: CompressionLevel::Normal,
                encryption: EncryptionChoice::Aes256,
                password: Some("pw".into()),
                split: None,
                zip64: Zip64Choice::AsNeeded,
                comment: Some("made by test".into()),
                parallel: false,
                verbose: false,
                progress: false,
            },
        )?;

        let mut zip = ZipArchive::open(&target)?;
        assert_eq!(zip.comment(), "made by test");
        let names: Vec<&str> = zip.entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["data/", "data/one.txt", "single.txt"]);
        zip.set_password(Some("pw".into()));
        let mut out = Vec::new();
        zip.extract_to_writer("data/one.txt", &mut out)?;
        assert_eq!(out, b"one");
        Ok(())
    }
}
