use oxizip_archive::{CompressionMethod, ReadOptions, TimeFormats, Zip64Option, ZipArchive};
use oxizip_core::{ErrorKind, ZipError};
use std::io::Cursor;

const ZIP64_EOCD_SIG: [u8; 4] = [0x50, 0x4B, 0x06, 0x06];
const ZIP64_LOCATOR_SIG: [u8; 4] = [0x50, 0x4B, 0x06, 0x07];

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn many_entries(count: usize) -> Result<ZipArchive, ZipError> {
    let mut archive = ZipArchive::new();
    archive.set_compression_method(CompressionMethod::Stored);
    archive.set_time_formats(TimeFormats::NONE);
    for i in 0..count {
        archive.add_entry(&format!("f{i:05}"), Vec::new())?;
    }
    Ok(archive)
}

#[test]
fn test_entry_count_threshold() -> Result<(), Box<dyn std::error::Error>> {
    let mut archive = many_entries(65_534)?;
    let mut out = Cursor::new(Vec::new());
    archive.save_to_writer(&mut out)?;
    let bytes = out.into_inner();
    assert!(!archive.used_zip64());
    assert!(!contains(&bytes, &ZIP64_EOCD_SIG));

    let mut archive = many_entries(65_535)?;
    let mut out = Cursor::new(Vec::new());
    archive.save_to_writer(&mut out)?;
    let bytes = out.into_inner();
    assert!(archive.used_zip64());
    assert!(contains(&bytes, &ZIP64_EOCD_SIG));
    assert!(contains(&bytes, &ZIP64_LOCATOR_SIG));

    let reopened = ZipArchive::read(Cursor::new(bytes), ReadOptions::default())?;
    assert_eq!(reopened.len(), 65_535);
    assert!(reopened.contains("f65534"));
    assert_eq!(reopened.zip64(), Zip64Option::Always);
    Ok(())
}

#[test]
fn test_never_policy_refuses_large_count() -> Result<(), Box<dyn std::error::Error>> {
    let mut archive = many_entries(65_535)?;
    archive.set_zip64(Zip64Option::Never);
    let mut out = Cursor::new(Vec::new());
    let err = archive
        .save_to_writer(&mut out)
        .err()
        .ok_or("save should fail")?;
    assert!(matches!(err, ZipError::Zip64Required { .. }));
    assert_eq!(err.kind(), ErrorKind::Policy);
    assert!(out.into_inner().is_empty());
    Ok(())
}

#[test]
fn test_always_policy_on_tiny_archive() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("tiny.zip");

    let mut archive = ZipArchive::new();
    archive.set_zip64(Zip64Option::Always);
    archive.add_entry("ten.bin", b"0123456789".to_vec())?;
    archive.save_as(&target)?;
    assert!(archive.used_zip64());

    let bytes = std::fs::read(&target)?;
    assert!(contains(&bytes, &ZIP64_EOCD_SIG));

    let mut reopened = ZipArchive::open(&target)?;
    assert_eq!(reopened.zip64(), Zip64Option::Always);
    let entry = reopened.entry("ten.bin").ok_or("missing entry")?;
    assert!(entry.used_zip64());
    assert_eq!(entry.uncompressed_size(), 10);
    let mut out = Vec::new();
    reopened.extract_to_writer("ten.bin", &mut out)?;
    assert_eq!(out, b"0123456789");

    let mut again = Cursor::new(Vec::new());
    reopened.save_to_writer(&mut again)?;
    assert_eq!(again.into_inner(), bytes);
    Ok(())
}
