use oxizip_archive::{
    EncryptionAlgorithm, ReadOptions, Reply, SaveOutcome, ZipArchive, ZipEvent,
};
use oxizip_core::{ErrorKind, ZipError};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_stream_save_uses_descriptors() -> Result<(), Box<dyn std::error::Error>> {
    let mut archive = ZipArchive::new();
    archive.set_password(Some("pw".into()));
    archive.add_entry("plain.txt", "streamed ".repeat(300))?;
    archive
        .add_entry("weak.txt", b"weak cipher".to_vec())?
        .set_encryption(EncryptionAlgorithm::PkzipWeak);
    archive
        .add_entry("strong.txt", b"aes cipher".to_vec())?
        .set_encryption(EncryptionAlgorithm::WinZipAes128);

    let mut bytes = Vec::new();
    assert_eq!(archive.save_to_stream(&mut bytes)?, SaveOutcome::Saved);

    let mut reopened = ZipArchive::read(
        Cursor::new(bytes),
        ReadOptions::default().with_password("pw"),
    )?;
    for entry in reopened.entries() {
        assert!(entry.uses_data_descriptor(), "{}", entry.name());
    }
    let mut out = Vec::new();
    reopened.extract_to_writer("plain.txt", &mut out)?;
    assert_eq!(out, "streamed ".repeat(300).as_bytes());
    out.clear();
    reopened.extract_to_writer("weak.txt", &mut out)?;
    assert_eq!(out, b"weak cipher");
    out.clear();
    reopened.extract_to_writer("strong.txt", &mut out)?;
    assert_eq!(out, b"aes cipher");
    Ok(())
}

#[test]
fn test_callback_sources() -> Result<(), Box<dyn std::error::Error>> {
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);

    let mut archive = ZipArchive::new();
    archive.add_with_writer("generated.csv", |name, out| {
        writeln!(out, "file,{name}")?;
        for i in 0..100 {
            writeln!(out, "row,{i}")?;
        }
        Ok(())
    })?;
    archive.add_with_open_close(
        "opened.txt",
        Box::new(|_name: &str| -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(b"from open".to_vec())))
        }),
        Box::new(move |_name: &str, _reader: Box<dyn Read + Send>| -> io::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )?;
    archive.add_stream("piped.txt", Cursor::new(b"piped".to_vec()))?;

    let mut out = Cursor::new(Vec::new());
    archive.save_to_writer(&mut out)?;
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let mut reopened = ZipArchive::read(Cursor::new(out.into_inner()), ReadOptions::default())?;
    let mut text = String::new();
    reopened.open_reader("generated.csv")?.read_to_string(&mut text)?;
    assert!(text.starts_with("file,generated.csv\nrow,0\n"));
    assert!(text.ends_with("row,99\n"));
    let mut data = Vec::new();
    reopened.extract_to_writer("opened.txt", &mut data)?;
    assert_eq!(data, b"from open");

    // The stream was consumed by the first save.
    let mut again = Cursor::new(Vec::new());
    assert!(archive.save_to_writer(&mut again).is_err());
    Ok(())
}

#[test]
fn test_error_reply_skips_entry() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("skip.zip");
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);

    let mut archive = ZipArchive::new();
    archive.add_entry("good.txt", b"fine".to_vec())?;
    archive.add_with_open_close(
        "bad.txt",
        Box::new(|_name: &str| -> io::Result<Box<dyn Read + Send>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "source vanished"))
        }),
        Box::new(|_name: &str, _reader: Box<dyn Read + Send>| -> io::Result<()> { Ok(()) }),
    )?;
    archive.set_event_sink(move |event: &ZipEvent<'_>| match event {
        ZipEvent::SaveError { .. } => {
            // Retry once, then give up on the entry.
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Retry
            } else {
                Reply::Skip
            }
        }
        _ => Reply::Continue,
    });

    assert_eq!(archive.save_as(&target)?, SaveOutcome::Saved);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    // The skipped entry stays in the handle, unsaved.
    assert!(archive.is_dirty());
    assert!(!archive.entry("bad.txt").ok_or("missing entry")?.included_in_save());

    let reopened = ZipArchive::open(&target)?;
    assert_eq!(reopened.len(), 1);
    assert!(reopened.contains("good.txt"));
    Ok(())
}

#[test]
fn test_cancelled_save_leaves_target_alone() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("keep.zip");
    fs::write(&target, b"not replaced")?;

    let mut archive = ZipArchive::new();
    archive.add_entry("a.bin", vec![7u8; 500_000])?;
    archive.add_entry("b.bin", vec![9u8; 500_000])?;
    let token = archive.cancel_token();
    archive.set_event_sink(move |event: &ZipEvent<'_>| {
        if let ZipEvent::SaveEntryStarted { name: "b.bin", .. } = event {
            token.cancel();
        }
        Reply::Continue
    });

    assert_eq!(archive.save_as(&target)?, SaveOutcome::Cancelled);
    assert_eq!(fs::read(&target)?, b"not replaced");
    assert_eq!(fs::read_dir(dir.path())?.count(), 1);
    assert!(archive.is_dirty());
    Ok(())
}

#[test]
fn test_save_events_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink_log = Arc::clone(&log);

    let mut archive = ZipArchive::new();
    archive.set_sort_entries(true);
    archive.add_entry("b.txt", b"b".to_vec())?;
    archive.add_entry("a.txt", b"a".to_vec())?;
    archive.set_event_sink(move |event: &ZipEvent<'_>| {
        let label = match event {
            ZipEvent::SaveStarted { entries } => format!("start {entries}"),
            ZipEvent::SaveEntryStarted { name, index, total } => {
                format!("entry {name} {index}/{total}")
            }
            ZipEvent::SaveCompleted => "done".to_string(),
            _ => return Reply::Continue,
        };
        if let Ok(mut log) = sink_log.lock() {
            log.push(label);
        }
        Reply::Continue
    });

    let mut out = Cursor::new(Vec::new());
    archive.save_to_writer(&mut out)?;
    let log = log.lock().map_err(|_| "poisoned")?.clone();
    assert_eq!(log, ["start 2", "entry a.txt 0/2", "entry b.txt 1/2", "done"]);

    let reopened = ZipArchive::read(Cursor::new(out.into_inner()), ReadOptions::default())?;
    let names: Vec<&str> = reopened.entries().iter().map(|e| e.name()).collect();
    assert_eq!(names, ["a.txt", "b.txt"]);
    Ok(())
}

#[test]
fn test_missing_password_fails_save() -> Result<(), Box<dyn std::error::Error>> {
    let mut archive = ZipArchive::new();
    archive.set_encryption(EncryptionAlgorithm::WinZipAes256);
    archive.add_entry("secret.txt", b"data".to_vec())?;
    let mut out = Cursor::new(Vec::new());
    let err = archive.save_to_writer(&mut out).err().ok_or("save should fail")?;
    assert!(matches!(err, ZipError::PasswordRequired { .. }));
    assert_eq!(err.kind(), ErrorKind::Credential);
    Ok(())
}
