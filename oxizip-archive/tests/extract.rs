use oxizip_archive::{
    CompressionMethod, ExtractExistingFile, ExtractOutcome, ReadOptions, Reply, ZipArchive,
    ZipEvent,
};
use oxizip_core::ZipError;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};

fn build(entries: &[(&str, Vec<u8>)]) -> Result<ZipArchive, Box<dyn std::error::Error>> {
    let mut archive = ZipArchive::new();
    archive.set_compression_method(CompressionMethod::Stored);
    for (name, data) in entries {
        archive.add_entry(name, data.clone())?;
    }
    let mut out = Cursor::new(Vec::new());
    archive.save_to_writer(&mut out)?;
    Ok(ZipArchive::read(
        Cursor::new(out.into_inner()),
        ReadOptions::default(),
    )?)
}

fn answer_existing(reply: Reply) -> impl FnMut(&ZipEvent<'_>) -> Reply + Send + 'static {
    move |event: &ZipEvent<'_>| match event {
        ZipEvent::ExtractExisting { .. } => reply,
        _ => Reply::Continue,
    }
}

fn collide(
    policy: ExtractExistingFile,
    ask: Option<Reply>,
    dir: &Path,
) -> Result<Result<ExtractOutcome, ZipError>, Box<dyn std::error::Error>> {
    let target = dir.join("file.txt");
    fs::write(&target, b"existing")?;
    let mut archive = build(&[("file.txt", b"archived".to_vec())])?;
    archive.set_extract_existing(policy);
    if let Some(reply) = ask {
        archive.set_event_sink(answer_existing(reply));
    }
    Ok(archive.extract_to_dir("file.txt", dir))
}

#[test]
fn test_collision_policy_matrix() -> Result<(), Box<dyn std::error::Error>> {
    let cases: [(ExtractExistingFile, Option<Reply>, &[u8]); 5] = [
        (ExtractExistingFile::Throw, None, b"existing"),
        (ExtractExistingFile::Overwrite, None, b"archived"),
        (ExtractExistingFile::Skip, None, b"existing"),
        (ExtractExistingFile::Ask, Some(Reply::Overwrite), b"archived"),
        (ExtractExistingFile::Ask, Some(Reply::Skip), b"existing"),
    ];
    for (policy, ask, expected) in cases {
        let dir = tempfile::tempdir()?;
        let result = collide(policy, ask, dir.path())?;
        match policy {
            ExtractExistingFile::Throw => {
                assert!(matches!(result, Err(ZipError::TargetExists { .. })));
            }
            _ if expected == b"existing" => {
                assert_eq!(result?, ExtractOutcome::Skipped);
            }
            _ => {
                assert_eq!(result?, ExtractOutcome::Extracted);
            }
        }
        assert_eq!(fs::read(dir.path().join("file.txt"))?, expected, "{policy:?} {ask:?}");
        let leftovers = fs::read_dir(dir.path())?.count();
        assert_eq!(leftovers, 1, "{policy:?} left temporary files");
    }
    Ok(())
}

#[test]
fn test_cancel_during_second_entry() -> Result<(), Box<dyn std::error::Error>> {
    let big = vec![0x5Au8; 300_000];
    let mut archive = build(&[
        ("a.bin", big.clone()),
        ("b.bin", big.clone()),
        ("c.bin", big.clone()),
    ])?;
    archive.set_event_sink(|event: &ZipEvent<'_>| match event {
        ZipEvent::ExtractEntryProgress { name: "b.bin", .. } => Reply::Cancel,
        _ => Reply::Continue,
    });

    let dir = tempfile::tempdir()?;
    assert_eq!(archive.extract_all(dir.path())?, ExtractOutcome::Cancelled);
    assert_eq!(fs::read(dir.path().join("a.bin"))?, big);
    assert!(!dir.path().join("b.bin").exists());
    assert!(!dir.path().join("c.bin").exists());
    assert_eq!(fs::read_dir(dir.path())?.count(), 1);

    // A pre-existing target survives a cancelled overwrite.
    fs::write(dir.path().join("b.bin"), b"keep me")?;
    archive.set_extract_existing(ExtractExistingFile::Overwrite);
    assert_eq!(archive.extract_all(dir.path())?, ExtractOutcome::Cancelled);
    assert_eq!(fs::read(dir.path().join("b.bin"))?, b"keep me");
    assert_eq!(fs::read_dir(dir.path())?.count(), 2);

    // The token is reset for the next operation.
    archive.clear_event_sink();
    assert_eq!(archive.extract_all(dir.path())?, ExtractOutcome::Extracted);
    assert_eq!(fs::read(dir.path().join("c.bin"))?, big);
    Ok(())
}

#[test]
fn test_events_follow_extraction() -> Result<(), Box<dyn std::error::Error>> {
    let mut archive = build(&[("one.txt", b"1".to_vec()), ("two.txt", b"22".to_vec())])?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    archive.set_event_sink(move |event: &ZipEvent<'_>| {
        let label = match event {
            ZipEvent::ExtractStarted { entries } => format!("start {entries}"),
            ZipEvent::ExtractEntryStarted { name } => format!("begin {name}"),
            ZipEvent::ExtractEntryCompleted { name } => format!("end {name}"),
            ZipEvent::ExtractCompleted => "done".to_string(),
            _ => return Reply::Continue,
        };
        if let Ok(mut log) = log.lock() {
            log.push(label);
        }
        Reply::Continue
    });

    let dir = tempfile::tempdir()?;
    archive.extract_all(dir.path())?;
    let seen = seen.lock().map_err(|_| "poisoned")?.clone();
    assert_eq!(
        seen,
        ["start 2", "begin one.txt", "end one.txt", "begin two.txt", "end two.txt", "done"]
    );
    Ok(())
}

#[test]
fn test_open_reader_marks_archive_busy() -> Result<(), Box<dyn std::error::Error>> {
    let mut archive = build(&[("x.txt", b"xyz".to_vec()), ("y.txt", b"yy".to_vec())])?;

    let mut text = String::new();
    archive.open_reader("x.txt")?.read_to_string(&mut text)?;
    assert_eq!(text, "xyz");
    assert_eq!(archive.check("y.txt")?, ExtractOutcome::Extracted);

    let reader = archive.open_reader("x.txt")?;
    std::mem::forget(reader);
    assert!(matches!(
        archive.extract_to_writer("y.txt", &mut std::io::sink()),
        Err(ZipError::ArchiveBusy)
    ));
    assert!(matches!(archive.add_entry("z.txt", b"z".to_vec()), Err(ZipError::ArchiveBusy)));
    Ok(())
}

#[test]
fn test_path_traversal_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut archive = build(&[("../escape.txt", b"nope".to_vec())])?;
    let dir = tempfile::tempdir()?;
    let inner = dir.path().join("inner");
    fs::create_dir(&inner)?;
    assert!(matches!(
        archive.extract_to_dir("../escape.txt", &inner),
        Err(ZipError::PathTraversal { .. })
    ));
    assert!(!dir.path().join("escape.txt").exists());
    Ok(())
}
