//! Extraction pipeline.
//!
//! Raw stored bytes are pulled through `Decryptor -> Decoder -> CrcReader`
//! one chunk at a time. The CRC (or the AES authentication code) is checked
//! once the controlling length has been produced.
//!
//! File targets are written to a temporary sibling and renamed into place,
//! so an existing file is only replaced by a fully verified one.

use crate::codec::{Decoder, Decryptor};
use crate::crypto::zipcrypto::check_byte;
use crate::entry::{CompressionMethod, EncryptionAlgorithm, ZipEntry};
use crate::events::{Notifier, Reply, ZipEvent};
use crate::input::Input;
use crate::options::ExtractExistingFile;
use crate::reader::data_offset;
use crate::source::{EntrySource, StoredData};
use filetime::FileTime;
use oxizip_core::CrcReader;
use oxizip_core::error::{Result, ZipError};
use std::fs;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Bytes moved per loop iteration; cancellation is polled once per chunk.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Attempts at replacing a target that is briefly locked.
const PERSIST_ATTEMPTS: u32 = 3;

/// How an extraction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// Content written and verified.
    Extracted,
    /// The target existed and the policy (or the event sink) said skip.
    Skipped,
    /// Cancelled; partial output was removed.
    Cancelled,
}

/// Reject what cannot be decoded before touching the stream.
pub(crate) fn validate(data: &StoredData) -> Result<()> {
    if let EncryptionAlgorithm::Unsupported(id) = data.encryption {
        return Err(ZipError::UnsupportedEncryption { id });
    }
    if let CompressionMethod::Unknown(id) = data.method {
        return Err(ZipError::UnsupportedMethod { id });
    }
    Ok(())
}

pub(crate) fn stored(entry: &ZipEntry) -> Result<&StoredData> {
    match &entry.source {
        EntrySource::Archive(data) => Ok(data),
        _ => Err(ZipError::NotSaved {
            name: entry.name.clone(),
        }),
    }
}

/// Number of bytes the read loop pulls from the decoded stream.
///
/// Stored entries are bounded by their stored size less cipher overhead,
/// everything else by the declared uncompressed size. Producers that write a
/// wrong uncompressed size for stored data still extract.
pub(crate) fn controlling_length(data: &StoredData) -> u64 {
    match data.method {
        CompressionMethod::Stored => data.data_size(),
        _ => data.uncompressed_size,
    }
}

type Chain<'a> = CrcReader<Decoder<Decryptor<Take<&'a mut Input>>>>;

/// An entry being decoded from the archive stream.
pub(crate) struct Decoding<'a> {
    chain: Chain<'a>,
    name: String,
    data_start: u64,
    expected: u64,
    done: u64,
    stored_crc: u32,
    skip_crc: bool,
    finished: bool,
}

impl<'a> Decoding<'a> {
    /// Position `input` at the entry's data and build the chain.
    pub(crate) fn open(
        input: &'a mut Input,
        entry: &ZipEntry,
        password: Option<&str>,
    ) -> Result<Self> {
        let data = stored(entry)?;
        validate(data)?;
        let name = entry.name.as_str();
        if data.encryption.is_encrypted() && password.is_none() {
            return Err(ZipError::password_required(name));
        }
        let password = password.unwrap_or_default().as_bytes();

        let data_start = data_offset(input, data.header_offset)?;
        input.seek(SeekFrom::Start(data_start))?;
        let raw = input.take(data.compressed_size);

        let decryptor = match data.encryption {
            EncryptionAlgorithm::None => Decryptor::plain(raw),
            EncryptionAlgorithm::PkzipWeak => {
                let check = check_byte(
                    data.crc32,
                    data.modified.time,
                    data.uses_data_descriptor(),
                );
                Decryptor::zip_crypto(raw, password, check, name)?
            }
            EncryptionAlgorithm::Unsupported(id) => {
                return Err(ZipError::UnsupportedEncryption { id });
            }
            aes => {
                let strength = aes
                    .aes_strength()
                    .ok_or(ZipError::UnsupportedEncryption { id: 0 })?;
                Decryptor::aes(raw, strength, password, data.compressed_size, name)?
            }
        };
        let is_aes = decryptor.is_aes();
        let decoder = Decoder::new(decryptor, data.method)?;

        let expected = controlling_length(data);
        debug!(
            name,
            data_start,
            compressed = data.compressed_size,
            expected,
            "decoding entry"
        );
        Ok(Self {
            chain: CrcReader::new(decoder),
            name: name.to_string(),
            data_start,
            expected,
            done: 0,
            stored_crc: data.crc32,
            skip_crc: is_aes && (data.aes_version == 2 || data.uncompressed_size == 0),
            finished: false,
        })
    }

    pub(crate) fn expected(&self) -> u64 {
        self.expected
    }

    /// Read the next chunk. `Ok(0)` once the controlling length is reached;
    /// running dry before that is a truncation error.
    pub(crate) fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.expected - self.done;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self
            .chain
            .read(&mut buf[..want])
            .map_err(ZipError::from_io)?;
        if n == 0 {
            return Err(ZipError::truncated(self.data_start, remaining));
        }
        self.done += n as u64;
        Ok(n)
    }

    /// Consume what is left of the stored bytes and check CRC and MAC.
    pub(crate) fn verify(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let decryptor = self.chain.get_mut().get_mut();
        io::copy(decryptor, &mut io::sink()).map_err(ZipError::from_io)?;
        if !self.chain.get_ref().get_ref().authenticated() {
            return Err(ZipError::mac_mismatch(&self.name));
        }
        let computed = self.chain.crc();
        if !self.skip_crc && computed != self.stored_crc {
            return Err(ZipError::crc_mismatch(&self.name, self.stored_crc, computed));
        }
        Ok(())
    }
}

impl Read for Decoding<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.read_chunk(buf)?;
        if n == 0 {
            self.verify()?;
        }
        Ok(n)
    }
}

/// Decode an entry into `out`, reporting progress and polling cancellation.
pub(crate) fn decode_entry(
    input: &mut Input,
    entry: &ZipEntry,
    password: Option<&str>,
    out: &mut dyn Write,
    notifier: &mut Notifier<'_>,
) -> Result<ExtractOutcome> {
    let mut decoding = Decoding::open(input, entry, password)?;
    let total = decoding.expected();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;

    loop {
        if notifier.cancelled() {
            debug!(name = %entry.name, bytes, "extraction cancelled");
            return Ok(ExtractOutcome::Cancelled);
        }
        let n = decoding.read_chunk(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        bytes += n as u64;
        notifier.notify(ZipEvent::ExtractEntryProgress {
            name: &entry.name,
            bytes,
            total,
        });
    }
    decoding.verify()?;
    Ok(ExtractOutcome::Extracted)
}

/// Set while an [`EntryReader`] holds the archive stream.
#[derive(Debug)]
pub(crate) struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ZipError::ArchiveBusy)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A pull-based reader over one entry's content.
///
/// The CRC (or AES authentication code) is verified when the end of the
/// content is reached; a mismatch surfaces as an `io::Error` wrapping the
/// [`ZipError`]. While the reader is alive the archive reports
/// [`ZipError::ArchiveBusy`] for any other stream operation.
pub struct EntryReader<'a> {
    decoding: Decoding<'a>,
    _busy: BusyGuard,
}

impl<'a> EntryReader<'a> {
    pub(crate) fn new(decoding: Decoding<'a>, busy: BusyGuard) -> Self {
        Self {
            decoding,
            _busy: busy,
        }
    }

    /// Number of bytes the reader will produce.
    pub fn len(&self) -> u64 {
        self.decoding.expected()
    }

    /// True for empty entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoding.read(buf)
    }
}

impl std::fmt::Debug for EntryReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("name", &self.decoding.name)
            .field("len", &self.decoding.expected)
            .field("read", &self.decoding.done)
            .finish()
    }
}

/// Join an entry name onto `dir`, refusing anything that would escape it.
pub(crate) fn safe_join(dir: &Path, name: &str) -> Result<PathBuf> {
    if name.starts_with('/') || name.starts_with('\\') || Path::new(name).is_absolute() {
        return Err(ZipError::path_traversal(name));
    }
    let mut path = dir.to_path_buf();
    for part in name.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        if part.contains('\0') {
            return Err(ZipError::path_traversal(name));
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(normal)), None) => path.push(normal),
            _ => return Err(ZipError::path_traversal(name)),
        }
    }
    Ok(path)
}

enum Resolution {
    Overwrite,
    Skip,
    Cancel,
}

/// Apply the collision policy to an existing target.
fn resolve_existing(
    policy: ExtractExistingFile,
    name: &str,
    path: &Path,
    notifier: &mut Notifier<'_>,
) -> Result<Resolution> {
    let exists = || ZipError::TargetExists {
        path: path.to_path_buf(),
    };
    match policy {
        ExtractExistingFile::Throw => Err(exists()),
        ExtractExistingFile::Overwrite => Ok(Resolution::Overwrite),
        ExtractExistingFile::Skip => Ok(Resolution::Skip),
        ExtractExistingFile::Ask => {
            if !notifier.has_sink() {
                return Err(exists());
            }
            // One retry for a reply the event does not understand.
            for _ in 0..2 {
                match notifier.notify(ZipEvent::ExtractExisting { name, path }) {
                    Reply::Overwrite => return Ok(Resolution::Overwrite),
                    Reply::Skip => return Ok(Resolution::Skip),
                    Reply::Cancel => return Ok(Resolution::Cancel),
                    Reply::Throw => return Err(exists()),
                    Reply::Continue | Reply::Retry => {}
                }
            }
            Err(exists())
        }
    }
}

/// Extract one entry below `dir`.
pub(crate) fn extract_to_dir(
    input: &mut Input,
    entry: &ZipEntry,
    dir: &Path,
    password: Option<&str>,
    policy: ExtractExistingFile,
    notifier: &mut Notifier<'_>,
) -> Result<ExtractOutcome> {
    let data = stored(entry)?;
    validate(data)?;
    let target = safe_join(dir, &entry.name)?;
    notifier.notify(ZipEvent::ExtractEntryStarted { name: &entry.name });

    if entry.is_directory {
        fs::create_dir_all(&target)?;
        apply_times(&target, entry)?;
        notifier.notify(ZipEvent::ExtractEntryCompleted { name: &entry.name });
        return Ok(ExtractOutcome::Extracted);
    }

    if fs::symlink_metadata(&target).is_ok() {
        match resolve_existing(policy, &entry.name, &target, notifier)? {
            Resolution::Overwrite => debug!(path = %target.display(), "overwriting"),
            Resolution::Skip => {
                debug!(path = %target.display(), "target exists, skipped");
                return Ok(ExtractOutcome::Skipped);
            }
            Resolution::Cancel => return Ok(ExtractOutcome::Cancelled),
        }
    }
    if data.encryption.is_encrypted() && password.is_none() {
        return Err(ZipError::password_required(&entry.name));
    }

    let parent = target.parent().unwrap_or(dir);
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".oxizip-")
        .suffix(".part")
        .tempfile_in(parent)?;

    let outcome = {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let outcome = decode_entry(input, entry, password, &mut writer, notifier)?;
        writer.flush()?;
        outcome
    };
    if outcome == ExtractOutcome::Cancelled {
        // Dropping the temporary file deletes it.
        return Ok(outcome);
    }

    persist(temp, &target)?;
    apply_metadata(&target, entry)?;
    notifier.notify(ZipEvent::ExtractEntryCompleted { name: &entry.name });
    Ok(ExtractOutcome::Extracted)
}

/// Rename the finished temporary file over the target, retrying briefly
/// while the target is locked.
fn persist(mut temp: tempfile::NamedTempFile, target: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        match temp.persist(target) {
            Ok(_) => return Ok(()),
            Err(err) if attempt + 1 < PERSIST_ATTEMPTS => {
                attempt += 1;
                warn!(path = %target.display(), error = %err.error, attempt, "replace failed, retrying");
                temp = err.file;
                std::thread::sleep(Duration::from_millis(50 << attempt));
            }
            Err(err) => return Err(ZipError::Io(err.error)),
        }
    }
}

fn file_time(at: chrono::DateTime<chrono::Utc>) -> FileTime {
    FileTime::from_unix_time(at.timestamp(), at.timestamp_subsec_nanos())
}

fn apply_times(path: &Path, entry: &ZipEntry) -> Result<()> {
    let (modified, accessed) = match entry.times {
        Some(times) => (times.modified, times.accessed),
        None => {
            let modified = entry.modified.to_datetime();
            (modified, modified)
        }
    };
    filetime::set_file_times(path, file_time(accessed), file_time(modified))?;
    Ok(())
}

fn apply_metadata(path: &Path, entry: &ZipEntry) -> Result<()> {
    apply_times(path, entry)?;

    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode() {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }

    if entry.dos_read_only() == Some(true) {
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}
