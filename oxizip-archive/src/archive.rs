//! The archive handle.
//!
//! [`ZipArchive`] owns the entry table, the input stream of the archive it was
//! opened from, and the archive-wide settings. Entries are added, updated and
//! removed in memory; nothing touches the disk until a save.

use crate::encoding::{AlternateEncodingUsage, TextEncoding};
use crate::entry::{CompressionMethod, EncryptionAlgorithm, ZipEntry, normalize_name};
use crate::events::{CancelToken, EventSink, Notifier, ZipEvent};
use crate::extract::{self, BusyGuard, Decoding, EntryReader, ExtractOutcome};
use crate::input::Input;
use crate::options::{ExtractExistingFile, ParallelDeflate, ReadOptions, Zip64Option};
use crate::reader::{self, Directory, name_key};
use crate::save::{self, SaveOutcome, SaveReport, SaveSettings};
use crate::segmented::{self, SegmentedReader, SegmentedWriter};
use crate::sink::{OutputSink, SeekableSink, StreamingSink};
use crate::source::{CloseCallback, EntrySource, OpenCallback};
use crate::time::{DosDateTime, EntryTimes, TimeFormats};
use chrono::{DateTime, Utc};
use encoding_rs::Encoding;
use oxizip_core::error::{Result, ZipError};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

type BoxedSink = Box<dyn EventSink + Send>;

/// An open ZIP archive.
///
/// # Example
///
/// ```rust,no_run
/// use oxizip_archive::ZipArchive;
///
/// let mut archive = ZipArchive::new();
/// archive.add_entry("hello.txt", b"Hello, World!".to_vec())?;
/// archive.save_as("hello.zip")?;
///
/// let mut archive = ZipArchive::open("hello.zip")?;
/// let mut out = Vec::new();
/// archive.extract_to_writer("hello.txt", &mut out)?;
/// assert_eq!(out, b"Hello, World!");
/// # Ok::<(), oxizip_core::ZipError>(())
/// ```
pub struct ZipArchive {
    path: Option<PathBuf>,
    input: Option<Input>,
    entries: Vec<ZipEntry>,
    index: HashMap<String, usize>,
    comment: String,
    encoding: TextEncoding,
    password: Option<String>,
    encryption: EncryptionAlgorithm,
    method: CompressionMethod,
    level: u32,
    zip64: Zip64Option,
    max_segment_size: u64,
    sort_entries: bool,
    case_sensitive: bool,
    time_formats: TimeFormats,
    parallel: ParallelDeflate,
    extract_existing: ExtractExistingFile,
    events: Option<BoxedSink>,
    cancel: CancelToken,
    busy: Arc<AtomicBool>,
    dirty: bool,
    recovered: bool,
    output_used_zip64: bool,
}

impl Default for ZipArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZipArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipArchive")
            .field("path", &self.path)
            .field("input", &self.input)
            .field("entries", &self.entries.len())
            .field("zip64", &self.zip64)
            .field("max_segment_size", &self.max_segment_size)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

/// Build a notifier from the handle's fields without borrowing the whole handle.
fn notifier<'s>(events: &'s mut Option<BoxedSink>, cancel: &CancelToken) -> Notifier<'s> {
    let sink: Option<&'s mut (dyn EventSink + Send)> = match events {
        Some(sink) => Some(&mut **sink),
        None => None,
    };
    Notifier::new(sink, cancel.clone())
}

/// Open the input of `path`, picking up `.z01`... siblings of a split archive.
fn open_input(path: &Path) -> Result<Input> {
    if segmented::volume_path(path, 0).is_file() {
        debug!(path = %path.display(), "opening split archive");
        return Ok(Input::Segmented(SegmentedReader::open(path)?));
    }
    Ok(Input::Single(Box::new(BufReader::new(File::open(path)?))))
}

/// Join an in-archive directory and a file name.
fn archive_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches(['/', '\\']);
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Stamp times and attributes from filesystem metadata.
fn stamp_metadata(entry: &mut ZipEntry, meta: &fs::Metadata) {
    if let Ok(modified) = meta.modified() {
        let modified = DateTime::<Utc>::from(modified);
        let accessed = meta.accessed().map_or(modified, DateTime::<Utc>::from);
        let created = meta.created().map_or(modified, DateTime::<Utc>::from);
        entry.modified = DosDateTime::from_datetime(modified);
        entry.times = Some(EntryTimes {
            modified,
            accessed,
            created,
        });
    }

    let mut dos = u32::from(meta.is_dir()) * 0x10;
    if meta.permissions().readonly() {
        dos |= 0x01;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        entry.external_attributes = (meta.permissions().mode() << 16) | dos;
    }
    #[cfg(not(unix))]
    {
        entry.external_attributes = dos;
    }
}

/// Move `target` aside, put `temp` in its place, then delete the old file.
///
/// Renaming first works even when another process holds the old file open
/// for deletion.
fn replace_file(temp: tempfile::NamedTempFile, target: &Path) -> Result<()> {
    if !target.exists() {
        debug!(path = %target.display(), "writing new archive");
        temp.persist(target).map_err(|err| ZipError::Io(err.error))?;
        return Ok(());
    }

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let transient = target.with_file_name(format!(
        ".{file_name}.{:08x}.old",
        rand::random::<u32>()
    ));
    debug!(from = %target.display(), to = %transient.display(), "moving previous archive aside");
    fs::rename(target, &transient)?;

    if let Err(err) = temp.persist(target) {
        if let Err(restore) = fs::rename(&transient, target) {
            warn!(path = %transient.display(), error = %restore, "could not restore previous archive");
        }
        return Err(ZipError::Io(err.error));
    }
    if let Err(err) = fs::remove_file(&transient) {
        warn!(path = %transient.display(), error = %err, "could not delete previous archive");
    }
    Ok(())
}

/// Delete `.z01`... volumes left next to `target` by an earlier split save.
fn remove_stale_volumes(target: &Path) -> Result<()> {
    let mut disk = 0;
    loop {
        let volume = segmented::volume_path(target, disk);
        if !volume.is_file() {
            return Ok(());
        }
        debug!(path = %volume.display(), "removing stale volume");
        fs::remove_file(&volume)?;
        disk += 1;
    }
}

impl ZipArchive {
    /// An empty archive with default settings.
    pub fn new() -> Self {
        Self {
            path: None,
            input: None,
            entries: Vec::new(),
            index: HashMap::new(),
            comment: String::new(),
            encoding: TextEncoding::default(),
            password: None,
            encryption: EncryptionAlgorithm::None,
            method: CompressionMethod::Deflated,
            level: 6,
            zip64: Zip64Option::default(),
            max_segment_size: 0,
            sort_entries: false,
            case_sensitive: false,
            time_formats: TimeFormats::default(),
            parallel: ParallelDeflate::default(),
            extract_existing: ExtractExistingFile::default(),
            events: None,
            cancel: CancelToken::new(),
            busy: Arc::new(AtomicBool::new(false)),
            dirty: true,
            recovered: false,
            output_used_zip64: false,
        }
    }

    /// Open the archive at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, ReadOptions::default())
    }

    /// Open the archive at `path`.
    pub fn open_with(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        Self::open_with_events(path, options, None)
    }

    /// Open the archive at `path`, reporting `ReadEntry` events to `events`.
    /// The sink stays registered on the handle.
    pub fn open_with_events(
        path: impl AsRef<Path>,
        options: ReadOptions,
        events: Option<Box<dyn EventSink + Send>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let input = open_input(path)?;
        Self::from_input(input, Some(path.to_path_buf()), options, events)
    }

    /// Read an archive from a seekable stream. Such a handle can only be
    /// saved with [`save_as`](Self::save_as) or one of the writer variants.
    pub fn read<R: Read + Seek + Send + 'static>(reader: R, options: ReadOptions) -> Result<Self> {
        Self::from_input(Input::Single(Box::new(reader)), None, options, None)
    }

    fn from_input(
        mut input: Input,
        path: Option<PathBuf>,
        options: ReadOptions,
        events: Option<BoxedSink>,
    ) -> Result<Self> {
        let mut archive = Self::new();
        archive.events = events;
        archive.encoding = options.encoding;
        archive.case_sensitive = options.case_sensitive;
        archive.password = options.password.clone();

        let directory = {
            let mut notifier = notifier(&mut archive.events, &archive.cancel);
            reader::read_directory(&mut input, &options, &mut notifier)?
        };
        archive.adopt(directory);
        archive.input = Some(input);
        archive.path = path;
        info!(
            path = ?archive.path,
            entries = archive.entries.len(),
            zip64 = archive.zip64 == Zip64Option::Always,
            "archive opened"
        );
        Ok(archive)
    }

    /// Take over a freshly read directory.
    fn adopt(&mut self, directory: Directory) {
        self.entries = directory.entries;
        self.comment = directory.comment;
        self.recovered = directory.recovered;
        if directory.zip64 {
            debug!("ZIP64 records present; later saves keep them");
            self.zip64 = Zip64Option::Always;
        }
        self.rebuild_index();
        self.dirty = directory.recovered;
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (slot, entry) in self.entries.iter().enumerate() {
            self.index
                .entry(name_key(&entry.name, self.case_sensitive))
                .or_insert(slot);
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.busy.load(Ordering::Acquire) {
            return Err(ZipError::ArchiveBusy);
        }
        Ok(())
    }

    fn slot(&self, name: &str) -> Result<usize> {
        self.index
            .get(&name_key(name, self.case_sensitive))
            .copied()
            .ok_or_else(|| ZipError::entry_not_found(name))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the archive has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, in insertion order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Look up an entry by name.
    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.slot(name).ok().map(|slot| &self.entries[slot])
    }

    /// Look up an entry for modification. Marks the archive changed.
    pub fn entry_mut(&mut self, name: &str) -> Option<&mut ZipEntry> {
        let slot = self.slot(name).ok()?;
        self.dirty = true;
        Some(&mut self.entries[slot])
    }

    /// True if an entry with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.slot(name).is_ok()
    }

    /// Archive comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Path the archive was opened from or last saved to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True if the archive changed since it was opened or last saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True if the entries came from a local header scan because the
    /// central directory could not be found.
    pub fn was_recovered(&self) -> bool {
        self.recovered
    }

    /// True if the last save wrote ZIP64 records.
    pub fn used_zip64(&self) -> bool {
        self.output_used_zip64
    }

    /// ZIP64 policy.
    pub fn zip64(&self) -> Zip64Option {
        self.zip64
    }

    /// Number of volumes of the opened archive (1 when not split).
    pub fn disk_count(&self) -> u32 {
        self.input.as_ref().map_or(1, Input::disk_count)
    }

    /// Volume size limit; 0 when unsegmented.
    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    /// A handle to the cancellation flag, usable from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Register the sink that receives every notification.
    pub fn set_event_sink(&mut self, sink: impl EventSink + Send + 'static) {
        self.events = Some(Box::new(sink));
    }

    /// Remove the event sink.
    pub fn clear_event_sink(&mut self) {
        self.events = None;
    }

    /// Set the archive comment.
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
        self.dirty = true;
    }

    /// Set the archive password.
    ///
    /// Entries added afterwards are written with it, and extraction falls back
    /// to it for entries that have no password of their own.
    pub fn set_password(&mut self, password: Option<String>) {
        self.password = password;
        self.dirty = true;
    }

    /// Encryption for entries added afterwards.
    pub fn set_encryption(&mut self, encryption: EncryptionAlgorithm) {
        self.encryption = encryption;
        self.dirty = true;
    }

    /// Compression method for file entries added afterwards.
    pub fn set_compression_method(&mut self, method: CompressionMethod) {
        self.method = method;
        self.dirty = true;
    }

    /// Compression level (0-9) for entries added afterwards.
    pub fn set_compression_level(&mut self, level: u32) {
        self.level = level.min(9);
        self.dirty = true;
    }

    /// ZIP64 policy for the next save.
    pub fn set_zip64(&mut self, zip64: Zip64Option) {
        self.zip64 = zip64;
        self.dirty = true;
    }

    /// Split the next save into volumes of at most `size` bytes; 0 disables.
    pub fn set_max_segment_size(&mut self, size: u64) -> Result<()> {
        segmented::validate_segment_size(size)?;
        self.max_segment_size = size;
        self.dirty = true;
        Ok(())
    }

    /// Alternate encoding for names and comments and when to use it.
    pub fn set_alternate_encoding(
        &mut self,
        encoding: &'static Encoding,
        usage: AlternateEncodingUsage,
    ) {
        self.encoding = TextEncoding::new(encoding, usage);
        self.dirty = true;
    }

    /// Write entries sorted by name instead of in insertion order.
    pub fn set_sort_entries(&mut self, sort: bool) {
        self.sort_entries = sort;
        self.dirty = true;
    }

    /// Compare names case-sensitively. Fails with `DuplicateEntry`, leaving
    /// the setting unchanged, if two names would collide.
    pub fn set_case_sensitive(&mut self, case_sensitive: bool) -> Result<()> {
        let mut seen = HashMap::new();
        for (slot, entry) in self.entries.iter().enumerate() {
            if seen
                .insert(name_key(&entry.name, case_sensitive), slot)
                .is_some()
            {
                return Err(ZipError::duplicate_entry(&entry.name));
            }
        }
        self.case_sensitive = case_sensitive;
        self.index = seen;
        Ok(())
    }

    /// Which high-precision time blocks entries added afterwards carry.
    pub fn set_time_formats(&mut self, formats: TimeFormats) {
        self.time_formats = formats;
        self.dirty = true;
    }

    /// Parallel deflate settings for the next save.
    pub fn set_parallel_deflate(&mut self, parallel: ParallelDeflate) {
        self.parallel = parallel;
    }

    /// What extraction does when a target file exists.
    pub fn set_extract_existing(&mut self, policy: ExtractExistingFile) {
        self.extract_existing = policy;
    }

    // ------------------------------------------------------------------
    // Adding and removing entries
    // ------------------------------------------------------------------

    fn insert(&mut self, mut entry: ZipEntry) -> Result<&mut ZipEntry> {
        self.ensure_idle()?;
        if entry.name.is_empty() {
            return Err(ZipError::unsaveable("entry name is empty"));
        }
        let key = name_key(&entry.name, self.case_sensitive);
        if self.index.contains_key(&key) {
            return Err(ZipError::duplicate_entry(&entry.name));
        }

        if !entry.is_directory {
            entry.method = self.method;
        }
        entry.level = self.level;
        entry.encryption = self.encryption;
        entry.password = self.password.clone();
        entry.emit_ntfs = self.time_formats.ntfs;
        entry.emit_unix = self.time_formats.unix;

        debug!(name = %entry.name, source = ?entry.source, "adding entry");
        let slot = self.entries.len();
        self.entries.push(entry);
        self.index.insert(key, slot);
        self.dirty = true;
        Ok(&mut self.entries[slot])
    }

    /// Add a file from disk under `dir_in_archive` (empty for the root). The
    /// file is read when the archive is saved.
    pub fn add_file(
        &mut self,
        path: impl AsRef<Path>,
        dir_in_archive: &str,
    ) -> Result<&mut ZipEntry> {
        let path = path.as_ref();
        let meta = fs::metadata(path)?;
        let file_name = path.file_name().ok_or_else(|| {
            ZipError::unsaveable(format!("{} has no file name", path.display()))
        })?;
        let name = normalize_name(
            &archive_path(dir_in_archive, &file_name.to_string_lossy()),
            false,
        );
        let mut entry = ZipEntry::new(name, false, EntrySource::File(path.to_path_buf()));
        stamp_metadata(&mut entry, &meta);
        self.insert(entry)
    }

    /// Add the contents of a directory on disk, recursively, under
    /// `dir_in_archive`. Returns the number of entries added.
    pub fn add_directory(&mut self, path: impl AsRef<Path>, dir_in_archive: &str) -> Result<usize> {
        let root = path.as_ref();
        let meta = fs::metadata(root)?;
        if !meta.is_dir() {
            return Err(ZipError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            )));
        }
        let prefix = normalize_name(dir_in_archive, false);
        let prefix = prefix.trim_end_matches('/');
        let mut added = 0;
        if !prefix.is_empty() {
            let mut entry = ZipEntry::new(
                normalize_name(prefix, true),
                true,
                EntrySource::Buffer(Vec::new()),
            );
            stamp_metadata(&mut entry, &meta);
            self.insert(entry)?;
            added += 1;
        }
        self.add_tree(root, prefix, &mut added)?;
        info!(path = %root.display(), added, "directory added");
        Ok(added)
    }

    fn add_tree(&mut self, dir: &Path, prefix: &str, added: &mut usize) -> Result<()> {
        let mut children = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        children.sort_by_key(fs::DirEntry::file_name);
        for child in children {
            let path = child.path();
            let meta = fs::metadata(&path)?;
            let name = archive_path(prefix, &child.file_name().to_string_lossy());
            if meta.is_dir() {
                let mut entry =
                    ZipEntry::new(normalize_name(&name, true), true, EntrySource::Buffer(Vec::new()));
                stamp_metadata(&mut entry, &meta);
                self.insert(entry)?;
                *added += 1;
                self.add_tree(&path, &name, added)?;
            } else {
                let mut entry =
                    ZipEntry::new(normalize_name(&name, false), false, EntrySource::File(path));
                stamp_metadata(&mut entry, &meta);
                self.insert(entry)?;
                *added += 1;
            }
        }
        Ok(())
    }

    /// Add an empty directory entry.
    pub fn add_directory_entry(&mut self, name: &str) -> Result<&mut ZipEntry> {
        let entry = ZipEntry::new(
            normalize_name(name, true),
            true,
            EntrySource::Buffer(Vec::new()),
        );
        self.insert(entry)
    }

    /// Add an entry with in-memory content.
    pub fn add_entry(&mut self, name: &str, data: impl Into<Vec<u8>>) -> Result<&mut ZipEntry> {
        let entry = ZipEntry::new(
            normalize_name(name, false),
            false,
            EntrySource::Buffer(data.into()),
        );
        self.insert(entry)
    }

    /// Add an entry whose content is read from `reader` by the next save.
    /// The reader is consumed; a second save fails for this entry.
    pub fn add_stream(
        &mut self,
        name: &str,
        reader: impl Read + Send + 'static,
    ) -> Result<&mut ZipEntry> {
        let entry = ZipEntry::new(
            normalize_name(name, false),
            false,
            EntrySource::Stream(Some(Box::new(reader))),
        );
        self.insert(entry)
    }

    /// Add an entry whose content is written by `write` during the save.
    pub fn add_with_writer<F>(&mut self, name: &str, write: F) -> Result<&mut ZipEntry>
    where
        F: FnMut(&str, &mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        let entry = ZipEntry::new(
            normalize_name(name, false),
            false,
            EntrySource::WriteCallback(Box::new(write)),
        );
        self.insert(entry)
    }

    /// Add an entry read from a stream that `open` provides at save time and
    /// that is handed to `close` afterwards, on every exit path.
    pub fn add_with_open_close(
        &mut self,
        name: &str,
        open: OpenCallback,
        close: CloseCallback,
    ) -> Result<&mut ZipEntry> {
        let entry = ZipEntry::new(
            normalize_name(name, false),
            false,
            EntrySource::OpenClose { open, close },
        );
        self.insert(entry)
    }

    /// Remove an entry and return it.
    pub fn remove_entry(&mut self, name: &str) -> Result<ZipEntry> {
        self.ensure_idle()?;
        let slot = self.slot(name)?;
        let entry = self.entries.remove(slot);
        self.rebuild_index();
        self.dirty = true;
        debug!(name = %entry.name, "entry removed");
        Ok(entry)
    }

    /// Remove `name` if present. Returns the removed entry so a failed add
    /// can put it back.
    fn take_existing(&mut self, name: &str) -> Result<Option<(usize, ZipEntry)>> {
        self.ensure_idle()?;
        match self.slot(name) {
            Ok(slot) => {
                let entry = self.entries.remove(slot);
                self.rebuild_index();
                Ok(Some((slot, entry)))
            }
            Err(_) => Ok(None),
        }
    }

    fn restore(&mut self, previous: Option<(usize, ZipEntry)>) {
        if let Some((slot, entry)) = previous {
            self.entries.insert(slot.min(self.entries.len()), entry);
            self.rebuild_index();
        }
    }

    /// Add or replace an entry with in-memory content.
    pub fn update_entry(&mut self, name: &str, data: impl Into<Vec<u8>>) -> Result<&mut ZipEntry> {
        let previous = self.take_existing(&normalize_name(name, false))?;
        let entry = ZipEntry::new(
            normalize_name(name, false),
            false,
            EntrySource::Buffer(data.into()),
        );
        self.insert_replacing(entry, previous)
    }

    /// Add or replace a file from disk.
    pub fn update_file(
        &mut self,
        path: impl AsRef<Path>,
        dir_in_archive: &str,
    ) -> Result<&mut ZipEntry> {
        let path = path.as_ref();
        let file_name = path.file_name().ok_or_else(|| {
            ZipError::unsaveable(format!("{} has no file name", path.display()))
        })?;
        let name = normalize_name(
            &archive_path(dir_in_archive, &file_name.to_string_lossy()),
            false,
        );
        let meta = fs::metadata(path)?;
        let previous = self.take_existing(&name)?;
        let mut entry = ZipEntry::new(name, false, EntrySource::File(path.to_path_buf()));
        stamp_metadata(&mut entry, &meta);
        self.insert_replacing(entry, previous)
    }

    /// Add or replace an entry read from a stream.
    pub fn update_stream(
        &mut self,
        name: &str,
        reader: impl Read + Send + 'static,
    ) -> Result<&mut ZipEntry> {
        let previous = self.take_existing(&normalize_name(name, false))?;
        let entry = ZipEntry::new(
            normalize_name(name, false),
            false,
            EntrySource::Stream(Some(Box::new(reader))),
        );
        self.insert_replacing(entry, previous)
    }

    fn insert_replacing(
        &mut self,
        entry: ZipEntry,
        previous: Option<(usize, ZipEntry)>,
    ) -> Result<&mut ZipEntry> {
        if let Err(err) = self.insert(entry) {
            self.restore(previous);
            return Err(err);
        }
        let slot = self.entries.len() - 1;
        Ok(&mut self.entries[slot])
    }

    // ------------------------------------------------------------------
    // Extraction
    // ------------------------------------------------------------------

    /// Extract one entry below `dir`, applying the collision policy.
    pub fn extract_to_dir(&mut self, name: &str, dir: impl AsRef<Path>) -> Result<ExtractOutcome> {
        self.ensure_idle()?;
        self.cancel.reset();
        let slot = self.slot(name)?;
        self.extract_slot(slot, dir.as_ref())
    }

    fn extract_slot(&mut self, slot: usize, dir: &Path) -> Result<ExtractOutcome> {
        let entry = &self.entries[slot];
        let input = self.input.as_mut().ok_or_else(|| ZipError::NotSaved {
            name: entry.name.clone(),
        })?;
        let password = entry
            .source_password
            .as_deref()
            .or(self.password.as_deref());
        let mut notifier = notifier(&mut self.events, &self.cancel);
        extract::extract_to_dir(
            input,
            entry,
            dir,
            password,
            self.extract_existing,
            &mut notifier,
        )
    }

    /// Extract every entry below `dir`. Stops early when cancelled; entries
    /// already extracted stay on disk.
    pub fn extract_all(&mut self, dir: impl AsRef<Path>) -> Result<ExtractOutcome> {
        self.ensure_idle()?;
        self.cancel.reset();
        let dir = dir.as_ref();
        notifier(&mut self.events, &self.cancel).notify(ZipEvent::ExtractStarted {
            entries: self.entries.len(),
        });
        for slot in 0..self.entries.len() {
            if self.cancel.is_cancelled() {
                return Ok(ExtractOutcome::Cancelled);
            }
            if self.extract_slot(slot, dir)? == ExtractOutcome::Cancelled {
                info!(dir = %dir.display(), "extraction cancelled");
                return Ok(ExtractOutcome::Cancelled);
            }
        }
        notifier(&mut self.events, &self.cancel).notify(ZipEvent::ExtractCompleted);
        info!(dir = %dir.display(), entries = self.entries.len(), "extraction finished");
        Ok(ExtractOutcome::Extracted)
    }

    /// Decode an entry into `out`. Nothing is deleted on failure.
    pub fn extract_to_writer(&mut self, name: &str, out: &mut dyn Write) -> Result<ExtractOutcome> {
        self.ensure_idle()?;
        self.cancel.reset();
        let slot = self.slot(name)?;
        let entry = &self.entries[slot];
        let input = self.input.as_mut().ok_or_else(|| ZipError::NotSaved {
            name: entry.name.clone(),
        })?;
        let password = entry
            .source_password
            .as_deref()
            .or(self.password.as_deref());
        let mut notifier = notifier(&mut self.events, &self.cancel);
        notifier.notify(ZipEvent::ExtractEntryStarted { name: &entry.name });
        let outcome = extract::decode_entry(input, entry, password, out, &mut notifier)?;
        if outcome == ExtractOutcome::Extracted {
            notifier.notify(ZipEvent::ExtractEntryCompleted { name: &entry.name });
        }
        Ok(outcome)
    }

    /// A reader over an entry's content. The CRC (or AES authentication code)
    /// is checked when the reader reaches the end.
    pub fn open_reader(&mut self, name: &str) -> Result<EntryReader<'_>> {
        let busy = BusyGuard::acquire(&self.busy)?;
        let slot = self.slot(name)?;
        let entry = &self.entries[slot];
        let input = self.input.as_mut().ok_or_else(|| ZipError::NotSaved {
            name: entry.name.clone(),
        })?;
        let password = entry
            .source_password
            .as_deref()
            .or(self.password.as_deref());
        let decoding = Decoding::open(input, entry, password)?;
        Ok(EntryReader::new(decoding, busy))
    }

    /// Decode an entry and discard the output, verifying its CRC or
    /// authentication code.
    pub fn check(&mut self, name: &str) -> Result<ExtractOutcome> {
        self.extract_to_writer(name, &mut io::sink())
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    fn save_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        if self.sort_entries {
            order.sort_by(|&a, &b| self.entries[a].name.cmp(&self.entries[b].name));
        }
        order
    }

    fn write_to(&mut self, sink: &mut dyn OutputSink, order: &[usize]) -> Result<SaveReport> {
        let settings = SaveSettings {
            zip64: self.zip64,
            encoding: &self.encoding,
            parallel: &self.parallel,
            password: self.password.as_deref(),
            comment: &self.comment,
        };
        let mut notifier = notifier(&mut self.events, &self.cancel);
        let report = save::write_archive(
            sink,
            &mut self.entries,
            order,
            self.input.as_mut(),
            &settings,
            &mut notifier,
        )?;
        if report.outcome == SaveOutcome::Saved {
            self.output_used_zip64 = report.zip64;
        }
        Ok(report)
    }

    /// Save back to the path the archive was opened from or last saved to.
    /// Does nothing if nothing changed.
    pub fn save(&mut self) -> Result<SaveOutcome> {
        if !self.dirty {
            return Ok(SaveOutcome::Unchanged);
        }
        let path = self
            .path
            .clone()
            .ok_or_else(|| ZipError::unsaveable("the archive has no path; use save_as"))?;
        self.save_as(path)
    }

    /// Save to `path`, through a temporary file in the same directory, and
    /// reopen the result. Split into volumes when a segment size is set.
    pub fn save_as(&mut self, path: impl AsRef<Path>) -> Result<SaveOutcome> {
        self.ensure_idle()?;
        let target = path.as_ref().to_path_buf();
        if !self.dirty && self.path.as_deref() == Some(target.as_path()) {
            return Ok(SaveOutcome::Unchanged);
        }
        self.cancel.reset();
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let order = self.save_order();

        let report = if self.max_segment_size > 0 {
            self.save_segmented(&target, &parent, &order)?
        } else {
            self.save_single(&target, &parent, &order)?
        };
        if report.outcome != SaveOutcome::Saved {
            return Ok(report.outcome);
        }
        self.reopen(&target)?;
        info!(path = %target.display(), zip64 = report.zip64, "archive saved");
        Ok(SaveOutcome::Saved)
    }

    fn save_single(&mut self, target: &Path, parent: &Path, order: &[usize]) -> Result<SaveReport> {
        let mut temp = tempfile::Builder::new()
            .prefix(".oxizip-")
            .suffix(".tmp")
            .tempfile_in(parent)?;
        debug!(temp = %temp.path().display(), "writing to temporary file");

        let (report, len) = {
            let mut sink = SeekableSink::new(BufWriter::new(temp.as_file_mut()))?;
            let report = self.write_to(&mut sink, order)?;
            (report, sink.position())
        };
        if report.outcome != SaveOutcome::Saved {
            return Ok(report);
        }
        // A rewound entry can leave bytes past the end of the archive.
        temp.as_file().set_len(len)?;
        temp.as_file().sync_all()?;

        remove_stale_volumes(target)?;
        let previous = self.input.take();
        if let Err(err) = replace_file(temp, target) {
            self.input = previous;
            return Err(err);
        }
        Ok(report)
    }

    fn save_segmented(
        &mut self,
        target: &Path,
        parent: &Path,
        order: &[usize],
    ) -> Result<SaveReport> {
        let staging = tempfile::Builder::new()
            .prefix(".oxizip-")
            .tempdir_in(parent)?;
        let file_name = target.file_name().ok_or_else(|| {
            ZipError::unsaveable(format!("{} has no file name", target.display()))
        })?;
        let staged = staging.path().join(file_name);
        let mut writer = SegmentedWriter::create(&staged, self.max_segment_size)?;
        let report = self.write_to(&mut writer, order)?;
        if report.outcome != SaveOutcome::Saved {
            return Ok(report);
        }
        let volumes = writer.volumes().to_vec();
        drop(writer);

        self.input = None;
        remove_stale_volumes(target)?;
        let last = volumes.len().saturating_sub(1);
        for (disk, volume) in volumes.iter().enumerate() {
            let dest = if disk == last {
                target.to_path_buf()
            } else {
                segmented::volume_path(target, disk as u32)
            };
            debug!(from = %volume.display(), to = %dest.display(), "moving volume");
            fs::rename(volume, &dest)?;
        }
        Ok(report)
    }

    /// Read back what was just written so archive entries point at the new
    /// bytes. Written passwords become the keys for the stored bytes.
    fn reopen(&mut self, target: &Path) -> Result<()> {
        let mut input = open_input(target)?;
        let options = ReadOptions {
            password: None,
            encoding: self.encoding,
            case_sensitive: self.case_sensitive,
        };
        let directory = {
            let mut silent = Notifier::new(None, self.cancel.clone());
            reader::read_directory(&mut input, &options, &mut silent)?
        };

        let mut fresh: HashMap<String, ZipEntry> = directory
            .entries
            .into_iter()
            .map(|entry| (name_key(&entry.name, self.case_sensitive), entry))
            .collect();
        let previous = std::mem::take(&mut self.entries);
        let mut still_dirty = false;
        for old in previous {
            let key = name_key(&old.name, self.case_sensitive);
            if old.included_in_save {
                if let Some(mut entry) = fresh.remove(&key) {
                    entry.level = old.level;
                    entry.source_password = old.password.clone();
                    entry.password = old.password;
                    self.entries.push(entry);
                    continue;
                }
            }
            if matches!(old.source, EntrySource::Archive(_)) {
                warn!(name = %old.name, "entry was not saved and its old bytes are gone; dropping it");
            } else {
                still_dirty = true;
                self.entries.push(old);
            }
        }

        if directory.zip64 {
            self.zip64 = Zip64Option::Always;
        }
        self.comment = directory.comment;
        self.recovered = false;
        self.rebuild_index();
        self.input = Some(input);
        self.path = Some(target.to_path_buf());
        self.dirty = still_dirty;
        Ok(())
    }

    /// Save to a seekable writer. The handle keeps reading from its
    /// original input.
    pub fn save_to_writer<W: Write + Seek>(&mut self, writer: W) -> Result<SaveOutcome> {
        self.ensure_idle()?;
        self.cancel.reset();
        let order = self.save_order();
        let mut sink = SeekableSink::new(writer)?;
        Ok(self.write_to(&mut sink, &order)?.outcome)
    }

    /// Save to a forward-only writer. Every re-encoded entry gets a data
    /// descriptor.
    pub fn save_to_stream<W: Write>(&mut self, writer: W) -> Result<SaveOutcome> {
        self.ensure_idle()?;
        self.cancel.reset();
        let order = self.save_order();
        let mut sink = StreamingSink::new(writer);
        Ok(self.write_to(&mut sink, &order)?.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn saved_bytes(archive: &mut ZipArchive) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        archive.save_to_writer(&mut out).expect("save");
        out.into_inner()
    }

    #[test]
    fn test_archive_path_join() {
        assert_eq!(archive_path("", "a.txt"), "a.txt");
        assert_eq!(archive_path("docs/", "a.txt"), "docs/a.txt");
        assert_eq!(archive_path("docs", "a.txt"), "docs/a.txt");
    }

    #[test]
    fn test_duplicate_leaves_archive_unchanged() {
        let mut archive = ZipArchive::new();
        archive.add_entry("a.txt", b"one".to_vec()).expect("add");
        let err = archive.add_entry("A.TXT", b"two".to_vec());
        assert!(matches!(err, Err(ZipError::DuplicateEntry { .. })));
        assert_eq!(archive.len(), 1);

        archive.set_case_sensitive(true).expect("no collisions");
        archive.add_entry("A.TXT", b"two".to_vec()).expect("distinct now");
        assert!(matches!(
            archive.set_case_sensitive(false),
            Err(ZipError::DuplicateEntry { .. })
        ));
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn test_update_replaces_in_place() {
        let mut archive = ZipArchive::new();
        archive.add_entry("a.txt", b"old".to_vec()).expect("add");
        archive.update_entry("a.txt", b"new".to_vec()).expect("update");
        assert_eq!(archive.len(), 1);
        let entry = archive.entry("a.txt").expect("entry");
        assert!(matches!(entry.source(), EntrySource::Buffer(b) if b == b"new"));
    }

    #[test]
    fn test_defaults_apply_to_new_entries() {
        let mut archive = ZipArchive::new();
        archive.set_encryption(EncryptionAlgorithm::WinZipAes256);
        archive.set_password(Some("pw".into()));
        archive.set_compression_level(12);
        let entry = archive.add_entry("x", b"data".to_vec()).expect("add");
        assert_eq!(entry.encryption(), EncryptionAlgorithm::WinZipAes256);
        assert_eq!(entry.compression_level(), 9);
        let dir = archive.add_directory_entry("d").expect("dir");
        assert_eq!(dir.name(), "d/");
        assert_eq!(dir.compression_method(), CompressionMethod::Stored);
    }

    #[test]
    fn test_read_back_from_memory() {
        let mut archive = ZipArchive::new();
        archive.set_comment("note");
        archive
            .add_entry("dir/file.txt", b"content ".repeat(100))
            .expect("add");
        let bytes = saved_bytes(&mut archive);

        let mut reopened = ZipArchive::read(Cursor::new(bytes), ReadOptions::default()).expect("read");
        assert_eq!(reopened.comment(), "note");
        assert!(!reopened.is_dirty());
        let mut out = Vec::new();
        reopened
            .extract_to_writer("dir/file.txt", &mut out)
            .expect("extract");
        assert_eq!(out, b"content ".repeat(100));
        assert_eq!(reopened.check("DIR/FILE.TXT").expect("check"), ExtractOutcome::Extracted);
    }

    #[test]
    fn test_unsaved_entry_cannot_be_read() {
        let mut archive = ZipArchive::new();
        archive.add_entry("a", b"x".to_vec()).expect("add");
        assert!(matches!(
            archive.extract_to_writer("a", &mut io::sink()),
            Err(ZipError::NotSaved { .. })
        ));
        assert!(matches!(
            archive.extract_to_writer("missing", &mut io::sink()),
            Err(ZipError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_save_without_path_is_rejected() {
        let mut archive = ZipArchive::new();
        assert!(matches!(archive.save(), Err(ZipError::Unsaveable { .. })));
    }
}
