//! Save pipeline.
//!
//! Entries are written one at a time: local header, transformed content,
//! optional data descriptor. Content goes through
//! `CrcWriter -> Compressor -> Encryptor -> sink`. Archive entries that were
//! not changed are copied as raw stored bytes.
//!
//! The central directory is rendered into memory first so that its size is
//! known before deciding on ZIP64 records and on which volume the trailer
//! lands.

use crate::codec::{Compressor, Encryptor};
use crate::crypto::zipcrypto::check_byte;
use crate::crypto::{AesWriter, ZipCryptoWriter};
use crate::encoding::TextEncoding;
use crate::entry::{CompressionMethod, EncryptionAlgorithm, ZipEntry};
use crate::events::{Notifier, Reply, ZipEvent};
use crate::extra::{
    self, AES_EXTRA_ID, AesExtra, DUMMY_EXTRA_ID, NTFS_EXTRA_ID, UNIX_TIME_EXTRA_ID,
    ZIP64_EXTRA_ID, Zip64Fields,
};
use crate::extract::{CHUNK_SIZE, Decoding};
use crate::header::{
    self, CentralDirectoryHeader, DataDescriptor, EOCD_LEN, EndOfCentralDirectory,
    FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED, FLAG_UTF8, LocalFileHeader, MARKER_16, MARKER_32,
    METHOD_AES, VERSION_AES, VERSION_DEFAULT, VERSION_ZIP64, ZIP64_EOCD_LEN, ZIP64_LOCATOR_LEN,
    Zip64EndOfCentralDirectory, Zip64Locator,
};
use crate::input::Input;
use crate::options::{ParallelDeflate, Zip64Option};
use crate::parallel::ParallelDeflater;
use crate::sink::{OutputSink, Placement};
use crate::source::{EntrySource, OpenedSource, StoredData};
use crate::time::DosDateTime;
use oxizip_core::CrcWriter;
use oxizip_core::error::{ErrorKind, Result, ZipError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, info, warn};

/// Entries predicted within this many bytes of the 32-bit limit get a
/// ZIP64 block reserved in their local header.
const ZIP64_HEADROOM: u64 = 16 * 1024 * 1024;

/// Payload of a local ZIP64 block: both sizes.
const LOCAL_ZIP64_DATA_LEN: usize = 16;

/// Deflate flag bits (1 and 2) kept from stored entries.
const FLAG_DEFLATE_OPTIONS: u16 = 0x0006;

/// How a save ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The archive was written.
    Saved,
    /// Nothing changed since the last save; nothing was written.
    Unchanged,
    /// Cancelled; the destination was left as it was.
    Cancelled,
}

/// Settings a save reads from the archive handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SaveSettings<'a> {
    pub(crate) zip64: Zip64Option,
    pub(crate) encoding: &'a TextEncoding,
    pub(crate) parallel: &'a ParallelDeflate,
    /// Decrypts archive entries that carry no password of their own.
    pub(crate) password: Option<&'a str>,
    pub(crate) comment: &'a str,
}

/// Result of writing a whole archive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SaveReport {
    pub(crate) outcome: SaveOutcome,
    pub(crate) zip64: bool,
}

/// Name and comment bytes plus whether they are UTF-8.
struct EncodedTexts {
    name: Vec<u8>,
    comment: Vec<u8>,
    utf8: bool,
}

/// Encode name and comment with one shared UTF-8 flag.
///
/// Bit 11 covers both strings of a header. When one of them needs UTF-8 and
/// the other would go out in the legacy code page, both are written as UTF-8
/// so a reader decodes them with the same charset.
fn encode_texts(encoding: &TextEncoding, name: &str, comment: &str) -> EncodedTexts {
    let name_enc = encoding.encode(name);
    let comment_enc = encoding.encode(comment);
    if name_enc.utf8 == comment_enc.utf8 {
        return EncodedTexts {
            name: name_enc.bytes,
            comment: comment_enc.bytes,
            utf8: name_enc.utf8,
        };
    }
    EncodedTexts {
        name: name.as_bytes().to_vec(),
        comment: comment.as_bytes().to_vec(),
        utf8: true,
    }
}

/// State of the local ZIP64 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalZip64 {
    Absent,
    /// Reserved space, rewritten as padding.
    Padding,
    Sizes { uncompressed: u64, compressed: u64 },
}

/// Everything needed to render an entry's local header.
struct LocalPlan<'e> {
    entry: &'e ZipEntry,
    texts: EncodedTexts,
    flags: u16,
    method: CompressionMethod,
    encryption: EncryptionAlgorithm,
    aes_version: u16,
    modified: DosDateTime,
}

impl LocalPlan<'_> {
    fn header_method(&self) -> u16 {
        if self.encryption.aes_strength().is_some() {
            METHOD_AES
        } else {
            self.method.to_u16()
        }
    }

    fn aes_extra(&self) -> Option<AesExtra> {
        self.encryption.aes_strength().map(|strength| AesExtra {
            vendor_version: self.aes_version,
            strength,
            method: self.method.to_u16(),
        })
    }

    fn version_needed(&self, zip64: bool) -> u16 {
        if self.aes_extra().is_some() {
            VERSION_AES
        } else if zip64 {
            VERSION_ZIP64
        } else {
            VERSION_DEFAULT
        }
    }

    /// Render the local header. Sizes that do not fit, or that live in the
    /// ZIP64 block, are written as sentinels.
    fn render(&self, crc32: u32, compressed: u64, uncompressed: u64, zip64: LocalZip64) -> Vec<u8> {
        let mut extra = Vec::new();
        let (compressed_field, uncompressed_field) = match zip64 {
            LocalZip64::Absent => (compressed as u32, uncompressed as u32),
            LocalZip64::Padding => {
                extra::put_block(&mut extra, DUMMY_EXTRA_ID, &[0u8; LOCAL_ZIP64_DATA_LEN]);
                (compressed as u32, uncompressed as u32)
            }
            LocalZip64::Sizes {
                uncompressed: u,
                compressed: c,
            } => {
                let fields = Zip64Fields {
                    uncompressed: Some(u),
                    compressed: Some(c),
                    ..Default::default()
                };
                extra::put_block(&mut extra, ZIP64_EXTRA_ID, &fields.to_data());
                (MARKER_32, MARKER_32)
            }
        };
        append_common_extra(&mut extra, self.entry, self.aes_extra(), false);

        LocalFileHeader {
            version_needed: self.version_needed(matches!(zip64, LocalZip64::Sizes { .. })),
            flags: self.flags,
            method: self.header_method(),
            modified: self.modified,
            crc32,
            compressed_size: compressed_field,
            uncompressed_size: uncompressed_field,
            name: self.texts.name.clone(),
            extra,
        }
        .to_bytes()
    }
}

/// Time, AES and unrecognized blocks, after any ZIP64 block.
fn append_common_extra(out: &mut Vec<u8>, entry: &ZipEntry, aes: Option<AesExtra>, central: bool) {
    if let Some(times) = entry.times {
        if entry.emit_ntfs {
            extra::put_block(out, NTFS_EXTRA_ID, &extra::ntfs_times_data(&times));
        }
        if entry.emit_unix {
            extra::put_block(
                out,
                UNIX_TIME_EXTRA_ID,
                &extra::unix_times_data(&times, central),
            );
        }
    }
    if let Some(aes) = aes {
        extra::put_block(out, AES_EXTRA_ID, &aes.to_data());
    }
    for block in &entry.extra_unknown {
        extra::put_block(out, block.id, &block.data);
    }
}

/// What one entry produced.
struct Written {
    placement: Placement,
    crc32: u32,
    compressed: u64,
    uncompressed: u64,
    flags: u16,
    method: CompressionMethod,
    encryption: EncryptionAlgorithm,
    aes_version: u16,
    modified: DosDateTime,
    version_needed: u16,
    zip64: bool,
}

enum EntryResult {
    Written(Written),
    Cancelled,
}

/// Write all entries in `order`, then the central directory.
pub(crate) fn write_archive(
    sink: &mut dyn OutputSink,
    entries: &mut [ZipEntry],
    order: &[usize],
    mut input: Option<&mut Input>,
    settings: &SaveSettings<'_>,
    notifier: &mut Notifier<'_>,
) -> Result<SaveReport> {
    if settings.zip64 == Zip64Option::Never && order.len() >= usize::from(MARKER_16) {
        return Err(ZipError::zip64_required(format!(
            "{} entries exceed the classic limit of 65534",
            order.len()
        )));
    }

    info!(entries = order.len(), "saving archive");
    notifier.notify(ZipEvent::SaveStarted {
        entries: order.len(),
    });
    for entry in entries.iter_mut() {
        entry.included_in_save = false;
    }

    let total = order.len();
    for (index, &slot) in order.iter().enumerate() {
        let entry = &mut entries[slot];
        if notifier.cancelled() {
            return Ok(cancelled());
        }
        notifier.notify(ZipEvent::SaveEntryStarted {
            name: &entry.name,
            index,
            total,
        });
        if notifier.cancelled() {
            return Ok(cancelled());
        }

        loop {
            let mark = sink.mark();
            let result = write_entry(sink, entry, input.as_deref_mut(), settings, notifier);
            match result {
                Ok(EntryResult::Written(written)) => {
                    apply_written(entry, written);
                    notifier.notify(ZipEvent::SaveEntryCompleted { name: &entry.name });
                    break;
                }
                Ok(EntryResult::Cancelled) => {
                    sink.rewind_to(mark)?;
                    return Ok(cancelled());
                }
                Err(err) if is_recoverable(&err) && notifier.has_sink() => {
                    warn!(name = %entry.name, %err, "failed to write entry");
                    let reply = notifier.notify(ZipEvent::SaveError {
                        name: &entry.name,
                        error: &err,
                    });
                    match reply {
                        Reply::Retry | Reply::Skip => {
                            if !sink.rewind_to(mark)? {
                                warn!(name = %entry.name, "output cannot be rewound");
                                return Err(err);
                            }
                            if reply == Reply::Skip {
                                debug!(name = %entry.name, "entry skipped");
                                break;
                            }
                        }
                        Reply::Cancel => {
                            sink.rewind_to(mark)?;
                            return Ok(cancelled());
                        }
                        _ => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    let zip64 = write_central_directory(sink, entries, order, settings)?;
    sink.finish()?;
    notifier.notify(ZipEvent::SaveCompleted);
    Ok(SaveReport {
        outcome: SaveOutcome::Saved,
        zip64,
    })
}

fn cancelled() -> SaveReport {
    info!("save cancelled");
    SaveReport {
        outcome: SaveOutcome::Cancelled,
        zip64: false,
    }
}

/// Failures reading an entry's content can be retried or skipped; policy
/// and credential failures cannot.
fn is_recoverable(err: &ZipError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Io | ErrorKind::Format | ErrorKind::Integrity
    )
}

fn apply_written(entry: &mut ZipEntry, written: Written) {
    entry.included_in_save = true;
    entry.local_header_offset = written.placement.offset;
    entry.disk_number = written.placement.disk;
    entry.crc32 = written.crc32;
    entry.compressed_size = written.compressed;
    entry.uncompressed_size = written.uncompressed;
    entry.flags = written.flags;
    entry.method = written.method;
    entry.encryption = written.encryption;
    entry.aes_version = written.aes_version;
    entry.modified = written.modified;
    entry.version_needed = written.version_needed;
    entry.output_zip64 = written.zip64;
}

fn check_offset(placement: Placement, policy: Zip64Option, name: &str) -> Result<bool> {
    let needs = placement.offset >= u64::from(MARKER_32);
    if needs && policy == Zip64Option::Never {
        return Err(ZipError::zip64_required(format!(
            "{name}: local header offset {} exceeds 32 bits",
            placement.offset
        )));
    }
    Ok(needs)
}

fn write_entry(
    sink: &mut dyn OutputSink,
    entry: &mut ZipEntry,
    input: Option<&mut Input>,
    settings: &SaveSettings<'_>,
    notifier: &mut Notifier<'_>,
) -> Result<EntryResult> {
    if let EntrySource::Archive(data) = &entry.source {
        if !entry.needs_restream() {
            let data = data.clone();
            let input = input.ok_or_else(|| {
                ZipError::unsaveable(format!("{}: the source archive is not open", entry.name))
            })?;
            return copy_stored(sink, entry, &data, input, settings, notifier);
        }
    }
    encode_entry(sink, entry, input, settings, notifier)
}

/// Copy an unchanged archive entry without decoding it.
fn copy_stored(
    sink: &mut dyn OutputSink,
    entry: &ZipEntry,
    data: &StoredData,
    input: &mut Input,
    settings: &SaveSettings<'_>,
    notifier: &mut Notifier<'_>,
) -> Result<EntryResult> {
    let name = entry.name.as_str();
    let texts = encode_texts(settings.encoding, name, &entry.comment);
    let descriptor = data.uses_data_descriptor();
    let flags = (data.flags & (FLAG_ENCRYPTED | FLAG_DEFLATE_OPTIONS | FLAG_DATA_DESCRIPTOR))
        | if texts.utf8 { FLAG_UTF8 } else { 0 };

    let sizes_overflow = data.compressed_size >= u64::from(MARKER_32)
        || data.uncompressed_size >= u64::from(MARKER_32);
    if sizes_overflow && settings.zip64 == Zip64Option::Never {
        return Err(ZipError::zip64_required(format!(
            "{name}: {} bytes exceed 32 bits",
            data.uncompressed_size.max(data.compressed_size)
        )));
    }
    let local_zip64 = if sizes_overflow || settings.zip64 == Zip64Option::Always {
        LocalZip64::Sizes {
            uncompressed: data.uncompressed_size,
            compressed: data.compressed_size,
        }
    } else {
        LocalZip64::Absent
    };

    let plan = LocalPlan {
        entry,
        texts,
        flags,
        method: data.method,
        encryption: data.encryption,
        aes_version: data.aes_version,
        modified: data.modified,
    };
    let regenerated = plan.render(
        data.crc32,
        data.compressed_size,
        data.uncompressed_size,
        local_zip64,
    );

    input.seek(SeekFrom::Start(data.header_offset))?;
    let source_header = LocalFileHeader::read(input, data.header_offset)?;
    let data_start = data.header_offset + source_header.encoded_len();
    let (header, local_has_zip64) =
        match reusable_local_header(&source_header, &regenerated, local_zip64, sizes_overflow) {
            Some(kept) => (kept, has_local_zip64(&source_header.extra)),
            None => (regenerated, matches!(local_zip64, LocalZip64::Sizes { .. })),
        };

    sink.begin_contiguous(header.len() as u64)?;
    let placement = sink.segment_for(header.len() as u64);
    let offset_zip64 = check_offset(placement, settings.zip64, name)?;
    sink.write_all(&header)?;
    sink.end_contiguous();

    input.seek(SeekFrom::Start(data_start))?;
    let mut raw = input.take(data.compressed_size);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    while copied < data.compressed_size {
        if notifier.cancelled() {
            return Ok(EntryResult::Cancelled);
        }
        let n = raw.read(&mut buf)?;
        if n == 0 {
            return Err(ZipError::truncated(
                data_start + copied,
                data.compressed_size - copied,
            ));
        }
        sink.write_all(&buf[..n])?;
        copied += n as u64;
        notifier.notify(ZipEvent::SaveEntryProgress {
            name,
            bytes: copied,
            total: Some(data.compressed_size),
        });
    }
    if notifier.cancelled() {
        return Ok(EntryResult::Cancelled);
    }

    if descriptor {
        let dd = DataDescriptor {
            crc32: data.crc32,
            compressed_size: data.compressed_size,
            uncompressed_size: data.uncompressed_size,
        };
        sink.write_all(&dd.to_bytes(local_has_zip64))?;
    }

    let zip64 = local_has_zip64 || offset_zip64;
    debug!(name, offset = placement.offset, disk = placement.disk, "copied stored entry");
    Ok(EntryResult::Written(Written {
        placement,
        crc32: data.crc32,
        compressed: data.compressed_size,
        uncompressed: data.uncompressed_size,
        flags,
        method: data.method,
        encryption: data.encryption,
        aes_version: data.aes_version,
        modified: data.modified,
        version_needed: plan.version_needed(zip64),
        zip64,
    }))
}

fn has_local_zip64(extra: &[u8]) -> bool {
    extra::find_block(&extra::parse_blocks(extra), ZIP64_EXTRA_ID).is_some()
}

/// Extra blocks other than the ZIP64 sizes and the space reserved for them.
fn blocks_without_sizes(extra: &[u8]) -> Vec<extra::ExtraBlock> {
    extra::parse_blocks(extra)
        .into_iter()
        .filter(|b| b.id != ZIP64_EXTRA_ID && b.id != DUMMY_EXTRA_ID)
        .collect()
}

/// The source's local header, if it describes the entry the same way the
/// regenerated one does.
///
/// A header written for content of unknown length carries reserved ZIP64
/// space, or zero sizes deferred to a data descriptor. Neither can be
/// rebuilt from the central directory, so such a header is kept as written.
/// A header without a ZIP64 block is kept under the `Always` policy as long
/// as its sizes fit.
fn reusable_local_header(
    source: &LocalFileHeader,
    regenerated: &[u8],
    zip64: LocalZip64,
    sizes_overflow: bool,
) -> Option<Vec<u8>> {
    let fresh = LocalFileHeader::read(&mut &regenerated[..], 0).ok()?;
    let source_zip64 = has_local_zip64(&source.extra);
    let wanted_zip64 = matches!(zip64, LocalZip64::Sizes { .. });
    if source_zip64 != wanted_zip64 && (source_zip64 || sizes_overflow) {
        return None;
    }
    let deferred = source.flags & FLAG_DATA_DESCRIPTOR != 0;
    let same = source.flags == fresh.flags
        && source.method == fresh.method
        && source.modified == fresh.modified
        && source.name == fresh.name
        && (deferred || source.crc32 == fresh.crc32)
        && blocks_without_sizes(&source.extra) == blocks_without_sizes(&fresh.extra);
    same.then(|| source.to_bytes())
}

/// Counts content bytes, reports progress and stops on cancellation.
struct Feed<'w, 'n, 's, W: Write> {
    inner: &'w mut W,
    notifier: &'n mut Notifier<'s>,
    name: &'w str,
    total: Option<u64>,
    bytes: u64,
}

impl<W: Write> Write for Feed<'_, '_, '_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.notifier.cancelled() {
            return Err(io::Error::other("save cancelled"));
        }
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        self.notifier.notify(ZipEvent::SaveEntryProgress {
            name: self.name,
            bytes: self.bytes,
            total: self.total,
        });
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compress and encrypt an entry's content.
fn encode_entry(
    sink: &mut dyn OutputSink,
    entry: &mut ZipEntry,
    input: Option<&mut Input>,
    settings: &SaveSettings<'_>,
    notifier: &mut Notifier<'_>,
) -> Result<EntryResult> {
    let known_len = match &entry.source {
        EntrySource::Archive(data) => Some(data.uncompressed_size),
        source => source.known_len()?,
    };
    let empty = entry.is_directory || known_len == Some(0);
    let (method, encryption) = if empty {
        (CompressionMethod::Stored, EncryptionAlgorithm::None)
    } else {
        (entry.method, entry.encryption)
    };
    if let CompressionMethod::Unknown(id) = method {
        return Err(ZipError::UnsupportedMethod { id });
    }
    if let EncryptionAlgorithm::Unsupported(id) = encryption {
        return Err(ZipError::UnsupportedEncryption { id });
    }
    let password = if encryption.is_encrypted() {
        Some(
            entry
                .password
                .clone()
                .ok_or_else(|| ZipError::password_required(&entry.name))?,
        )
    } else {
        None
    };
    if settings.zip64 == Zip64Option::Never && known_len.is_some_and(|l| l >= u64::from(MARKER_32))
    {
        return Err(ZipError::zip64_required(format!(
            "{}: {} bytes exceed 32 bits",
            entry.name,
            known_len.unwrap_or_default()
        )));
    }

    let can_seek = sink.can_seek();
    let precomputed_crc = if encryption == EncryptionAlgorithm::PkzipWeak && can_seek {
        match &entry.source {
            EntrySource::Archive(data) if data.aes_version != 2 || data.encryption.aes_strength().is_none() => {
                Some(data.crc32)
            }
            source if source.is_rewindable() => source.precompute_crc()?,
            _ => None,
        }
    } else {
        None
    };
    let descriptor = !can_seek || (encryption == EncryptionAlgorithm::PkzipWeak && precomputed_crc.is_none());
    let reserve = match settings.zip64 {
        Zip64Option::Always => true,
        Zip64Option::Never => false,
        Zip64Option::AsNecessary => {
            known_len.is_none_or(|l| l.saturating_add(ZIP64_HEADROOM) >= u64::from(MARKER_32))
        }
    };

    let modified = entry.modified;
    let texts = encode_texts(settings.encoding, &entry.name, &entry.comment);
    let flags = if encryption.is_encrypted() { FLAG_ENCRYPTED } else { 0 }
        | if descriptor { FLAG_DATA_DESCRIPTOR } else { 0 }
        | if texts.utf8 { FLAG_UTF8 } else { 0 };
    let aes_version = 1;

    // Placeholder header; sizes and CRC are patched or follow in a descriptor.
    let placeholder_zip64 = if reserve {
        LocalZip64::Sizes {
            uncompressed: 0,
            compressed: 0,
        }
    } else {
        LocalZip64::Absent
    };
    let (header, placement, offset_zip64) = {
        let plan = LocalPlan {
            entry,
            texts,
            flags,
            method,
            encryption,
            aes_version,
            modified,
        };
        let header = plan.render(0, 0, 0, placeholder_zip64);
        sink.begin_contiguous(header.len() as u64)?;
        let placement = sink.segment_for(header.len() as u64);
        let offset_zip64 = check_offset(placement, settings.zip64, &entry.name)?;
        sink.write_all(&header)?;
        sink.end_contiguous();
        (header, placement, offset_zip64)
    };
    let data_start = sink.position();

    let check = check_byte(
        precomputed_crc.unwrap_or_default(),
        modified.time,
        descriptor,
    );
    let level = entry.level;
    let parallel = settings.parallel.applies_to(known_len) && method == CompressionMethod::Deflated;
    let name = entry.name.clone();

    let (crc32, uncompressed) = {
        let sink_ref: &mut dyn OutputSink = &mut *sink;
        let encryptor = match (encryption, password.as_deref()) {
            (EncryptionAlgorithm::None, _) => Encryptor::Plain(sink_ref),
            (EncryptionAlgorithm::PkzipWeak, Some(pw)) => {
                Encryptor::ZipCrypto(ZipCryptoWriter::new(sink_ref, pw.as_bytes(), check)?)
            }
            (aes, Some(pw)) => {
                let strength = aes
                    .aes_strength()
                    .ok_or(ZipError::UnsupportedEncryption { id: 0 })?;
                Encryptor::Aes(AesWriter::new(sink_ref, strength, pw.as_bytes())?)
            }
            (_, None) => return Err(ZipError::password_required(&name)),
        };
        let compressor = match method {
            CompressionMethod::Stored => Compressor::Stored(encryptor),
            _ if parallel => Compressor::Parallel(ParallelDeflater::new(
                encryptor,
                settings.parallel,
                level,
            )?),
            _ => Compressor::deflate(encryptor, level),
        };
        let mut chain = CrcWriter::new(compressor);

        let fed = feed_content(
            &mut chain,
            entry,
            input,
            settings.password,
            &name,
            known_len,
            notifier,
        );
        match fed {
            Ok(true) => {}
            Ok(false) => return Ok(EntryResult::Cancelled),
            Err(_) if notifier.cancelled() => return Ok(EntryResult::Cancelled),
            Err(err) => return Err(err),
        }
        let crc32 = chain.crc();
        let uncompressed = chain.bytes();
        let encryptor = chain.into_inner().finish()?;
        encryptor.finish()?;
        (crc32, uncompressed)
    };
    if let Some(expected) = precomputed_crc {
        if expected != crc32 {
            return Err(ZipError::Io(io::Error::other(format!(
                "{name}: content changed while it was being saved"
            ))));
        }
    }
    let compressed = sink.position() - data_start;

    let sizes_overflow =
        compressed >= u64::from(MARKER_32) || uncompressed >= u64::from(MARKER_32);
    if sizes_overflow && !reserve {
        return Err(ZipError::zip64_required(format!(
            "{name}: {} bytes exceed 32 bits",
            uncompressed.max(compressed)
        )));
    }

    let final_zip64 = if sizes_overflow || (reserve && settings.zip64 == Zip64Option::Always) {
        LocalZip64::Sizes {
            uncompressed,
            compressed,
        }
    } else if reserve {
        LocalZip64::Padding
    } else {
        LocalZip64::Absent
    };

    let texts = encode_texts(settings.encoding, &entry.name, &entry.comment);
    let plan = LocalPlan {
        entry,
        texts,
        flags,
        method,
        encryption,
        aes_version,
        modified,
    };
    if descriptor {
        let dd = DataDescriptor {
            crc32,
            compressed_size: compressed,
            uncompressed_size: uncompressed,
        };
        sink.write_all(&dd.to_bytes(reserve))?;
    } else {
        let patched = plan.render(crc32, compressed, uncompressed, final_zip64);
        debug_assert_eq!(patched.len(), header.len());
        sink.patch(placement, &patched)?;
    }

    let zip64 = sizes_overflow
        || offset_zip64
        || settings.zip64 == Zip64Option::Always
        || (descriptor && reserve);
    debug!(
        name = %name,
        offset = placement.offset,
        disk = placement.disk,
        compressed,
        uncompressed,
        zip64,
        "wrote entry"
    );
    Ok(EntryResult::Written(Written {
        placement,
        crc32,
        compressed,
        uncompressed,
        flags,
        method,
        encryption,
        aes_version,
        modified,
        version_needed: plan.version_needed(zip64),
        zip64,
    }))
}

/// Push the entry's content into `chain`. `Ok(false)` when cancelled.
fn feed_content<W: Write>(
    chain: &mut W,
    entry: &mut ZipEntry,
    input: Option<&mut Input>,
    archive_password: Option<&str>,
    name: &str,
    total: Option<u64>,
    notifier: &mut Notifier<'_>,
) -> Result<bool> {
    let mut feed = Feed {
        inner: chain,
        notifier,
        name,
        total,
        bytes: 0,
    };

    if let EntrySource::Archive(_) = &entry.source {
        let input = input.ok_or_else(|| {
            ZipError::unsaveable(format!("{name}: the source archive is not open"))
        })?;
        let password = entry.source_password.as_deref().or(archive_password);
        let mut decoding = Decoding::open(input, entry, password)?;
        return pump(&mut decoding, &mut feed);
    }

    match entry.source.open(&entry.name)? {
        OpenedSource::Reader { mut reader, .. } => pump(&mut reader, &mut feed),
        OpenedSource::Guarded(mut guard) => {
            let done = pump(&mut guard, &mut feed)?;
            guard.close()?;
            Ok(done)
        }
        OpenedSource::Callback(callback) => {
            callback(name, &mut feed)?;
            Ok(!feed.notifier.cancelled())
        }
    }
}

fn pump<R: Read + ?Sized, W: Write>(reader: &mut R, feed: &mut Feed<'_, '_, '_, W>) -> Result<bool> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if feed.notifier.cancelled() {
            return Ok(false);
        }
        let n = reader.read(&mut buf).map_err(ZipError::from_io)?;
        if n == 0 {
            return Ok(true);
        }
        feed.write_all(&buf[..n])?;
    }
}

/// Render one central directory record.
fn central_record(entry: &ZipEntry, encoding: &TextEncoding) -> CentralDirectoryHeader {
    let texts = encode_texts(encoding, &entry.name, &entry.comment);
    let sizes_zip64 = entry.output_zip64;
    let offset_zip64 = entry.local_header_offset >= u64::from(MARKER_32);
    let disk_zip64 = entry.disk_number >= u32::from(MARKER_16);

    let fields = Zip64Fields {
        uncompressed: sizes_zip64.then_some(entry.uncompressed_size),
        compressed: sizes_zip64.then_some(entry.compressed_size),
        offset: offset_zip64.then_some(entry.local_header_offset),
        disk: disk_zip64.then_some(entry.disk_number),
    };
    let mut extra = Vec::new();
    if !fields.is_empty() {
        extra::put_block(&mut extra, ZIP64_EXTRA_ID, &fields.to_data());
    }
    let aes = entry.encryption.aes_strength().map(|strength| AesExtra {
        vendor_version: entry.aes_version,
        strength,
        method: entry.method.to_u16(),
    });
    append_common_extra(&mut extra, entry, aes, true);

    let flags = (entry.flags & !FLAG_UTF8) | if texts.utf8 { FLAG_UTF8 } else { 0 };
    CentralDirectoryHeader {
        version_made_by: entry.version_made_by,
        version_needed: entry.version_needed,
        flags,
        method: if aes.is_some() {
            METHOD_AES
        } else {
            entry.method.to_u16()
        },
        modified: entry.modified,
        crc32: entry.crc32,
        compressed_size: if sizes_zip64 {
            MARKER_32
        } else {
            entry.compressed_size as u32
        },
        uncompressed_size: if sizes_zip64 {
            MARKER_32
        } else {
            entry.uncompressed_size as u32
        },
        disk_start: if disk_zip64 {
            MARKER_16
        } else {
            entry.disk_number as u16
        },
        internal_attributes: entry.internal_attributes,
        external_attributes: entry.external_attributes,
        local_header_offset: if offset_zip64 {
            MARKER_32
        } else {
            entry.local_header_offset as u32
        },
        name: texts.name,
        extra,
        comment: texts.comment,
    }
}

/// Write the central directory and end records. Returns whether ZIP64
/// records were written.
fn write_central_directory(
    sink: &mut dyn OutputSink,
    entries: &[ZipEntry],
    order: &[usize],
    settings: &SaveSettings<'_>,
) -> Result<bool> {
    let mut directory = Vec::new();
    let mut count = 0u64;
    let mut any_entry_zip64 = false;
    for &slot in order {
        let entry = &entries[slot];
        if !entry.included_in_save {
            continue;
        }
        central_record(entry, settings.encoding).write_into(&mut directory);
        any_entry_zip64 |= entry.output_zip64;
        count += 1;
    }
    let cd_size = directory.len() as u64;

    let comment = settings.encoding.encode(settings.comment).bytes;
    let comment = &comment[..comment.len().min(usize::from(u16::MAX))];

    let mut zip64 = settings.zip64 == Zip64Option::Always
        || count >= u64::from(MARKER_16)
        || cd_size >= u64::from(MARKER_32)
        || any_entry_zip64;
    let trailer_len = |zip64: bool| {
        (if zip64 {
            (ZIP64_EOCD_LEN + ZIP64_LOCATOR_LEN) as u64
        } else {
            0
        }) + EOCD_LEN as u64
            + comment.len() as u64
    };

    // With ZIP64 records reserved the tail is at its largest; keep it on one volume.
    let tail_len = cd_size + trailer_len(true);
    sink.begin_contiguous(tail_len)?;
    let cd_at = sink.segment_for(tail_len);
    if cd_at.offset >= u64::from(MARKER_32) {
        zip64 = true;
    }
    if zip64 && settings.zip64 == Zip64Option::Never {
        return Err(ZipError::zip64_required(format!(
            "{count} entries, directory of {cd_size} bytes at offset {}",
            cd_at.offset
        )));
    }

    sink.write_all(&directory)?;
    if cd_at.disk != sink.current_disk() {
        // The directory was too large for one volume and was split.
        sink.end_contiguous();
        sink.begin_contiguous(trailer_len(zip64))?;
    }
    let trailer_at = sink.segment_for(trailer_len(zip64));

    let mut trailer = Vec::with_capacity(trailer_len(zip64) as usize);
    if zip64 {
        Zip64EndOfCentralDirectory {
            version_made_by: header::version_made_by(),
            version_needed: VERSION_ZIP64,
            disk_number: trailer_at.disk,
            cd_disk: cd_at.disk,
            entries_on_disk: count,
            total_entries: count,
            cd_size,
            cd_offset: cd_at.offset,
        }
        .write_into(&mut trailer);
        Zip64Locator {
            record_disk: trailer_at.disk,
            record_offset: trailer_at.offset,
            total_disks: trailer_at.disk + 1,
        }
        .write_into(&mut trailer);
    }
    let clamp16 = |v: u64| if v >= u64::from(MARKER_16) { MARKER_16 } else { v as u16 };
    let clamp32 = |v: u64| if v >= u64::from(MARKER_32) { MARKER_32 } else { v as u32 };
    EndOfCentralDirectory {
        disk_number: clamp16(u64::from(trailer_at.disk)),
        cd_disk: clamp16(u64::from(cd_at.disk)),
        entries_on_disk: clamp16(count),
        total_entries: clamp16(count),
        cd_size: clamp32(cd_size),
        cd_offset: clamp32(cd_at.offset),
        comment: comment.to_vec(),
    }
    .write_into(&mut trailer);
    sink.write_all(&trailer)?;
    sink.end_contiguous();

    info!(
        entries = count,
        cd_size,
        cd_offset = cd_at.offset,
        disks = trailer_at.disk + 1,
        zip64,
        "central directory written"
    );
    Ok(zip64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::AlternateEncodingUsage;
    use crate::events::CancelToken;
    use crate::sink::{SeekableSink, StreamingSink};
    use oxizip_core::bytes::{le_u16, le_u32};
    use oxizip_core::Crc32;
    use std::io::Cursor;

    fn settings<'a>(encoding: &'a TextEncoding, parallel: &'a ParallelDeflate) -> SaveSettings<'a> {
        SaveSettings {
            zip64: Zip64Option::AsNecessary,
            encoding,
            parallel,
            password: None,
            comment: "",
        }
    }

    fn buffer_entry(name: &str, data: &[u8]) -> ZipEntry {
        ZipEntry::new(name.to_string(), false, EntrySource::Buffer(data.to_vec()))
    }

    #[test]
    fn test_encode_texts_shares_utf8_flag() {
        let encoding = TextEncoding::default();
        let texts = encode_texts(&encoding, "plain.txt", "caf\u{e9} \u{4e2d}");
        assert!(texts.utf8);
        assert_eq!(texts.name, b"plain.txt");
        assert_eq!(texts.comment, "caf\u{e9} \u{4e2d}".as_bytes());

        let ascii = TextEncoding::new(encoding_rs::UTF_8, AlternateEncodingUsage::Never);
        let texts = encode_texts(&ascii, "a", "b");
        assert!(!texts.utf8);
    }

    fn local_header(name: &[u8], extra: Vec<u8>) -> LocalFileHeader {
        LocalFileHeader {
            version_needed: VERSION_DEFAULT,
            flags: 0,
            method: 8,
            modified: DosDateTime::new(0x5a21, 0x6000),
            crc32: 0xdead_beef,
            compressed_size: 10,
            uncompressed_size: 20,
            name: name.to_vec(),
            extra,
        }
    }

    #[test]
    fn test_reserved_local_space_is_kept_on_copy() {
        let mut padded = Vec::new();
        extra::put_block(&mut padded, DUMMY_EXTRA_ID, &[0u8; LOCAL_ZIP64_DATA_LEN]);
        let source = local_header(b"s.txt", padded);
        let regenerated = local_header(b"s.txt", Vec::new()).to_bytes();

        let kept = reusable_local_header(&source, &regenerated, LocalZip64::Absent, false);
        assert_eq!(kept, Some(source.to_bytes()));

        let renamed = local_header(b"t.txt", Vec::new()).to_bytes();
        assert_eq!(
            reusable_local_header(&source, &renamed, LocalZip64::Absent, false),
            None
        );

        let sizes = LocalZip64::Sizes {
            uncompressed: 20,
            compressed: 10,
        };
        assert!(reusable_local_header(&source, &regenerated, sizes, false).is_some());
        assert_eq!(
            reusable_local_header(&source, &regenerated, sizes, true),
            None
        );
    }

    #[test]
    fn test_seekable_save_patches_header() {
        let encoding = TextEncoding::default();
        let parallel = ParallelDeflate::default();
        let mut entries = vec![buffer_entry("a.txt", &b"hello hello hello".repeat(20))];
        let mut sink = SeekableSink::new(Cursor::new(Vec::new())).expect("sink");
        let mut notifier = Notifier::new(None, CancelToken::new());
        let report = write_archive(
            &mut sink,
            &mut entries,
            &[0],
            None,
            &settings(&encoding, &parallel),
            &mut notifier,
        )
        .expect("save");
        assert_eq!(report.outcome, SaveOutcome::Saved);
        assert!(!report.zip64);

        let bytes = sink.into_inner().into_inner();
        assert_eq!(&bytes[..4], b"PK\x03\x04");
        let expected_crc = Crc32::compute(&b"hello hello hello".repeat(20));
        assert_eq!(le_u32(&bytes, 14), expected_crc);
        assert_eq!(entries[0].crc32(), expected_crc);
        assert_eq!(entries[0].uncompressed_size(), 340);
        assert!(!entries[0].uses_data_descriptor());
        // Small known length: no ZIP64 space reserved, no time blocks requested.
        assert_eq!(le_u16(&bytes, 28), 0);
    }

    #[test]
    fn test_streaming_save_uses_descriptor() {
        let encoding = TextEncoding::default();
        let parallel = ParallelDeflate::default();
        let mut entries = vec![buffer_entry("b.txt", b"streamed")];
        let mut sink = StreamingSink::new(Vec::new());
        let mut notifier = Notifier::new(None, CancelToken::new());
        write_archive(
            &mut sink,
            &mut entries,
            &[0],
            None,
            &settings(&encoding, &parallel),
            &mut notifier,
        )
        .expect("save");
        assert!(entries[0].uses_data_descriptor());
        let bytes = sink.into_inner();
        let dd_sig = crate::header::DATA_DESCRIPTOR_SIG.to_le_bytes();
        assert!(bytes.windows(4).any(|w| w == dd_sig));
    }

    #[test]
    fn test_empty_entry_is_stored_unencrypted() {
        let encoding = TextEncoding::default();
        let parallel = ParallelDeflate::default();
        let mut entry = buffer_entry("empty", b"");
        entry.encryption = EncryptionAlgorithm::WinZipAes256;
        let mut entries = vec![entry];
        let mut sink = SeekableSink::new(Cursor::new(Vec::new())).expect("sink");
        let mut notifier = Notifier::new(None, CancelToken::new());
        write_archive(
            &mut sink,
            &mut entries,
            &[0],
            None,
            &settings(&encoding, &parallel),
            &mut notifier,
        )
        .expect("save without a password");
        assert_eq!(entries[0].encryption(), EncryptionAlgorithm::None);
        assert_eq!(entries[0].compression_method(), CompressionMethod::Stored);
        assert_eq!(entries[0].compressed_size(), 0);
    }

    #[test]
    fn test_missing_password_is_fatal() {
        let encoding = TextEncoding::default();
        let parallel = ParallelDeflate::default();
        let mut entry = buffer_entry("secret", b"data");
        entry.encryption = EncryptionAlgorithm::PkzipWeak;
        let mut entries = vec![entry];
        let mut sink = SeekableSink::new(Cursor::new(Vec::new())).expect("sink");
        let mut notifier = Notifier::new(None, CancelToken::new());
        let err = write_archive(
            &mut sink,
            &mut entries,
            &[0],
            None,
            &settings(&encoding, &parallel),
            &mut notifier,
        );
        assert!(matches!(err, Err(ZipError::PasswordRequired { .. })));
    }

    #[test]
    fn test_never_policy_rejects_entry_count_up_front() {
        let encoding = TextEncoding::default();
        let parallel = ParallelDeflate::default();
        let mut entries: Vec<ZipEntry> = Vec::new();
        let order: Vec<usize> = (0..0xFFFF).collect();
        let mut sink = StreamingSink::new(Vec::new());
        let mut notifier = Notifier::new(None, CancelToken::new());
        let mut never = settings(&encoding, &parallel);
        never.zip64 = Zip64Option::Never;
        let err = write_archive(&mut sink, &mut entries, &order, None, &never, &mut notifier);
        assert!(matches!(err, Err(ZipError::Zip64Required { .. })));
        assert_eq!(sink.position(), 0);
    }

    #[test]
    fn test_skip_reply_drops_failing_entry() {
        let encoding = TextEncoding::default();
        let parallel = ParallelDeflate::default();
        let mut entries = vec![
            ZipEntry::new(
                "missing".into(),
                false,
                EntrySource::File("/nonexistent/oxizip/file".into()),
            ),
            buffer_entry("ok.txt", b"fine"),
        ];
        let mut sink = SeekableSink::new(Cursor::new(Vec::new())).expect("sink");
        let mut handler = |event: &ZipEvent<'_>| match event {
            ZipEvent::SaveError { .. } => Reply::Skip,
            _ => Reply::Continue,
        };
        let mut notifier = Notifier::new(Some(&mut handler), CancelToken::new());
        write_archive(
            &mut sink,
            &mut entries,
            &[0, 1],
            None,
            &settings(&encoding, &parallel),
            &mut notifier,
        )
        .expect("save");
        assert!(!entries[0].included_in_save());
        assert!(entries[1].included_in_save());
        assert_eq!(entries[1].local_header_offset(), 0);
    }

    #[test]
    fn test_source_error_without_sink_is_fatal() {
        let encoding = TextEncoding::default();
        let parallel = ParallelDeflate::default();
        let mut entries = vec![ZipEntry::new(
            "missing".into(),
            false,
            EntrySource::File("/nonexistent/oxizip/file".into()),
        )];
        let mut sink = SeekableSink::new(Cursor::new(Vec::new())).expect("sink");
        let mut notifier = Notifier::new(None, CancelToken::new());
        let err = write_archive(
            &mut sink,
            &mut entries,
            &[0],
            None,
            &settings(&encoding, &parallel),
            &mut notifier,
        );
        assert!(matches!(err, Err(ZipError::Io(_))));
    }
}
