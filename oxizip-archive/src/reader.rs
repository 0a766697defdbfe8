//! Central directory reader.
//!
//! Finds the end of central directory record by scanning backward, follows
//! the ZIP64 locator when one precedes it, and parses every directory record
//! into a [`ZipEntry`]. Archives whose end record cannot be found are
//! recovered by walking local headers from the start of the stream.

use crate::entry::ZipEntry;
use crate::events::{Notifier, ZipEvent};
use crate::extra::{self, ZIP64_EXTRA_ID};
use crate::header::{
    CENTRAL_DIR_HEADER_SIG, CentralDirectoryHeader, DATA_DESCRIPTOR_SIG, DataDescriptor,
    END_OF_CENTRAL_DIR_SIG, EOCD_LEN, EndOfCentralDirectory, FLAG_DATA_DESCRIPTOR,
    LOCAL_FILE_HEADER_SIG, LocalFileHeader, MARKER_32, ZIP64_LOCATOR_LEN, Zip64EndOfCentralDirectory,
    Zip64Locator,
};
use crate::input::Input;
use crate::options::ReadOptions;
use crate::source::EntrySource;
use oxizip_core::bytes::{find_next_signature, find_signature_backward, le_u32, read_exact_at};
use oxizip_core::error::{Result, ZipError};
use std::collections::HashSet;
use std::io::{BufReader, Read, Seek, SeekFrom};
use tracing::{debug, warn};

/// Initial backward search window for the end record.
const EOCD_SEARCH_WINDOW: u64 = 16 * 1024;

/// Largest possible end record: fixed part plus a maximal comment.
const EOCD_MAX_WINDOW: u64 = EOCD_LEN as u64 + 0xFFFF;

/// What the reader found.
#[derive(Debug)]
pub(crate) struct Directory {
    pub(crate) entries: Vec<ZipEntry>,
    pub(crate) comment: String,
    /// ZIP64 records were present anywhere.
    pub(crate) zip64: bool,
    /// Entries came from the local-header scan.
    pub(crate) recovered: bool,
}

/// Read the directory of `input`.
pub(crate) fn read_directory(
    input: &mut Input,
    options: &ReadOptions,
    notifier: &mut Notifier<'_>,
) -> Result<Directory> {
    let len = input.seek(SeekFrom::End(0))?;
    if len < 4 {
        return Err(ZipError::truncated(0, EOCD_LEN as u64));
    }

    let mut sig = [0u8; 4];
    read_exact_at(input, 0, &mut sig)?;
    if le_u32(&sig, 0) == END_OF_CENTRAL_DIR_SIG {
        debug!("archive starts with an end record; empty archive");
        let window = len.min(EOCD_MAX_WINDOW) as usize;
        let mut buf = vec![0u8; window];
        read_exact_at(input, 0, &mut buf)?;
        let eocd = EndOfCentralDirectory::parse(&buf, 0)?;
        return Ok(Directory {
            entries: Vec::new(),
            comment: options.encoding.decode_archive_comment(&eocd.comment),
            zip64: false,
            recovered: false,
        });
    }

    let Some(eocd_pos) =
        find_signature_backward(input, END_OF_CENTRAL_DIR_SIG, EOCD_SEARCH_WINDOW, EOCD_MAX_WINDOW)?
    else {
        warn!("end of central directory not found, scanning local headers");
        let entries = scan_local_headers(input, options, notifier)?;
        if entries.is_empty() {
            return Err(ZipError::format(
                len,
                "end of central directory record not found",
            ));
        }
        return Ok(Directory {
            entries,
            comment: String::new(),
            zip64: false,
            recovered: true,
        });
    };

    read_central(input, len, eocd_pos, options, notifier)
}

struct CentralLocation {
    cd_disk: u32,
    cd_offset: u64,
    cd_size: u64,
    total: u64,
}

fn read_central(
    input: &mut Input,
    len: u64,
    eocd_pos: u64,
    options: &ReadOptions,
    notifier: &mut Notifier<'_>,
) -> Result<Directory> {
    let tail = (len - eocd_pos).min(EOCD_MAX_WINDOW) as usize;
    let mut buf = vec![0u8; tail];
    read_exact_at(input, eocd_pos, &mut buf)?;
    let eocd = EndOfCentralDirectory::parse(&buf, eocd_pos)?;

    let mut location = CentralLocation {
        cd_disk: u32::from(eocd.cd_disk),
        cd_offset: u64::from(eocd.cd_offset),
        cd_size: u64::from(eocd.cd_size),
        total: u64::from(eocd.total_entries),
    };

    let mut zip64 = false;
    if eocd_pos >= ZIP64_LOCATOR_LEN as u64 {
        let mut raw = [0u8; ZIP64_LOCATOR_LEN];
        read_exact_at(input, eocd_pos - ZIP64_LOCATOR_LEN as u64, &mut raw)?;
        if let Some(locator) = Zip64Locator::parse(&raw) {
            let record_pos = input.resolve(locator.record_disk, locator.record_offset)?;
            input.seek(SeekFrom::Start(record_pos))?;
            let record = Zip64EndOfCentralDirectory::read(input, record_pos)?;
            debug!(
                entries = record.total_entries,
                cd_offset = record.cd_offset,
                cd_size = record.cd_size,
                "using ZIP64 end of central directory"
            );
            location = CentralLocation {
                cd_disk: record.cd_disk,
                cd_offset: record.cd_offset,
                cd_size: record.cd_size,
                total: record.total_entries,
            };
            zip64 = true;
        }
    }
    if !zip64 && eocd.has_sentinels() {
        return Err(ZipError::format(
            eocd_pos,
            "end record holds ZIP64 sentinels but no ZIP64 locator precedes it",
        ));
    }

    let cd_start = input.resolve(location.cd_disk, location.cd_offset)?;
    debug!(
        cd_start,
        cd_size = location.cd_size,
        entries = location.total,
        "reading central directory"
    );

    let mut parsed = Vec::new();
    {
        input.seek(SeekFrom::Start(cd_start))?;
        let mut reader = BufReader::with_capacity(64 * 1024, &mut *input);
        let mut at = cd_start;
        for index in 0..location.total {
            let header = match CentralDirectoryHeader::read(&mut reader, at) {
                Ok(header) => header,
                Err(ZipError::BadSignature { found, .. }) if index > 0 => {
                    warn!(
                        offset = at,
                        found = format_args!("{found:#010x}"),
                        read = index,
                        declared = location.total,
                        "central directory ended early"
                    );
                    break;
                }
                Err(err) => return Err(err),
            };
            let record_len = header.encoded_len();
            let (entry, saw_zip64) = ZipEntry::from_central(header, &options.encoding, at)?;
            zip64 |= saw_zip64;
            parsed.push(entry);
            at += record_len;
        }
    }

    let mut seen = HashSet::with_capacity(parsed.len());
    let mut entries = Vec::with_capacity(parsed.len());
    for mut entry in parsed {
        let key = name_key(&entry.name, options.case_sensitive);
        if !seen.insert(key) {
            warn!(name = %entry.name, "duplicate name in central directory, keeping the first");
            continue;
        }
        if let EntrySource::Archive(data) = &mut entry.source {
            data.header_offset = input.resolve(data.disk, data.header_offset)?;
        }
        notifier.notify(ZipEvent::ReadEntry { name: &entry.name });
        entries.push(entry);
    }

    Ok(Directory {
        entries,
        comment: options.encoding.decode_archive_comment(&eocd.comment),
        zip64,
        recovered: false,
    })
}

/// Key used for duplicate detection.
pub(crate) fn name_key(name: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        name.to_string()
    } else {
        name.to_lowercase()
    }
}

/// Logical offset of an entry's data, past its local header.
pub(crate) fn data_offset(input: &mut Input, header_offset: u64) -> Result<u64> {
    input.seek(SeekFrom::Start(header_offset))?;
    let header = LocalFileHeader::read(input, header_offset)?;
    Ok(header_offset + header.encoded_len())
}

/// Walk local headers from offset 0 and rebuild entries from them.
fn scan_local_headers(
    input: &mut Input,
    options: &ReadOptions,
    notifier: &mut Notifier<'_>,
) -> Result<Vec<ZipEntry>> {
    let end = input.seek(SeekFrom::End(0))?;
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut pos = 0u64;

    while pos + 4 <= end {
        let mut sig = [0u8; 4];
        read_exact_at(input, pos, &mut sig)?;
        if le_u32(&sig, 0) != LOCAL_FILE_HEADER_SIG {
            break;
        }
        input.seek(SeekFrom::Start(pos))?;
        let header = match LocalFileHeader::read(input, pos) {
            Ok(header) => header,
            Err(err) if !entries.is_empty() => {
                warn!(offset = pos, %err, "local header scan stopped");
                break;
            }
            Err(err) => return Err(err),
        };
        let data_start = pos + header.encoded_len();

        let blocks = extra::parse_blocks(&header.extra);
        let zip64 = extra::find_block(&blocks, ZIP64_EXTRA_ID).is_some();
        let mut compressed = u64::from(header.compressed_size);
        let mut uncompressed = u64::from(header.uncompressed_size);
        if let Some(block) = extra::find_block(&blocks, ZIP64_EXTRA_ID) {
            let fields = extra::Zip64Fields::parse(
                &block.data,
                header.uncompressed_size == MARKER_32,
                header.compressed_size == MARKER_32,
                false,
                false,
                data_start,
            )?;
            uncompressed = fields.uncompressed.unwrap_or(uncompressed);
            compressed = fields.compressed.unwrap_or(compressed);
        }
        let mut crc32 = header.crc32;
        let uses_descriptor = header.flags & FLAG_DATA_DESCRIPTOR != 0;

        let next = if uses_descriptor && compressed == 0 {
            input.seek(SeekFrom::Start(data_start))?;
            let found = find_next_signature(
                input,
                &[
                    DATA_DESCRIPTOR_SIG,
                    LOCAL_FILE_HEADER_SIG,
                    CENTRAL_DIR_HEADER_SIG,
                    END_OF_CENTRAL_DIR_SIG,
                ],
            )?;
            match found {
                Some((at, DATA_DESCRIPTOR_SIG)) => {
                    let dd = DataDescriptor::read(input, zip64, at)?;
                    crc32 = dd.crc32;
                    compressed = at - data_start;
                    uncompressed = dd.uncompressed_size;
                    input.stream_position()?
                }
                Some((at, _)) => {
                    compressed = at - data_start;
                    at
                }
                None => break,
            }
        } else {
            let after = data_start + compressed;
            if uses_descriptor {
                let mut peek = [0u8; 4];
                read_exact_at(input, after, &mut peek)?;
                let body = if zip64 { 20 } else { 12 };
                let signed = u64::from(le_u32(&peek, 0) == DATA_DESCRIPTOR_SIG) * 4;
                after + body + signed
            } else {
                after
            }
        };

        let central = CentralDirectoryHeader {
            version_made_by: header.version_needed,
            version_needed: header.version_needed,
            flags: header.flags,
            method: header.method,
            modified: header.modified,
            crc32,
            compressed_size: 0,
            uncompressed_size: 0,
            disk_start: 0,
            internal_attributes: 0,
            external_attributes: 0,
            local_header_offset: 0,
            name: header.name,
            extra: header.extra,
            comment: Vec::new(),
        };
        let (mut entry, _) = ZipEntry::from_central(central, &options.encoding, pos)?;
        entry.compressed_size = compressed;
        entry.uncompressed_size = uncompressed;
        entry.local_header_offset = pos;
        if let EntrySource::Archive(data) = &mut entry.source {
            data.header_offset = pos;
            data.compressed_size = compressed;
            data.uncompressed_size = uncompressed;
        }

        if seen.insert(name_key(&entry.name, options.case_sensitive)) {
            debug!(name = %entry.name, offset = pos, "recovered entry");
            notifier.notify(ZipEvent::ReadEntry { name: &entry.name });
            entries.push(entry);
        }
        pos = next;
    }
    Ok(entries)
}
