//! ZIP record layouts.
//!
//! Fixed-size parts are decoded from a buffer read in one go; variable parts
//! (name, extra, comment) follow. Writers render records into a `Vec<u8>` so
//! the save pipeline can measure them before deciding where they land.

use crate::time::DosDateTime;
use oxizip_core::bytes::{le_u16, le_u32, le_u64, put_u16, put_u32, put_u64, read_vec};
use oxizip_core::error::{Result, ZipError};
use std::io::Read;

/// Local file header signature.
pub const LOCAL_FILE_HEADER_SIG: u32 = 0x04034B50;

/// Central directory header signature.
pub const CENTRAL_DIR_HEADER_SIG: u32 = 0x02014B50;

/// End of central directory signature.
pub const END_OF_CENTRAL_DIR_SIG: u32 = 0x06054B50;

/// ZIP64 end of central directory signature.
pub const ZIP64_END_OF_CENTRAL_DIR_SIG: u32 = 0x06064B50;

/// ZIP64 end of central directory locator signature.
pub const ZIP64_LOCATOR_SIG: u32 = 0x07064B50;

/// Data descriptor signature.
pub const DATA_DESCRIPTOR_SIG: u32 = 0x08074B50;

/// Fixed part of a local header.
pub const LOCAL_HEADER_LEN: usize = 30;
/// Fixed part of a central directory header.
pub const CENTRAL_HEADER_LEN: usize = 46;
/// Fixed part of the end of central directory record.
pub const EOCD_LEN: usize = 22;
/// ZIP64 end of central directory record without extensible data.
pub const ZIP64_EOCD_LEN: usize = 56;
/// ZIP64 locator.
pub const ZIP64_LOCATOR_LEN: usize = 20;

/// Sentinel for 32-bit fields moved into ZIP64 records.
pub const MARKER_32: u32 = 0xFFFF_FFFF;
/// Sentinel for 16-bit fields moved into ZIP64 records.
pub const MARKER_16: u16 = 0xFFFF;

/// Bit 0: entry is encrypted.
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// Bit 3: CRC and sizes follow the data in a descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
/// Bit 6: PKWARE strong encryption.
pub const FLAG_STRONG_ENCRYPTION: u16 = 0x0040;
/// Bit 11: name and comment are UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;

/// Version needed for plain entries.
pub const VERSION_DEFAULT: u16 = 20;
/// Version needed for ZIP64.
pub const VERSION_ZIP64: u16 = 45;
/// Version needed for WinZip AES.
pub const VERSION_AES: u16 = 51;

/// Header method value announcing WinZip AES.
pub const METHOD_AES: u16 = 99;

/// Host system ids stored in the high byte of "version made by".
pub const OS_MSDOS: u8 = 0;
/// Unix.
pub const OS_UNIX: u8 = 3;
/// Windows NTFS.
pub const OS_NTFS: u8 = 10;
/// VFAT.
pub const OS_VFAT: u8 = 14;

// Local header field offsets, for patching after the data is written.
pub(crate) const LOCAL_VERSION_AT: usize = 4;
pub(crate) const LOCAL_FLAGS_AT: usize = 6;
pub(crate) const LOCAL_CRC_AT: usize = 14;
pub(crate) const LOCAL_COMPRESSED_AT: usize = 18;
pub(crate) const LOCAL_UNCOMPRESSED_AT: usize = 22;

/// Host id of the running system.
pub fn host_os() -> u8 {
    if cfg!(windows) { OS_MSDOS } else { OS_UNIX }
}

/// "Version made by" for entries written on this host.
pub fn version_made_by() -> u16 {
    (u16::from(host_os()) << 8) | VERSION_ZIP64
}

fn check_signature(buf: &[u8], expected: u32, offset: u64) -> Result<()> {
    let found = le_u32(buf, 0);
    if found != expected {
        return Err(ZipError::bad_signature(offset, expected, found));
    }
    Ok(())
}

/// A local file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    /// Version needed to extract.
    pub version_needed: u16,
    /// General purpose flags.
    pub flags: u16,
    /// Header method (99 for AES).
    pub method: u16,
    /// Modification time.
    pub modified: DosDateTime,
    /// CRC-32, or 0 when deferred to a descriptor.
    pub crc32: u32,
    /// Compressed size or sentinel.
    pub compressed_size: u32,
    /// Uncompressed size or sentinel.
    pub uncompressed_size: u32,
    /// Raw name bytes.
    pub name: Vec<u8>,
    /// Raw extra field.
    pub extra: Vec<u8>,
}

impl LocalFileHeader {
    /// Read a header whose signature starts at `offset`.
    pub fn read<R: Read + ?Sized>(reader: &mut R, offset: u64) -> Result<Self> {
        let mut buf = [0u8; LOCAL_HEADER_LEN];
        reader
            .read_exact(&mut buf)
            .map_err(|e| ZipError::from_read(e, offset, LOCAL_HEADER_LEN as u64))?;
        check_signature(&buf, LOCAL_FILE_HEADER_SIG, offset)?;

        let name_len = le_u16(&buf, 26) as usize;
        let extra_len = le_u16(&buf, 28) as usize;
        let var_at = offset + LOCAL_HEADER_LEN as u64;
        let name = read_vec(reader, name_len, var_at)?;
        let extra = read_vec(reader, extra_len, var_at + name_len as u64)?;

        Ok(Self {
            version_needed: le_u16(&buf, 4),
            flags: le_u16(&buf, 6),
            method: le_u16(&buf, 8),
            modified: DosDateTime::new(le_u16(&buf, 12), le_u16(&buf, 10)),
            crc32: le_u32(&buf, 14),
            compressed_size: le_u32(&buf, 18),
            uncompressed_size: le_u32(&buf, 22),
            name,
            extra,
        })
    }

    /// Total encoded length.
    pub fn encoded_len(&self) -> u64 {
        (LOCAL_HEADER_LEN + self.name.len() + self.extra.len()) as u64
    }

    /// Render the header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOCAL_HEADER_LEN + self.name.len() + self.extra.len());
        put_u32(&mut out, LOCAL_FILE_HEADER_SIG);
        put_u16(&mut out, self.version_needed);
        put_u16(&mut out, self.flags);
        put_u16(&mut out, self.method);
        put_u16(&mut out, self.modified.time);
        put_u16(&mut out, self.modified.date);
        put_u32(&mut out, self.crc32);
        put_u32(&mut out, self.compressed_size);
        put_u32(&mut out, self.uncompressed_size);
        put_u16(&mut out, self.name.len() as u16);
        put_u16(&mut out, self.extra.len() as u16);
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.extra);
        out
    }
}

/// A central directory header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    /// Version made by; high byte is the host system.
    pub version_made_by: u16,
    /// Version needed to extract.
    pub version_needed: u16,
    /// General purpose flags.
    pub flags: u16,
    /// Header method (99 for AES).
    pub method: u16,
    /// Modification time.
    pub modified: DosDateTime,
    /// CRC-32.
    pub crc32: u32,
    /// Compressed size or sentinel.
    pub compressed_size: u32,
    /// Uncompressed size or sentinel.
    pub uncompressed_size: u32,
    /// Disk holding the local header, or sentinel.
    pub disk_start: u16,
    /// Internal attributes.
    pub internal_attributes: u16,
    /// External (host) attributes.
    pub external_attributes: u32,
    /// Local header offset or sentinel.
    pub local_header_offset: u32,
    /// Raw name bytes.
    pub name: Vec<u8>,
    /// Raw extra field.
    pub extra: Vec<u8>,
    /// Raw comment bytes.
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    /// Parse the record following an already-read signature check.
    ///
    /// `offset` is where the signature starts.
    pub fn read<R: Read + ?Sized>(reader: &mut R, offset: u64) -> Result<Self> {
        let mut buf = [0u8; CENTRAL_HEADER_LEN];
        reader
            .read_exact(&mut buf)
            .map_err(|e| ZipError::from_read(e, offset, CENTRAL_HEADER_LEN as u64))?;
        check_signature(&buf, CENTRAL_DIR_HEADER_SIG, offset)?;

        let name_len = le_u16(&buf, 28) as usize;
        let extra_len = le_u16(&buf, 30) as usize;
        let comment_len = le_u16(&buf, 32) as usize;
        let mut at = offset + CENTRAL_HEADER_LEN as u64;
        let name = read_vec(reader, name_len, at)?;
        at += name_len as u64;
        let extra = read_vec(reader, extra_len, at)?;
        at += extra_len as u64;
        let comment = read_vec(reader, comment_len, at)?;

        Ok(Self {
            version_made_by: le_u16(&buf, 4),
            version_needed: le_u16(&buf, 6),
            flags: le_u16(&buf, 8),
            method: le_u16(&buf, 10),
            modified: DosDateTime::new(le_u16(&buf, 14), le_u16(&buf, 12)),
            crc32: le_u32(&buf, 16),
            compressed_size: le_u32(&buf, 20),
            uncompressed_size: le_u32(&buf, 24),
            disk_start: le_u16(&buf, 34),
            internal_attributes: le_u16(&buf, 36),
            external_attributes: le_u32(&buf, 38),
            local_header_offset: le_u32(&buf, 42),
            name,
            extra,
            comment,
        })
    }

    /// Total encoded length.
    pub fn encoded_len(&self) -> u64 {
        (CENTRAL_HEADER_LEN + self.name.len() + self.extra.len() + self.comment.len()) as u64
    }

    /// Append the rendered record to `out`.
    pub fn write_into(&self, out: &mut Vec<u8>) {
        put_u32(out, CENTRAL_DIR_HEADER_SIG);
        put_u16(out, self.version_made_by);
        put_u16(out, self.version_needed);
        put_u16(out, self.flags);
        put_u16(out, self.method);
        put_u16(out, self.modified.time);
        put_u16(out, self.modified.date);
        put_u32(out, self.crc32);
        put_u32(out, self.compressed_size);
        put_u32(out, self.uncompressed_size);
        put_u16(out, self.name.len() as u16);
        put_u16(out, self.extra.len() as u16);
        put_u16(out, self.comment.len() as u16);
        put_u16(out, self.disk_start);
        put_u16(out, self.internal_attributes);
        put_u32(out, self.external_attributes);
        put_u32(out, self.local_header_offset);
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.extra);
        out.extend_from_slice(&self.comment);
    }
}

/// The end of central directory record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    /// Number of this disk.
    pub disk_number: u16,
    /// Disk where the central directory starts.
    pub cd_disk: u16,
    /// Entries on this disk.
    pub entries_on_disk: u16,
    /// Total entries.
    pub total_entries: u16,
    /// Central directory size.
    pub cd_size: u32,
    /// Central directory offset, relative to its disk.
    pub cd_offset: u32,
    /// Raw archive comment.
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    /// Parse the record from `buf`, which starts at the signature found at `offset`.
    ///
    /// The comment is clipped to the bytes available; some writers get its
    /// length wrong.
    pub fn parse(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < EOCD_LEN {
            return Err(ZipError::truncated(offset, EOCD_LEN as u64));
        }
        check_signature(buf, END_OF_CENTRAL_DIR_SIG, offset)?;
        let comment_len = le_u16(buf, 20) as usize;
        let available = (buf.len() - EOCD_LEN).min(comment_len);
        Ok(Self {
            disk_number: le_u16(buf, 4),
            cd_disk: le_u16(buf, 6),
            entries_on_disk: le_u16(buf, 8),
            total_entries: le_u16(buf, 10),
            cd_size: le_u32(buf, 12),
            cd_offset: le_u32(buf, 16),
            comment: buf[EOCD_LEN..EOCD_LEN + available].to_vec(),
        })
    }

    /// True if any field holds a ZIP64 sentinel.
    pub fn has_sentinels(&self) -> bool {
        self.disk_number == MARKER_16
            || self.cd_disk == MARKER_16
            || self.entries_on_disk == MARKER_16
            || self.total_entries == MARKER_16
            || self.cd_size == MARKER_32
            || self.cd_offset == MARKER_32
    }

    /// Append the rendered record to `out`.
    pub fn write_into(&self, out: &mut Vec<u8>) {
        put_u32(out, END_OF_CENTRAL_DIR_SIG);
        put_u16(out, self.disk_number);
        put_u16(out, self.cd_disk);
        put_u16(out, self.entries_on_disk);
        put_u16(out, self.total_entries);
        put_u32(out, self.cd_size);
        put_u32(out, self.cd_offset);
        put_u16(out, self.comment.len() as u16);
        out.extend_from_slice(&self.comment);
    }
}

/// The ZIP64 end of central directory record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Zip64EndOfCentralDirectory {
    /// Version made by.
    pub version_made_by: u16,
    /// Version needed.
    pub version_needed: u16,
    /// Number of this disk.
    pub disk_number: u32,
    /// Disk where the central directory starts.
    pub cd_disk: u32,
    /// Entries on this disk.
    pub entries_on_disk: u64,
    /// Total entries.
    pub total_entries: u64,
    /// Central directory size.
    pub cd_size: u64,
    /// Central directory offset, relative to its disk.
    pub cd_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    /// Read the record starting at `offset`. Extensible data is ignored.
    pub fn read<R: Read + ?Sized>(reader: &mut R, offset: u64) -> Result<Self> {
        let mut buf = [0u8; ZIP64_EOCD_LEN];
        reader
            .read_exact(&mut buf)
            .map_err(|e| ZipError::from_read(e, offset, ZIP64_EOCD_LEN as u64))?;
        check_signature(&buf, ZIP64_END_OF_CENTRAL_DIR_SIG, offset)?;
        Ok(Self {
            version_made_by: le_u16(&buf, 12),
            version_needed: le_u16(&buf, 14),
            disk_number: le_u32(&buf, 16),
            cd_disk: le_u32(&buf, 20),
            entries_on_disk: le_u64(&buf, 24),
            total_entries: le_u64(&buf, 32),
            cd_size: le_u64(&buf, 40),
            cd_offset: le_u64(&buf, 48),
        })
    }

    /// Append the rendered record to `out`.
    pub fn write_into(&self, out: &mut Vec<u8>) {
        put_u32(out, ZIP64_END_OF_CENTRAL_DIR_SIG);
        put_u64(out, (ZIP64_EOCD_LEN - 12) as u64);
        put_u16(out, self.version_made_by);
        put_u16(out, self.version_needed);
        put_u32(out, self.disk_number);
        put_u32(out, self.cd_disk);
        put_u64(out, self.entries_on_disk);
        put_u64(out, self.total_entries);
        put_u64(out, self.cd_size);
        put_u64(out, self.cd_offset);
    }
}

/// The ZIP64 end of central directory locator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zip64Locator {
    /// Disk holding the ZIP64 record.
    pub record_disk: u32,
    /// Offset of the ZIP64 record, relative to its disk.
    pub record_offset: u64,
    /// Total number of disks.
    pub total_disks: u32,
}

impl Zip64Locator {
    /// Parse a locator from exactly [`ZIP64_LOCATOR_LEN`] bytes.
    ///
    /// Returns `None` when the signature does not match; a missing locator is
    /// not an error by itself.
    pub fn parse(buf: &[u8; ZIP64_LOCATOR_LEN]) -> Option<Self> {
        if le_u32(buf, 0) != ZIP64_LOCATOR_SIG {
            return None;
        }
        Some(Self {
            record_disk: le_u32(buf, 4),
            record_offset: le_u64(buf, 8),
            total_disks: le_u32(buf, 16),
        })
    }

    /// Append the rendered locator to `out`.
    pub fn write_into(&self, out: &mut Vec<u8>) {
        put_u32(out, ZIP64_LOCATOR_SIG);
        put_u32(out, self.record_disk);
        put_u64(out, self.record_offset);
        put_u32(out, self.total_disks);
    }
}

/// A data descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDescriptor {
    /// CRC-32.
    pub crc32: u32,
    /// Compressed size.
    pub compressed_size: u64,
    /// Uncompressed size.
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    /// Render with signature; 8-byte sizes when `zip64`.
    pub fn to_bytes(&self, zip64: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        put_u32(&mut out, DATA_DESCRIPTOR_SIG);
        put_u32(&mut out, self.crc32);
        if zip64 {
            put_u64(&mut out, self.compressed_size);
            put_u64(&mut out, self.uncompressed_size);
        } else {
            put_u32(&mut out, self.compressed_size as u32);
            put_u32(&mut out, self.uncompressed_size as u32);
        }
        out
    }

    /// Read a descriptor at `offset`; the signature is optional.
    pub fn read<R: Read + ?Sized>(reader: &mut R, zip64: bool, offset: u64) -> Result<Self> {
        let size_len = if zip64 { 8 } else { 4 };
        let mut first = [0u8; 4];
        reader
            .read_exact(&mut first)
            .map_err(|e| ZipError::from_read(e, offset, 4))?;
        let crc32 = if le_u32(&first, 0) == DATA_DESCRIPTOR_SIG {
            let raw = read_vec(reader, 4, offset + 4)?;
            le_u32(&raw, 0)
        } else {
            le_u32(&first, 0)
        };
        let raw = read_vec(reader, size_len * 2, offset)?;
        let (compressed_size, uncompressed_size) = if zip64 {
            (le_u64(&raw, 0), le_u64(&raw, 8))
        } else {
            (u64::from(le_u32(&raw, 0)), u64::from(le_u32(&raw, 4)))
        };
        Ok(Self {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_local() -> LocalFileHeader {
        LocalFileHeader {
            version_needed: VERSION_DEFAULT,
            flags: FLAG_UTF8,
            method: 8,
            modified: DosDateTime::new(0x5A21, 0x6C00),
            crc32: 0xCAFE_BABE,
            compressed_size: 10,
            uncompressed_size: 20,
            name: b"dir/file.txt".to_vec(),
            extra: vec![0x99, 0x99, 0, 0],
        }
    }

    #[test]
    fn test_local_header_layout() {
        let bytes = sample_local().to_bytes();
        assert_eq!(&bytes[..4], b"PK\x03\x04");
        assert_eq!(bytes.len(), 30 + 12 + 4);
        assert_eq!(le_u16(&bytes, LOCAL_VERSION_AT), VERSION_DEFAULT);
        assert_eq!(le_u16(&bytes, LOCAL_FLAGS_AT), FLAG_UTF8);
        assert_eq!(le_u32(&bytes, LOCAL_CRC_AT), 0xCAFE_BABE);
        assert_eq!(le_u32(&bytes, LOCAL_COMPRESSED_AT), 10);
        assert_eq!(le_u32(&bytes, LOCAL_UNCOMPRESSED_AT), 20);

        let parsed = LocalFileHeader::read(&mut Cursor::new(bytes), 0).expect("parse");
        assert_eq!(parsed, sample_local());
    }

    #[test]
    fn test_bad_signature_reports_offset() {
        let mut bytes = sample_local().to_bytes();
        bytes[3] = 0x02;
        let err = LocalFileHeader::read(&mut Cursor::new(bytes), 4096);
        assert!(matches!(
            err,
            Err(ZipError::BadSignature {
                offset: 4096,
                expected: LOCAL_FILE_HEADER_SIG,
                found: 0x02034B50
            })
        ));
    }

    #[test]
    fn test_central_header_fields() {
        let header = CentralDirectoryHeader {
            version_made_by: version_made_by(),
            version_needed: VERSION_ZIP64,
            flags: 0,
            method: 0,
            modified: DosDateTime::EPOCH,
            crc32: 1,
            compressed_size: MARKER_32,
            uncompressed_size: MARKER_32,
            disk_start: 0,
            internal_attributes: 0,
            external_attributes: 0o100644 << 16,
            local_header_offset: 1234,
            name: b"a".to_vec(),
            extra: Vec::new(),
            comment: b"note".to_vec(),
        };
        let mut out = Vec::new();
        header.write_into(&mut out);
        assert_eq!(out.len() as u64, header.encoded_len());
        let parsed = CentralDirectoryHeader::read(&mut Cursor::new(out), 0).expect("parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_eocd_sentinels_and_short_comment() {
        let eocd = EndOfCentralDirectory {
            total_entries: MARKER_16,
            entries_on_disk: MARKER_16,
            comment: b"hello".to_vec(),
            ..Default::default()
        };
        let mut out = Vec::new();
        eocd.write_into(&mut out);
        assert!(EndOfCentralDirectory::parse(&out, 0).expect("parse").has_sentinels());

        // Comment length claims more bytes than exist.
        out.truncate(out.len() - 2);
        let clipped = EndOfCentralDirectory::parse(&out, 0).expect("parse");
        assert_eq!(clipped.comment, b"hel");
    }

    #[test]
    fn test_zip64_records() {
        let record = Zip64EndOfCentralDirectory {
            version_made_by: version_made_by(),
            version_needed: VERSION_ZIP64,
            entries_on_disk: 70_000,
            total_entries: 70_000,
            cd_size: 5_000_000_000,
            cd_offset: 6_000_000_000,
            ..Default::default()
        };
        let mut out = Vec::new();
        record.write_into(&mut out);
        assert_eq!(out.len(), ZIP64_EOCD_LEN);
        assert_eq!(
            Zip64EndOfCentralDirectory::read(&mut Cursor::new(&out), 0).expect("parse"),
            record
        );

        let locator = Zip64Locator {
            record_disk: 0,
            record_offset: 11_000_000_000,
            total_disks: 1,
        };
        let mut raw = Vec::new();
        locator.write_into(&mut raw);
        let raw: [u8; ZIP64_LOCATOR_LEN] = raw.try_into().expect("20 bytes");
        assert_eq!(Zip64Locator::parse(&raw), Some(locator));
        assert_eq!(Zip64Locator::parse(&[0u8; ZIP64_LOCATOR_LEN]), None);
    }

    #[test]
    fn test_data_descriptor_with_and_without_signature() {
        let dd = DataDescriptor {
            crc32: 0x1234_5678,
            compressed_size: 100,
            uncompressed_size: 200,
        };
        let signed = dd.to_bytes(false);
        assert_eq!(signed.len(), 16);
        assert_eq!(
            DataDescriptor::read(&mut Cursor::new(&signed), false, 0).expect("parse"),
            dd
        );

        let unsigned = &signed[4..];
        assert_eq!(
            DataDescriptor::read(&mut Cursor::new(unsigned), false, 0).expect("parse"),
            dd
        );

        let wide = dd.to_bytes(true);
        assert_eq!(wide.len(), 24);
        assert_eq!(
            DataDescriptor::read(&mut Cursor::new(&wide), true, 0).expect("parse"),
            dd
        );
    }
}
