//! Extra-field blocks.
//!
//! The extra field of a header is a sequence of `(id: u16, len: u16, data)`
//! blocks. The engine understands five of them and carries every other block
//! through unchanged.

use crate::crypto::AesStrength;
use crate::time::{
    EntryTimes, datetime_to_filetime, datetime_to_unix, filetime_to_datetime, unix_to_datetime,
};
use chrono::{DateTime, Utc};
use oxizip_core::bytes::{le_u16, le_u32, le_u64, put_u16, put_u32, put_u64};
use oxizip_core::error::{Result, ZipError};

/// ZIP64 extended information.
pub const ZIP64_EXTRA_ID: u16 = 0x0001;
/// NTFS timestamps.
pub const NTFS_EXTRA_ID: u16 = 0x000A;
/// PKWARE strong encryption header.
pub const STRONG_ENCRYPTION_EXTRA_ID: u16 = 0x0017;
/// Info-ZIP extended timestamp.
pub const UNIX_TIME_EXTRA_ID: u16 = 0x5455;
/// WinZip AES.
pub const AES_EXTRA_ID: u16 = 0x9901;
/// Placeholder for a reserved ZIP64 block that turned out unused.
pub const DUMMY_EXTRA_ID: u16 = 0x9999;

/// One raw extra-field block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraBlock {
    /// Header id.
    pub id: u16,
    /// Block payload.
    pub data: Vec<u8>,
}

/// Split an extra field into blocks.
///
/// Trailing bytes too short to form a block are ignored, as are blocks whose
/// declared length runs past the end; some producers pad the field.
pub fn parse_blocks(extra: &[u8]) -> Vec<ExtraBlock> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = le_u16(extra, pos);
        let len = le_u16(extra, pos + 2) as usize;
        let start = pos + 4;
        if start + len > extra.len() {
            break;
        }
        blocks.push(ExtraBlock {
            id,
            data: extra[start..start + len].to_vec(),
        });
        pos = start + len;
    }
    blocks
}

/// Append one block.
pub fn put_block(out: &mut Vec<u8>, id: u16, data: &[u8]) {
    put_u16(out, id);
    put_u16(out, data.len() as u16);
    out.extend_from_slice(data);
}

/// Find a block by id.
pub fn find_block(blocks: &[ExtraBlock], id: u16) -> Option<&ExtraBlock> {
    blocks.iter().find(|b| b.id == id)
}

/// Fields carried by a ZIP64 block.
///
/// Only the fields whose 32-bit (or 16-bit) header value holds the sentinel
/// are present, always in this order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zip64Fields {
    /// Uncompressed size.
    pub uncompressed: Option<u64>,
    /// Compressed size.
    pub compressed: Option<u64>,
    /// Local header offset.
    pub offset: Option<u64>,
    /// Disk number.
    pub disk: Option<u32>,
}

impl Zip64Fields {
    /// Parse the fields whose header values were sentinels.
    ///
    /// `at` is the archive offset used in error reports.
    pub fn parse(
        data: &[u8],
        uncompressed: bool,
        compressed: bool,
        offset: bool,
        disk: bool,
        at: u64,
    ) -> Result<Self> {
        let mut fields = Self::default();
        let mut pos = 0;
        let take8 = |pos: &mut usize| -> Result<u64> {
            if *pos + 8 > data.len() {
                return Err(ZipError::format(at, "ZIP64 extra field too short"));
            }
            let v = le_u64(data, *pos);
            *pos += 8;
            Ok(v)
        };

        if uncompressed {
            fields.uncompressed = Some(take8(&mut pos)?);
        }
        if compressed {
            fields.compressed = Some(take8(&mut pos)?);
        }
        if offset {
            fields.offset = Some(take8(&mut pos)?);
        }
        if disk {
            if pos + 4 > data.len() {
                return Err(ZipError::format(at, "ZIP64 extra field too short"));
            }
            fields.disk = Some(le_u32(data, pos));
        }
        Ok(fields)
    }

    /// True if no field is present.
    pub fn is_empty(&self) -> bool {
        self.uncompressed.is_none()
            && self.compressed.is_none()
            && self.offset.is_none()
            && self.disk.is_none()
    }

    /// Encode the present fields.
    pub fn to_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        if let Some(v) = self.uncompressed {
            put_u64(&mut out, v);
        }
        if let Some(v) = self.compressed {
            put_u64(&mut out, v);
        }
        if let Some(v) = self.offset {
            put_u64(&mut out, v);
        }
        if let Some(v) = self.disk {
            put_u32(&mut out, v);
        }
        out
    }
}

/// Parse an NTFS block (0x000A): reserved(4), then tagged attributes.
/// Tag 1 with size 24 holds mtime, atime, ctime.
pub fn parse_ntfs_times(data: &[u8]) -> Option<EntryTimes> {
    let mut pos = 4;
    while pos + 4 <= data.len() {
        let tag = le_u16(data, pos);
        let size = le_u16(data, pos + 2) as usize;
        pos += 4;
        if pos + size > data.len() {
            return None;
        }
        if tag == 1 && size >= 24 {
            return Some(EntryTimes {
                modified: filetime_to_datetime(le_u64(data, pos))?,
                accessed: filetime_to_datetime(le_u64(data, pos + 8))?,
                created: filetime_to_datetime(le_u64(data, pos + 16))?,
            });
        }
        pos += size;
    }
    None
}

/// Encode an NTFS block payload.
pub fn ntfs_times_data(times: &EntryTimes) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    put_u32(&mut out, 0);
    put_u16(&mut out, 1);
    put_u16(&mut out, 24);
    put_u64(&mut out, datetime_to_filetime(times.modified));
    put_u64(&mut out, datetime_to_filetime(times.accessed));
    put_u64(&mut out, datetime_to_filetime(times.created));
    out
}

/// Times read from an extended timestamp block (0x5455).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnixTimes {
    /// Modification time.
    pub modified: Option<DateTime<Utc>>,
    /// Access time.
    pub accessed: Option<DateTime<Utc>>,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
}

impl UnixTimes {
    /// Parse either the local or the central form.
    ///
    /// The flags byte announces which times exist; the central form keeps
    /// only mtime even when the flags announce more.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let flags = *data.first()?;
        let mut pos = 1;
        let mut next = |bit: u8| -> Option<DateTime<Utc>> {
            if flags & bit == 0 || pos + 4 > data.len() {
                return None;
            }
            let secs = le_u32(data, pos) as i32;
            pos += 4;
            unix_to_datetime(secs)
        };
        let modified = next(1);
        let accessed = next(2);
        let created = next(4);
        Some(Self {
            modified,
            accessed,
            created,
        })
    }

    /// Fill missing values from mtime.
    pub fn to_entry_times(self) -> Option<EntryTimes> {
        let modified = self.modified?;
        Some(EntryTimes {
            modified,
            accessed: self.accessed.unwrap_or(modified),
            created: self.created.unwrap_or(modified),
        })
    }
}

/// Encode an extended timestamp payload. The central form carries mtime only.
pub fn unix_times_data(times: &EntryTimes, central: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(0x07);
    put_u32(&mut out, datetime_to_unix(times.modified) as u32);
    if !central {
        put_u32(&mut out, datetime_to_unix(times.accessed) as u32);
        put_u32(&mut out, datetime_to_unix(times.created) as u32);
    }
    out
}

/// WinZip AES block (0x9901).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesExtra {
    /// 1 for AE-1 (CRC verified), 2 for AE-2 (CRC not stored).
    pub vendor_version: u16,
    /// Key strength.
    pub strength: AesStrength,
    /// The compression method actually used on the plaintext.
    pub method: u16,
}

impl AesExtra {
    /// Parse a 7-byte payload. Returns `None` for anything unrecognized.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || &data[2..4] != b"AE" {
            return None;
        }
        Some(Self {
            vendor_version: le_u16(data, 0),
            strength: AesStrength::from_u8(data[4])?,
            method: le_u16(data, 5),
        })
    }

    /// Encode the payload.
    pub fn to_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7);
        put_u16(&mut out, self.vendor_version);
        out.extend_from_slice(b"AE");
        out.push(self.strength as u8);
        put_u16(&mut out, self.method);
        out
    }
}

/// Algorithm id from a strong encryption header (0x0017).
pub fn strong_encryption_algorithm(data: &[u8]) -> Option<u16> {
    (data.len() >= 4).then(|| le_u16(data, 2))
}

/// True for ids the engine regenerates itself on write.
pub fn is_managed(id: u16) -> bool {
    matches!(
        id,
        ZIP64_EXTRA_ID | NTFS_EXTRA_ID | UNIX_TIME_EXTRA_ID | AES_EXTRA_ID | DUMMY_EXTRA_ID
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_blocks_tolerates_padding() {
        let mut extra = Vec::new();
        put_block(&mut extra, 0xCAFE, b"abc");
        put_block(&mut extra, NTFS_EXTRA_ID, &[0u8; 4]);
        extra.extend_from_slice(&[0, 0]);
        let blocks = parse_blocks(&extra);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id, 0xCAFE);
        assert_eq!(blocks[0].data, b"abc");
        assert!(find_block(&blocks, NTFS_EXTRA_ID).is_some());
    }

    #[test]
    fn test_zip64_fields_only_sentinels() {
        let fields = Zip64Fields {
            uncompressed: Some(5_000_000_000),
            compressed: None,
            offset: Some(7),
            disk: None,
        };
        let data = fields.to_data();
        assert_eq!(data.len(), 16);
        let parsed = Zip64Fields::parse(&data, true, false, true, false, 0).expect("parse");
        assert_eq!(parsed, fields);

        let short = Zip64Fields::parse(&data, true, true, true, false, 99);
        assert!(matches!(short, Err(ZipError::Format { offset: 99, .. })));
    }

    #[test]
    fn test_ntfs_block_layout() {
        let at = Utc.with_ymd_and_hms(2020, 5, 17, 8, 30, 0).single().expect("time");
        let times = EntryTimes::uniform(at);
        let data = ntfs_times_data(&times);
        assert_eq!(data.len(), 32);
        assert_eq!(le_u16(&data, 4), 1);
        assert_eq!(le_u16(&data, 6), 24);
        assert_eq!(parse_ntfs_times(&data), Some(times));
    }

    #[test]
    fn test_unix_central_form_has_mtime_only() {
        let at = Utc.with_ymd_and_hms(2019, 1, 2, 3, 4, 5).single().expect("time");
        let times = EntryTimes::uniform(at);
        assert_eq!(unix_times_data(&times, false).len(), 13);
        let central = unix_times_data(&times, true);
        assert_eq!(central.len(), 5);

        let parsed = UnixTimes::parse(&central).expect("parse");
        assert_eq!(parsed.modified, Some(at));
        assert_eq!(parsed.accessed, None);
        assert_eq!(parsed.to_entry_times(), Some(times));
    }

    #[test]
    fn test_aes_extra() {
        let aes = AesExtra {
            vendor_version: 2,
            strength: AesStrength::Aes256,
            method: 8,
        };
        let data = aes.to_data();
        assert_eq!(data, [2, 0, b'A', b'E', 3, 8, 0]);
        assert_eq!(AesExtra::parse(&data), Some(aes));
        assert_eq!(AesExtra::parse(&[2, 0, b'X', b'E', 3, 8, 0]), None);
    }

    #[test]
    fn test_strong_encryption_algorithm() {
        assert_eq!(strong_encryption_algorithm(&[2, 0, 0x10, 0x66]), Some(0x6610));
        assert_eq!(strong_encryption_algorithm(&[2]), None);
    }
}
