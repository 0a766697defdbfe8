//! Entry metadata.

use crate::crypto::AesStrength;
use crate::encoding::TextEncoding;
use crate::extra::{
    self, AES_EXTRA_ID, AesExtra, ExtraBlock, NTFS_EXTRA_ID, STRONG_ENCRYPTION_EXTRA_ID,
    UNIX_TIME_EXTRA_ID, UnixTimes, ZIP64_EXTRA_ID, Zip64Fields,
};
use crate::header::{
    CentralDirectoryHeader, FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED, FLAG_STRONG_ENCRYPTION,
    FLAG_UTF8, MARKER_16, MARKER_32, METHOD_AES, OS_MSDOS, OS_NTFS, OS_UNIX, OS_VFAT,
};
use crate::source::{EntrySource, StoredData};
use crate::time::{DosDateTime, EntryTimes};
use chrono::{DateTime, Utc};
use oxizip_core::error::{Result, ZipError};

/// Compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionMethod {
    /// No compression.
    Stored,
    /// Deflate.
    #[default]
    Deflated,
    /// Anything else; extraction fails with `UnsupportedMethod`.
    Unknown(u16),
}

impl CompressionMethod {
    /// Decode a header value.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Stored,
            8 => Self::Deflated,
            other => Self::Unknown(other),
        }
    }

    /// Header value.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
            Self::Unknown(id) => id,
        }
    }

    /// Short display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Stored => "Stored",
            Self::Deflated => "Deflate",
            Self::Unknown(_) => "Unknown",
        }
    }
}

/// Entry encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionAlgorithm {
    /// Not encrypted.
    #[default]
    None,
    /// Traditional PKWARE encryption.
    PkzipWeak,
    /// WinZip AES, 128-bit key.
    WinZipAes128,
    /// WinZip AES, 192-bit key.
    WinZipAes192,
    /// WinZip AES, 256-bit key.
    WinZipAes256,
    /// Something the engine cannot decrypt (strong encryption algorithm id).
    Unsupported(u16),
}

impl EncryptionAlgorithm {
    /// AES key strength, for the AES variants.
    pub fn aes_strength(self) -> Option<AesStrength> {
        match self {
            Self::WinZipAes128 => Some(AesStrength::Aes128),
            Self::WinZipAes192 => Some(AesStrength::Aes192),
            Self::WinZipAes256 => Some(AesStrength::Aes256),
            _ => None,
        }
    }

    /// The AES variant for a strength.
    pub fn from_strength(strength: AesStrength) -> Self {
        match strength {
            AesStrength::Aes128 => Self::WinZipAes128,
            AesStrength::Aes192 => Self::WinZipAes192,
            AesStrength::Aes256 => Self::WinZipAes256,
        }
    }

    /// True unless `None`.
    pub fn is_encrypted(self) -> bool {
        self != Self::None
    }

    /// Bytes the cipher adds around the data.
    pub fn overhead(self) -> u64 {
        match self {
            Self::PkzipWeak => crate::crypto::ENCRYPTION_HEADER_SIZE as u64,
            other => other.aes_strength().map_or(0, AesStrength::overhead),
        }
    }
}

/// Normalize a stored name: `/` separators, no leading `./` or `/`,
/// directories end with `/`.
pub fn normalize_name(name: &str, is_directory: bool) -> String {
    let mut name = name.replace('\\', "/");
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest.to_string();
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest.to_string();
        } else {
            break;
        }
    }
    if is_directory && !name.is_empty() && !name.ends_with('/') {
        name.push('/');
    }
    name
}

/// One archive member.
pub struct ZipEntry {
    pub(crate) name: String,
    pub(crate) comment: String,
    pub(crate) is_directory: bool,
    pub(crate) method: CompressionMethod,
    pub(crate) level: u32,
    pub(crate) encryption: EncryptionAlgorithm,
    pub(crate) aes_version: u16,
    pub(crate) password: Option<String>,
    /// Decrypts the stored bytes of an archive entry.
    pub(crate) source_password: Option<String>,
    pub(crate) crc32: u32,
    pub(crate) compressed_size: u64,
    pub(crate) uncompressed_size: u64,
    pub(crate) local_header_offset: u64,
    pub(crate) disk_number: u32,
    pub(crate) flags: u16,
    pub(crate) version_made_by: u16,
    pub(crate) version_needed: u16,
    pub(crate) modified: DosDateTime,
    pub(crate) times: Option<EntryTimes>,
    pub(crate) emit_ntfs: bool,
    pub(crate) emit_unix: bool,
    pub(crate) internal_attributes: u16,
    pub(crate) external_attributes: u32,
    pub(crate) extra_unknown: Vec<ExtraBlock>,
    pub(crate) included_in_save: bool,
    pub(crate) restream: bool,
    pub(crate) output_zip64: bool,
    pub(crate) source: EntrySource,
}

impl std::fmt::Debug for ZipEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipEntry")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("encryption", &self.encryption)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .field("compressed_size", &self.compressed_size)
            .field("uncompressed_size", &self.uncompressed_size)
            .field("local_header_offset", &self.local_header_offset)
            .field("disk_number", &self.disk_number)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl ZipEntry {
    /// A new entry with the given source. Times default to now.
    pub(crate) fn new(name: String, is_directory: bool, source: EntrySource) -> Self {
        let now = Utc::now();
        Self {
            name,
            comment: String::new(),
            is_directory,
            method: if is_directory {
                CompressionMethod::Stored
            } else {
                CompressionMethod::Deflated
            },
            level: 6,
            encryption: EncryptionAlgorithm::None,
            aes_version: 1,
            password: None,
            source_password: None,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            local_header_offset: 0,
            disk_number: 0,
            flags: 0,
            version_made_by: crate::header::version_made_by(),
            version_needed: crate::header::VERSION_DEFAULT,
            modified: DosDateTime::from_datetime(now),
            times: Some(EntryTimes::uniform(now)),
            emit_ntfs: false,
            emit_unix: false,
            internal_attributes: 0,
            external_attributes: default_attributes(is_directory),
            extra_unknown: Vec::new(),
            included_in_save: false,
            restream: false,
            output_zip64: false,
            source,
        }
    }

    /// Build an entry from a central directory record.
    ///
    /// Returns the entry and whether the record carried a ZIP64 block. The
    /// local header offset is left relative to its disk; `at` is the record's
    /// own position, for error reports.
    pub(crate) fn from_central(
        header: CentralDirectoryHeader,
        encoding: &TextEncoding,
        at: u64,
    ) -> Result<(Self, bool)> {
        let utf8 = header.flags & FLAG_UTF8 != 0;
        let name = encoding.decode_name(&header.name, utf8);
        let comment = encoding.decode_name(&header.comment, utf8);
        let blocks = extra::parse_blocks(&header.extra);

        let mut compressed_size = u64::from(header.compressed_size);
        let mut uncompressed_size = u64::from(header.uncompressed_size);
        let mut local_header_offset = u64::from(header.local_header_offset);
        let mut disk_number = u32::from(header.disk_start);
        let mut saw_zip64 = false;

        if let Some(block) = extra::find_block(&blocks, ZIP64_EXTRA_ID) {
            saw_zip64 = true;
            let fields = Zip64Fields::parse(
                &block.data,
                header.uncompressed_size == MARKER_32,
                header.compressed_size == MARKER_32,
                header.local_header_offset == MARKER_32,
                header.disk_start == MARKER_16,
                at,
            )?;
            uncompressed_size = fields.uncompressed.unwrap_or(uncompressed_size);
            compressed_size = fields.compressed.unwrap_or(compressed_size);
            local_header_offset = fields.offset.unwrap_or(local_header_offset);
            disk_number = fields.disk.unwrap_or(disk_number);
        }

        let mut method = CompressionMethod::from_u16(header.method);
        let mut encryption = EncryptionAlgorithm::None;
        let mut aes_version = 1;
        if header.flags & FLAG_ENCRYPTED != 0 {
            encryption = EncryptionAlgorithm::PkzipWeak;
        }
        if header.method == METHOD_AES {
            let aes = extra::find_block(&blocks, AES_EXTRA_ID)
                .and_then(|b| AesExtra::parse(&b.data))
                .ok_or_else(|| ZipError::format(at, "AES entry without a valid 0x9901 block"))?;
            method = CompressionMethod::from_u16(aes.method);
            encryption = EncryptionAlgorithm::from_strength(aes.strength);
            aes_version = aes.vendor_version;
        }
        if header.flags & FLAG_STRONG_ENCRYPTION != 0 {
            let id = extra::find_block(&blocks, STRONG_ENCRYPTION_EXTRA_ID)
                .and_then(|b| extra::strong_encryption_algorithm(&b.data))
                .unwrap_or(0);
            encryption = EncryptionAlgorithm::Unsupported(id);
        }

        let ntfs = extra::find_block(&blocks, NTFS_EXTRA_ID).and_then(|b| extra::parse_ntfs_times(&b.data));
        let unix = extra::find_block(&blocks, UNIX_TIME_EXTRA_ID)
            .and_then(|b| UnixTimes::parse(&b.data))
            .and_then(UnixTimes::to_entry_times);
        let emit_ntfs = ntfs.is_some();
        let emit_unix = unix.is_some();

        let is_directory = name.ends_with('/');
        let extra_unknown = blocks
            .into_iter()
            .filter(|b| !extra::is_managed(b.id))
            .collect();

        let source = EntrySource::Archive(StoredData {
            header_offset: local_header_offset,
            disk: disk_number,
            compressed_size,
            uncompressed_size,
            crc32: header.crc32,
            method,
            encryption,
            aes_version,
            flags: header.flags,
            modified: header.modified,
        });

        let entry = Self {
            name,
            comment,
            is_directory,
            method,
            level: 6,
            encryption,
            aes_version,
            password: None,
            source_password: None,
            crc32: header.crc32,
            compressed_size,
            uncompressed_size,
            local_header_offset,
            disk_number,
            flags: header.flags,
            version_made_by: header.version_made_by,
            version_needed: header.version_needed,
            modified: header.modified,
            times: ntfs.or(unix),
            emit_ntfs,
            emit_unix,
            internal_attributes: header.internal_attributes,
            external_attributes: header.external_attributes,
            extra_unknown,
            included_in_save: true,
            restream: false,
            output_zip64: saw_zip64,
            source,
        };
        Ok((entry, saw_zip64))
    }

    /// Stored name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// True for directory entries.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Compression method.
    pub fn compression_method(&self) -> CompressionMethod {
        self.method
    }

    /// Compression level hint (0-9).
    pub fn compression_level(&self) -> u32 {
        self.level
    }

    /// Encryption.
    pub fn encryption(&self) -> EncryptionAlgorithm {
        self.encryption
    }

    /// True if encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_encrypted()
    }

    /// WinZip AES vendor version (1 = AE-1, 2 = AE-2).
    pub fn aes_version(&self) -> u16 {
        self.aes_version
    }

    /// CRC-32 of the uncompressed content.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Stored size, including cipher overhead.
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Original size.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Offset of the local header, relative to its disk.
    pub fn local_header_offset(&self) -> u64 {
        self.local_header_offset
    }

    /// Disk holding the local header.
    pub fn disk_number(&self) -> u32 {
        self.disk_number
    }

    /// General purpose flags as last read or written.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// True if CRC and sizes follow the data.
    pub fn uses_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    /// "Version made by".
    pub fn version_made_by(&self) -> u16 {
        self.version_made_by
    }

    /// "Version needed to extract".
    pub fn version_needed(&self) -> u16 {
        self.version_needed
    }

    /// Host system byte of "version made by".
    pub fn host_system(&self) -> u8 {
        (self.version_made_by >> 8) as u8
    }

    /// DOS timestamp.
    pub fn dos_time(&self) -> DosDateTime {
        self.modified
    }

    /// Modification time: the precise one if known, else the DOS one.
    pub fn modified(&self) -> DateTime<Utc> {
        self.times
            .map_or_else(|| self.modified.to_datetime(), |t| t.modified)
    }

    /// High-precision times, if any.
    pub fn times(&self) -> Option<EntryTimes> {
        self.times
    }

    /// External attributes.
    pub fn external_attributes(&self) -> u32 {
        self.external_attributes
    }

    /// Unix permission bits, when made on Unix.
    pub fn unix_mode(&self) -> Option<u32> {
        (self.host_system() == OS_UNIX && self.external_attributes >> 16 != 0)
            .then_some(self.external_attributes >> 16)
    }

    /// DOS read-only attribute, when made on a DOS-like system.
    pub fn dos_read_only(&self) -> Option<bool> {
        matches!(self.host_system(), OS_MSDOS | OS_NTFS | OS_VFAT)
            .then_some(self.external_attributes & 0x01 != 0)
    }

    /// False if the entry was skipped by the last save.
    pub fn included_in_save(&self) -> bool {
        self.included_in_save
    }

    /// True if the last save (or the archive it was read from) used ZIP64 for it.
    pub fn used_zip64(&self) -> bool {
        self.output_zip64
    }

    /// Where the bytes come from at save time.
    pub fn source(&self) -> &EntrySource {
        &self.source
    }

    /// Set the comment.
    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    /// Change the compression method. Archive entries will be re-encoded.
    pub fn set_compression_method(&mut self, method: CompressionMethod) {
        if method != self.method {
            self.method = method;
            self.restream = true;
        }
    }

    /// Change the compression level. Archive entries will be re-encoded.
    pub fn set_compression_level(&mut self, level: u32) {
        let level = level.min(9);
        if level != self.level {
            self.level = level;
            self.restream = true;
        }
    }

    /// Change the encryption. Archive entries will be re-encoded.
    pub fn set_encryption(&mut self, encryption: EncryptionAlgorithm) {
        if encryption != self.encryption {
            self.encryption = encryption;
            self.restream = true;
        }
    }

    /// Set the password of this entry.
    ///
    /// For an encrypted archive entry that has no password yet this unlocks
    /// the stored bytes and nothing is re-encoded. Otherwise the entry is
    /// written with the new password on the next save.
    pub fn set_password(&mut self, password: Option<String>) {
        if password == self.password {
            return;
        }
        if let EntrySource::Archive(data) = &self.source {
            if data.encryption.is_encrypted() && self.source_password.is_none() {
                self.source_password = password.clone();
                self.password = password;
                return;
            }
        }
        self.password = password;
        self.restream = true;
    }

    /// Set the modification time (and the other precise times).
    pub fn set_modified(&mut self, at: DateTime<Utc>) {
        self.modified = DosDateTime::from_datetime(at);
        self.times = Some(EntryTimes::uniform(at));
        // The ZipCrypto check byte of a descriptor entry is the DOS time.
        if self.encryption == EncryptionAlgorithm::PkzipWeak && self.uses_data_descriptor() {
            self.restream = true;
        }
    }

    /// Set external attributes.
    pub fn set_external_attributes(&mut self, attributes: u32) {
        self.external_attributes = attributes;
    }

    /// Whether this entry needs the stored bytes decoded and re-encoded.
    pub(crate) fn needs_restream(&self) -> bool {
        match &self.source {
            EntrySource::Archive(_) => self.restream,
            _ => true,
        }
    }
}

fn default_attributes(is_directory: bool) -> u32 {
    if cfg!(unix) {
        let mode: u32 = if is_directory { 0o040755 } else { 0o100644 };
        (mode << 16) | u32::from(is_directory) * 0x10
    } else {
        u32::from(is_directory) * 0x10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{VERSION_AES, version_made_by};

    fn central(name: &[u8], flags: u16, method: u16, extra: Vec<u8>) -> CentralDirectoryHeader {
        CentralDirectoryHeader {
            version_made_by: version_made_by(),
            version_needed: VERSION_AES,
            flags,
            method,
            modified: DosDateTime::EPOCH,
            crc32: 0xDEAD_BEEF,
            compressed_size: 40,
            uncompressed_size: 12,
            disk_start: 0,
            internal_attributes: 0,
            external_attributes: 0,
            local_header_offset: 100,
            name: name.to_vec(),
            extra,
            comment: Vec::new(),
        }
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name(r"a\b\c.txt", false), "a/b/c.txt");
        assert_eq!(normalize_name("./././x", false), "x");
        assert_eq!(normalize_name("/abs/dir", true), "abs/dir/");
        assert_eq!(normalize_name("dir/", true), "dir/");
    }

    #[test]
    fn test_from_central_aes() {
        let mut extra = Vec::new();
        let aes = AesExtra {
            vendor_version: 2,
            strength: AesStrength::Aes256,
            method: 8,
        };
        extra::put_block(&mut extra, AES_EXTRA_ID, &aes.to_data());
        extra::put_block(&mut extra, 0xCAFE, b"keep");

        let header = central(b"secret.txt", FLAG_ENCRYPTED, METHOD_AES, extra);
        let (entry, zip64) =
            ZipEntry::from_central(header, &TextEncoding::default(), 0).expect("parse");
        assert!(!zip64);
        assert_eq!(entry.encryption(), EncryptionAlgorithm::WinZipAes256);
        assert_eq!(entry.compression_method(), CompressionMethod::Deflated);
        assert_eq!(entry.aes_version(), 2);
        assert_eq!(entry.extra_unknown.len(), 1);
        assert_eq!(entry.extra_unknown[0].data, b"keep");
        assert!(!entry.needs_restream());
    }

    #[test]
    fn test_from_central_zip64_offset_only() {
        let fields = Zip64Fields {
            offset: Some(5_000_000_000),
            ..Default::default()
        };
        let mut extra = Vec::new();
        extra::put_block(&mut extra, ZIP64_EXTRA_ID, &fields.to_data());
        let mut header = central(b"big", 0, 0, extra);
        header.local_header_offset = MARKER_32;

        let (entry, zip64) =
            ZipEntry::from_central(header, &TextEncoding::default(), 0).expect("parse");
        assert!(zip64);
        assert_eq!(entry.local_header_offset(), 5_000_000_000);
        assert_eq!(entry.compressed_size(), 40);
    }

    #[test]
    fn test_strong_encryption_is_unsupported() {
        let mut extra = Vec::new();
        extra::put_block(&mut extra, STRONG_ENCRYPTION_EXTRA_ID, &[2, 0, 0x10, 0x66]);
        let header = central(b"x", FLAG_ENCRYPTED | FLAG_STRONG_ENCRYPTION, 8, extra);
        let (entry, _) = ZipEntry::from_central(header, &TextEncoding::default(), 0).expect("parse");
        assert_eq!(entry.encryption(), EncryptionAlgorithm::Unsupported(0x6610));
    }

    #[test]
    fn test_setters_mark_restream() {
        let header = central(b"plain.txt", 0, 8, Vec::new());
        let (mut entry, _) =
            ZipEntry::from_central(header, &TextEncoding::default(), 0).expect("parse");
        entry.set_comment("no effect on bytes");
        assert!(!entry.needs_restream());
        entry.set_compression_method(CompressionMethod::Stored);
        assert!(entry.needs_restream());
    }

    #[test]
    fn test_password_unlocks_before_it_rekeys() {
        let header = central(b"locked.txt", FLAG_ENCRYPTED, 8, Vec::new());
        let (mut entry, _) =
            ZipEntry::from_central(header, &TextEncoding::default(), 0).expect("parse");
        entry.set_password(Some("old".into()));
        assert!(!entry.needs_restream());
        assert_eq!(entry.source_password.as_deref(), Some("old"));

        entry.set_password(Some("new".into()));
        assert!(entry.needs_restream());
        assert_eq!(entry.source_password.as_deref(), Some("old"));
    }
}
