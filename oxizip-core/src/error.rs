//! Error types for OxiZip operations.
//!
//! Every failure the engine can report is a variant of [`ZipError`]. The
//! variants fall into a small number of classes, exposed through
//! [`ZipError::kind`], so callers can decide whether to prompt for a password,
//! skip an entry, or abort without matching on every variant.
//!
//! Cancellation is deliberately absent: a cancelled operation reports an
//! outcome, not an error.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Broad classification of a [`ZipError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or unexpected bytes in the archive structure.
    Format,
    /// Content failed a CRC or MAC check.
    Integrity,
    /// A configured policy forbids the operation.
    Policy,
    /// A password is missing or wrong.
    Credential,
    /// The archive uses a method or cipher this engine does not implement.
    Unsupported,
    /// The underlying reader, writer or filesystem failed.
    Io,
}

/// The main error type for OxiZip operations.
#[derive(Debug, Error)]
pub enum ZipError {
    /// I/O error from underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record signature did not match at a position where one was required.
    #[error("Bad signature at offset {offset:#x}: expected {expected:#010x}, found {found:#010x}")]
    BadSignature {
        /// Byte offset of the signature.
        offset: u64,
        /// Signature that was required.
        expected: u32,
        /// Raw four bytes found, little-endian.
        found: u32,
    },

    /// Structurally invalid archive data.
    #[error("Malformed archive at offset {offset:#x}: {message}")]
    Format {
        /// Byte offset where the problem was detected.
        offset: u64,
        /// Description of the problem.
        message: String,
    },

    /// The stream ended inside a record.
    #[error("Truncated archive at offset {offset:#x}: needed {needed} more bytes")]
    Truncated {
        /// Byte offset of the read that came up short.
        offset: u64,
        /// Number of bytes that were required.
        needed: u64,
    },

    /// CRC checksum mismatch after decoding an entry.
    #[error("CRC mismatch in {name}: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// Entry name.
        name: String,
        /// CRC stored in the archive.
        expected: u32,
        /// CRC computed over the decoded bytes.
        computed: u32,
    },

    /// The WinZip AES authentication code did not match.
    #[error("Authentication code mismatch in {name}")]
    MacMismatch {
        /// Entry name.
        name: String,
    },

    /// ZIP64 records are needed but the policy forbids them.
    #[error("ZIP64 required but disabled: {reason}")]
    Zip64Required {
        /// Which limit was exceeded.
        reason: String,
    },

    /// Two entries would share the same name.
    #[error("Duplicate entry name: {name}")]
    DuplicateEntry {
        /// The duplicated name.
        name: String,
    },

    /// Entry not found in archive.
    #[error("Entry not found: {name}")]
    EntryNotFound {
        /// Name of the missing entry.
        name: String,
    },

    /// The entry has no stored bytes yet; save the archive first.
    #[error("Entry {name} has not been written to the archive yet")]
    NotSaved {
        /// Entry name.
        name: String,
    },

    /// An entry reader is still active on the archive stream.
    #[error("Archive stream is busy with another entry reader")]
    ArchiveBusy,

    /// Extraction target already exists and the policy says to fail.
    #[error("Target already exists: {}", path.display())]
    TargetExists {
        /// The existing path.
        path: PathBuf,
    },

    /// Path traversal attack detected (e.g., "../" in filename).
    #[error("Path traversal detected in entry: {path}")]
    PathTraversal {
        /// The suspicious path.
        path: String,
    },

    /// Segment size outside the accepted range.
    #[error("Invalid segment size {size}: must be 0 or between 65536 and 4294967295")]
    InvalidSegmentSize {
        /// Requested size.
        size: u64,
    },

    /// The archive cannot be written in its current state.
    #[error("Cannot save archive: {message}")]
    Unsaveable {
        /// Why the save was refused.
        message: String,
    },

    /// The entry is encrypted and no password was supplied.
    #[error("Password required for {name}")]
    PasswordRequired {
        /// Entry name.
        name: String,
    },

    /// The supplied password failed the verification bytes.
    #[error("Bad password for {name}")]
    BadPassword {
        /// Entry name.
        name: String,
    },

    /// Unsupported compression method.
    #[error("Unsupported compression method: {id}")]
    UnsupportedMethod {
        /// Raw method id from the header.
        id: u16,
    },

    /// Unsupported encryption algorithm.
    #[error("Unsupported encryption algorithm: {id:#06x}")]
    UnsupportedEncryption {
        /// Raw algorithm id.
        id: u16,
    },
}

/// Result type alias for OxiZip operations.
pub type Result<T> = std::result::Result<T, ZipError>;

impl ZipError {
    /// Create a bad signature error.
    pub fn bad_signature(offset: u64, expected: u32, found: u32) -> Self {
        Self::BadSignature {
            offset,
            expected,
            found,
        }
    }

    /// Create a format error.
    pub fn format(offset: u64, message: impl Into<String>) -> Self {
        Self::Format {
            offset,
            message: message.into(),
        }
    }

    /// Create a truncation error.
    pub fn truncated(offset: u64, needed: u64) -> Self {
        Self::Truncated { offset, needed }
    }

    /// Create a CRC mismatch error.
    pub fn crc_mismatch(name: impl Into<String>, expected: u32, computed: u32) -> Self {
        Self::CrcMismatch {
            name: name.into(),
            expected,
            computed,
        }
    }

    /// Create a MAC mismatch error.
    pub fn mac_mismatch(name: impl Into<String>) -> Self {
        Self::MacMismatch { name: name.into() }
    }

    /// Create a ZIP64-required error.
    pub fn zip64_required(reason: impl Into<String>) -> Self {
        Self::Zip64Required {
            reason: reason.into(),
        }
    }

    /// Create a duplicate entry error.
    pub fn duplicate_entry(name: impl Into<String>) -> Self {
        Self::DuplicateEntry { name: name.into() }
    }

    /// Create an entry not found error.
    pub fn entry_not_found(name: impl Into<String>) -> Self {
        Self::EntryNotFound { name: name.into() }
    }

    /// Create a path traversal error.
    pub fn path_traversal(path: impl Into<String>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    /// Create an unsaveable error.
    pub fn unsaveable(message: impl Into<String>) -> Self {
        Self::Unsaveable {
            message: message.into(),
        }
    }

    /// Create a password required error.
    pub fn password_required(name: impl Into<String>) -> Self {
        Self::PasswordRequired { name: name.into() }
    }

    /// Create a bad password error.
    pub fn bad_password(name: impl Into<String>) -> Self {
        Self::BadPassword { name: name.into() }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::BadSignature { .. } | Self::Format { .. } | Self::Truncated { .. } => {
                ErrorKind::Format
            }
            Self::CrcMismatch { .. } | Self::MacMismatch { .. } => ErrorKind::Integrity,
            Self::Zip64Required { .. }
            | Self::DuplicateEntry { .. }
            | Self::EntryNotFound { .. }
            | Self::NotSaved { .. }
            | Self::ArchiveBusy
            | Self::TargetExists { .. }
            | Self::PathTraversal { .. }
            | Self::InvalidSegmentSize { .. }
            | Self::Unsaveable { .. } => ErrorKind::Policy,
            Self::PasswordRequired { .. } | Self::BadPassword { .. } => ErrorKind::Credential,
            Self::UnsupportedMethod { .. } | Self::UnsupportedEncryption { .. } => {
                ErrorKind::Unsupported
            }
        }
    }

    /// Map an `UnexpectedEof` I/O error to [`ZipError::Truncated`].
    pub fn from_read(err: io::Error, offset: u64, needed: u64) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::truncated(offset, needed)
        } else {
            Self::Io(err)
        }
    }

    /// Recover a [`ZipError`] that travelled through an adapter as an `io::Error`.
    pub fn from_io(err: io::Error) -> Self {
        let wraps_zip_error = err.get_ref().is_some_and(|e| e.is::<ZipError>());
        if !wraps_zip_error {
            return Self::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<ZipError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Self::Io(io::Error::new(kind, other)),
            None => Self::Io(io::Error::from(kind)),
        }
    }
}

impl From<ZipError> for io::Error {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ZipError::bad_signature(0x40, 0x0201_4B50, 0xDEAD_BEEF);
        let text = err.to_string();
        assert!(text.contains("0x40"));
        assert!(text.contains("0xdeadbeef"));

        let err = ZipError::crc_mismatch("a.txt", 0x12345678, 0xDEADBEEF);
        assert!(err.to_string().contains("CRC mismatch in a.txt"));

        let err = ZipError::UnsupportedMethod { id: 14 };
        assert!(err.to_string().contains("14"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ZipError = io_err.into();
        assert!(matches!(err, ZipError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_credential_errors_are_distinct() {
        let missing = ZipError::password_required("x");
        let wrong = ZipError::bad_password("x");
        assert_eq!(missing.kind(), ErrorKind::Credential);
        assert_eq!(wrong.kind(), ErrorKind::Credential);
        assert!(matches!(missing, ZipError::PasswordRequired { .. }));
        assert!(matches!(wrong, ZipError::BadPassword { .. }));
    }

    #[test]
    fn test_from_read_maps_eof() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err = ZipError::from_read(eof, 100, 46);
        assert!(matches!(
            err,
            ZipError::Truncated {
                offset: 100,
                needed: 46
            }
        ));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(ZipError::from_read(other, 0, 4), ZipError::Io(_)));
    }

    #[test]
    fn test_round_trip_through_io_error() {
        let err = ZipError::mac_mismatch("secret.bin");
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        let inner = io_err
            .get_ref()
            .and_then(|e| e.downcast_ref::<ZipError>())
            .map(|e| e.kind());
        assert_eq!(inner, Some(ErrorKind::Integrity));

        let back = ZipError::from_io(ZipError::mac_mismatch("secret.bin").into());
        assert!(matches!(back, ZipError::MacMismatch { .. }));
    }
}
