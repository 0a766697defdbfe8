//! # OxiZip Archive
//!
//! ZIP archive engine: read, modify and write ZIP files.
//!
//! ## Features
//!
//! | Feature | Read | Write |
//! |---------|------|-------|
//! | Stored / Deflate | Yes | Yes |
//! | ZIP64 (sizes, offsets, entry counts) | Yes | Yes |
//! | Split archives (`.z01`, `.z02`, ..., `.zip`) | Yes | Yes |
//! | Traditional PKWARE encryption | Yes | Yes |
//! | WinZip AES (128/192/256) | Yes | Yes |
//! | NTFS / Unix high-precision times | Yes | Yes |
//! | Code-page names (CP437 or any `encoding_rs` encoding) | Yes | Yes |
//! | Parallel deflate for large entries | - | Yes |
//! | Directory recovery from local headers | Yes | - |
//!
//! Entries are added, replaced and removed on a [`ZipArchive`] in memory.
//! A save streams every entry to a temporary file, then replaces the target.
//! Entries whose settings did not change are copied byte-for-byte.
//!
//! ## Example
//!
//! ```rust,no_run
//! use oxizip_archive::{EncryptionAlgorithm, ZipArchive};
//!
//! let mut archive = ZipArchive::new();
//! archive.set_password(Some("secret".into()));
//! archive.set_encryption(EncryptionAlgorithm::WinZipAes256);
//! archive.add_entry("notes/readme.txt", b"Hello".to_vec())?;
//! archive.add_directory("assets", "assets")?;
//! archive.save_as("bundle.zip")?;
//!
//! let mut archive = ZipArchive::open("bundle.zip")?;
//! archive.set_password(Some("secret".into()));
//! archive.extract_all("out")?;
//! # Ok::<(), oxizip_core::ZipError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod codec;
pub mod crypto;
pub mod encoding;
pub mod entry;
pub mod events;
pub mod extra;
pub mod extract;
pub mod header;
pub mod input;
pub mod options;
pub mod parallel;
pub mod reader;
pub mod save;
pub mod segmented;
pub mod sink;
pub mod source;
pub mod time;

// Re-exports
pub use archive::ZipArchive;
pub use crypto::aes::AesStrength;
pub use encoding::{AlternateEncodingUsage, TextEncoding};
pub use entry::{CompressionMethod, EncryptionAlgorithm, ZipEntry};
pub use events::{CancelToken, EventSink, Reply, ZipEvent};
pub use extract::{EntryReader, ExtractOutcome};
pub use options::{ExtractExistingFile, ParallelDeflate, ReadOptions, Zip64Option};
pub use save::SaveOutcome;
pub use source::{CloseCallback, EntrySource, OpenCallback, WriteCallback};
pub use time::{EntryTimes, TimeFormats};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        CompressionMethod, EncryptionAlgorithm, EventSink, ExtractExistingFile, ExtractOutcome,
        ReadOptions, Reply, SaveOutcome, ZipArchive, ZipEntry, ZipEvent, Zip64Option,
    };
    pub use oxizip_core::{Result, ZipError};
}
