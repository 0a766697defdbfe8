//! # OxiZip Core
//!
//! Core components for the OxiZip archive engine.
//!
//! This crate provides the building blocks every other OxiZip crate sits on:
//!
//! - [`error`]: The error taxonomy shared by the reader, extractor and writer
//! - [`bytes`]: Little-endian integer access and signature scanning
//! - [`crc`]: CRC-32 accumulation, including pass-through reader/writer adapters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ CLI                                                     │
//! │     list / extract / test / create / info              │
//! ├─────────────────────────────────────────────────────────┤
//! │ Engine (oxizip-archive)                                 │
//! │     directory reader, extract + save pipelines, split  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Core (this crate)                                       │
//! │     errors, LE primitives, CRC-32                      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use oxizip_core::bytes::{le_u32, put_u32};
//! use oxizip_core::crc::Crc32;
//!
//! let mut buf = Vec::new();
//! put_u32(&mut buf, 0x0605_4B50);
//! assert_eq!(le_u32(&buf, 0), 0x0605_4B50);
//!
//! let crc = Crc32::compute(b"Hello, World!");
//! assert_eq!(crc, 0xEC4AC3D0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bytes;
pub mod crc;
pub mod error;

// Re-exports for convenience
pub use crc::{Crc32, CrcReader, CrcWriter};
pub use error::{ErrorKind, Result, ZipError};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bytes::{le_u16, le_u32, le_u64, put_u16, put_u32, put_u64};
    pub use crate::crc::{Crc32, CrcReader, CrcWriter};
    pub use crate::error::{ErrorKind, Result, ZipError};
}
