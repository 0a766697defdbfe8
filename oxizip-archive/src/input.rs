//! The archive being read: one stream or a set of volumes.

use crate::segmented::SegmentedReader;
use oxizip_core::error::{Result, ZipError};
use std::io::{self, Read, Seek, SeekFrom};

/// A seekable byte source that can move between threads.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Input of an opened archive.
pub enum Input {
    /// One stream.
    Single(Box<dyn ReadSeek>),
    /// A split archive.
    Segmented(SegmentedReader),
}

impl Input {
    /// Logical position of `offset` on `disk`.
    pub fn resolve(&self, disk: u32, offset: u64) -> Result<u64> {
        match self {
            Self::Single(_) if disk == 0 => Ok(offset),
            Self::Single(_) => Err(ZipError::format(
                offset,
                format!("record on disk {disk}, but the archive was opened as a single stream"),
            )),
            Self::Segmented(reader) => reader.resolve(disk, offset),
        }
    }

    /// Number of volumes.
    pub fn disk_count(&self) -> u32 {
        match self {
            Self::Single(_) => 1,
            Self::Segmented(reader) => reader.disk_count(),
        }
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Single(r) => r.read(buf),
            Self::Segmented(r) => r.read(buf),
        }
    }
}

impl Seek for Input {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Single(r) => r.seek(pos),
            Self::Segmented(r) => r.seek(pos),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Input::Single"),
            Self::Segmented(r) => write!(f, "Input::Segmented({} volumes)", r.disk_count()),
        }
    }
}
