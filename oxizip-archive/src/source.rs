//! Where an entry's bytes come from at save time.

use crate::entry::{CompressionMethod, EncryptionAlgorithm};
use crate::header::FLAG_DATA_DESCRIPTOR;
use crate::time::DosDateTime;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Callback that writes an entry's content into the save pipeline.
pub type WriteCallback = Box<dyn FnMut(&str, &mut dyn Write) -> io::Result<()> + Send>;

/// Callback that opens a reader for an entry.
pub type OpenCallback = Box<dyn FnMut(&str) -> io::Result<Box<dyn Read + Send>> + Send>;

/// Callback that receives the reader back once the entry is written.
pub type CloseCallback = Box<dyn FnMut(&str, Box<dyn Read + Send>) -> io::Result<()> + Send>;

/// Snapshot of an entry as it sits in the archive it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredData {
    /// Logical position of the local header in the input.
    pub header_offset: u64,
    /// Disk of the local header.
    pub disk: u32,
    /// Stored size including cipher overhead.
    pub compressed_size: u64,
    /// Original size.
    pub uncompressed_size: u64,
    /// Stored CRC.
    pub crc32: u32,
    /// Method of the stored bytes.
    pub method: CompressionMethod,
    /// Encryption of the stored bytes.
    pub encryption: EncryptionAlgorithm,
    /// AES vendor version.
    pub aes_version: u16,
    /// Flags of the stored entry.
    pub flags: u16,
    /// DOS time of the stored entry.
    pub modified: DosDateTime,
}

impl StoredData {
    /// True if the stored entry used a data descriptor.
    pub fn uses_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    /// Stored size without cipher overhead.
    pub fn data_size(&self) -> u64 {
        self.compressed_size
            .saturating_sub(self.encryption.overhead())
    }
}

/// Content source of an entry. Exactly one is active.
pub enum EntrySource {
    /// The archive the handle was opened from.
    Archive(StoredData),
    /// A file, read at save time.
    File(PathBuf),
    /// Bytes in memory.
    Buffer(Vec<u8>),
    /// A caller stream. It is consumed by the first save.
    Stream(Option<Box<dyn Read + Send>>),
    /// A callback that writes the content.
    WriteCallback(WriteCallback),
    /// A pair of callbacks that open and close a reader.
    OpenClose {
        /// Opens the reader.
        open: OpenCallback,
        /// Receives the reader after use.
        close: CloseCallback,
    },
}

impl fmt::Debug for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive(data) => f.debug_tuple("Archive").field(data).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            Self::Stream(stream) => write!(
                f,
                "Stream({})",
                if stream.is_some() { "pending" } else { "consumed" }
            ),
            Self::WriteCallback(_) => f.write_str("WriteCallback"),
            Self::OpenClose { .. } => f.write_str("OpenClose"),
        }
    }
}

/// A source opened for reading.
pub(crate) enum OpenedSource<'a> {
    /// Pull-based content.
    Reader {
        reader: Box<dyn Read + 'a>,
        /// Length, when known before reading.
        len: Option<u64>,
    },
    /// Pull-based content that must be handed back to a close callback.
    Guarded(CloseGuard<'a>),
    /// Push-based content.
    Callback(&'a mut WriteCallback),
}

impl EntrySource {
    /// Length known before reading, if any.
    pub(crate) fn known_len(&self) -> io::Result<Option<u64>> {
        Ok(match self {
            Self::Archive(data) => Some(data.uncompressed_size),
            Self::File(path) => Some(std::fs::metadata(path)?.len()),
            Self::Buffer(bytes) => Some(bytes.len() as u64),
            _ => None,
        })
    }

    /// True if the content can be read twice (for a CRC pre-pass).
    pub(crate) fn is_rewindable(&self) -> bool {
        matches!(self, Self::File(_) | Self::Buffer(_))
    }

    /// CRC of a rewindable source, computed by reading it once.
    pub(crate) fn precompute_crc(&self) -> io::Result<Option<u32>> {
        match self {
            Self::File(path) => {
                let mut reader = oxizip_core::CrcReader::new(File::open(path)?);
                io::copy(&mut reader, &mut io::sink())?;
                Ok(Some(reader.crc()))
            }
            Self::Buffer(bytes) => Ok(Some(oxizip_core::Crc32::compute(bytes))),
            _ => Ok(None),
        }
    }

    /// Open a non-archive source. Archive sources are opened by the save
    /// pipeline, which owns the input stream.
    pub(crate) fn open<'a>(&'a mut self, name: &'a str) -> io::Result<OpenedSource<'a>> {
        match self {
            Self::Archive(_) => Err(io::Error::other("archive sources are opened by the pipeline")),
            Self::File(path) => {
                let file = File::open(&*path)?;
                let len = file.metadata()?.len();
                Ok(OpenedSource::Reader {
                    reader: Box::new(io::BufReader::new(file)),
                    len: Some(len),
                })
            }
            Self::Buffer(bytes) => Ok(OpenedSource::Reader {
                len: Some(bytes.len() as u64),
                reader: Box::new(&bytes[..]),
            }),
            Self::Stream(stream) => match stream.take() {
                Some(reader) => Ok(OpenedSource::Reader { reader, len: None }),
                None => Err(io::Error::other(format!(
                    "{name}: stream source was consumed by an earlier save"
                ))),
            },
            Self::WriteCallback(callback) => Ok(OpenedSource::Callback(callback)),
            Self::OpenClose { open, close } => {
                let reader = open(name)?;
                Ok(OpenedSource::Guarded(CloseGuard::new(name, close, reader)))
            }
        }
    }
}

/// Runs the close callback of an [`EntrySource::OpenClose`] source.
///
/// The reader is handed back as a `Box<dyn Read + Send>`; the pipeline keeps
/// it in this guard so the callback runs on every exit path.
pub(crate) struct CloseGuard<'a> {
    name: &'a str,
    close: Option<&'a mut CloseCallback>,
    reader: Option<Box<dyn Read + Send>>,
}

impl<'a> CloseGuard<'a> {
    pub(crate) fn new(
        name: &'a str,
        close: &'a mut CloseCallback,
        reader: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            name,
            close: Some(close),
            reader: Some(reader),
        }
    }

    /// Run the callback now and report its result.
    pub(crate) fn close(mut self) -> io::Result<()> {
        match (self.close.take(), self.reader.take()) {
            (Some(close), Some(reader)) => close(self.name, reader),
            _ => Ok(()),
        }
    }
}

impl Read for CloseGuard<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        if let (Some(close), Some(reader)) = (self.close.take(), self.reader.take()) {
            if let Err(err) = close(self.name, reader) {
                tracing::warn!(name = self.name, %err, "close callback failed");
            }
        }
    }
}
