//! CRC-32 (ISO 3309) as used by ZIP.
//!
//! [`Crc32`] is an incremental checksum that also counts the bytes fed to it.
//! [`CrcReader`] and [`CrcWriter`] sit in a stream chain and checksum whatever
//! passes through them, which is how both the extraction and the save
//! pipelines compute CRCs over the uncompressed bytes without buffering.

use std::io::{self, Read, Write};

/// Incremental CRC-32 with a byte counter.
#[derive(Debug, Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
    bytes: u64,
}

impl Crc32 {
    /// Create a new CRC-32 calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the calculator to its initial state.
    pub fn reset(&mut self) {
        self.hasher.reset();
        self.bytes = 0;
    }

    /// Feed more data.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Current CRC value without consuming the calculator.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the CRC value.
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }

    /// One-shot CRC of a slice.
    pub fn compute(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }
}

/// A reader that checksums every byte read through it.
#[derive(Debug)]
pub struct CrcReader<R> {
    inner: R,
    crc: Crc32,
}

impl<R: Read> CrcReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }

    /// CRC of the bytes read so far.
    pub fn crc(&self) -> u32 {
        self.crc.value()
    }

    /// Number of bytes read so far.
    pub fn bytes(&self) -> u64 {
        self.crc.bytes()
    }

    /// Borrow the wrapped reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the wrapped reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unwrap, returning the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }
}

/// A writer that checksums every byte written through it.
#[derive(Debug)]
pub struct CrcWriter<W> {
    inner: W,
    crc: Crc32,
}

impl<W: Write> CrcWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }

    /// CRC of the bytes written so far.
    pub fn crc(&self) -> u32 {
        self.crc.value()
    }

    /// Number of bytes written so far.
    pub fn bytes(&self) -> u64 {
        self.crc.bytes()
    }

    /// Mutably borrow the wrapped writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
