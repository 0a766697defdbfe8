//! Stream adapters composed by the pipelines.
//!
//! Reading: raw bytes -> [`Decryptor`] -> [`Decoder`]. Writing: content ->
//! [`Compressor`] -> [`Encryptor`] -> sink. Each layer is an enum over the
//! variants the format allows, so a chain is one concrete type.

use crate::crypto::{AesReader, AesStrength, AesWriter, ZipCryptoReader, ZipCryptoWriter};
use crate::entry::CompressionMethod;
use crate::parallel::ParallelDeflater;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use oxizip_core::error::{Result, ZipError};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Decrypting layer.
pub(crate) enum Decryptor<R: Read> {
    Plain(R),
    ZipCrypto(ZipCryptoReader<R>),
    Aes {
        reader: AesReader<R>,
        verified: Arc<AtomicBool>,
    },
}

impl<R: Read> Decryptor<R> {
    pub(crate) fn plain(inner: R) -> Self {
        Self::Plain(inner)
    }

    pub(crate) fn zip_crypto(inner: R, password: &[u8], check: u8, name: &str) -> Result<Self> {
        Ok(Self::ZipCrypto(ZipCryptoReader::new(
            inner, password, check, name,
        )?))
    }

    pub(crate) fn aes(
        inner: R,
        strength: AesStrength,
        password: &[u8],
        compressed_size: u64,
        name: &str,
    ) -> Result<Self> {
        let reader = AesReader::new(inner, strength, password, compressed_size, name)?;
        let verified = reader.verified_flag();
        Ok(Self::Aes { reader, verified })
    }

    /// False only for an AES layer whose authentication code has not matched yet.
    pub(crate) fn authenticated(&self) -> bool {
        match self {
            Self::Aes { verified, .. } => verified.load(Ordering::Acquire),
            _ => true,
        }
    }

    pub(crate) fn is_aes(&self) -> bool {
        matches!(self, Self::Aes { .. })
    }
}

impl<R: Read> Read for Decryptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::ZipCrypto(r) => r.read(buf),
            Self::Aes { reader, .. } => reader.read(buf),
        }
    }
}

/// Decompressing layer.
pub(crate) enum Decoder<R: Read> {
    Stored(R),
    Deflate(DeflateDecoder<R>),
}

impl<R: Read> Decoder<R> {
    pub(crate) fn new(inner: R, method: CompressionMethod) -> Result<Self> {
        match method {
            CompressionMethod::Stored => Ok(Self::Stored(inner)),
            CompressionMethod::Deflated => Ok(Self::Deflate(DeflateDecoder::new(inner))),
            CompressionMethod::Unknown(id) => Err(ZipError::UnsupportedMethod { id }),
        }
    }

    pub(crate) fn get_mut(&mut self) -> &mut R {
        match self {
            Self::Stored(r) => r,
            Self::Deflate(d) => d.get_mut(),
        }
    }

    pub(crate) fn get_ref(&self) -> &R {
        match self {
            Self::Stored(r) => r,
            Self::Deflate(d) => d.get_ref(),
        }
    }
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stored(r) => r.read(buf),
            Self::Deflate(d) => d.read(buf),
        }
    }
}

/// Encrypting layer.
pub(crate) enum Encryptor<W: Write> {
    Plain(W),
    ZipCrypto(ZipCryptoWriter<W>),
    Aes(AesWriter<W>),
}

impl<W: Write> Encryptor<W> {
    /// Write any trailer and return the sink.
    pub(crate) fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::ZipCrypto(w) => Ok(w.into_inner()),
            Self::Aes(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for Encryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::ZipCrypto(w) => w.write(buf),
            Self::Aes(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::ZipCrypto(w) => w.flush(),
            Self::Aes(w) => w.flush(),
        }
    }
}

/// Compressing layer.
pub(crate) enum Compressor<W: Write> {
    Stored(W),
    Deflate(DeflateEncoder<W>),
    Parallel(ParallelDeflater<W>),
}

impl<W: Write> Compressor<W> {
    pub(crate) fn deflate(inner: W, level: u32) -> Self {
        Self::Deflate(DeflateEncoder::new(inner, Compression::new(level.min(9))))
    }

    /// Finish the stream and return the inner writer.
    pub(crate) fn finish(self) -> io::Result<W> {
        match self {
            Self::Stored(w) => Ok(w),
            Self::Deflate(e) => e.finish(),
            Self::Parallel(p) => p.finish(),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stored(w) => w.write(buf),
            Self::Deflate(e) => e.write(buf),
            Self::Parallel(p) => p.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stored(w) => w.flush(),
            Self::Deflate(e) => e.flush(),
            Self::Parallel(p) => p.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_layers_pair_up() {
        let text = b"abcabcabcabcabcabcabcabcabcabc".repeat(50);
        let mut compressor = Compressor::deflate(Vec::new(), 9);
        compressor.write_all(&text).expect("write");
        let packed = compressor.finish().expect("finish");
        assert!(packed.len() < text.len());

        let mut decoder =
            Decoder::new(Decryptor::plain(&packed[..]), CompressionMethod::Deflated).expect("decoder");
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).expect("read");
        assert_eq!(out, text);
        assert!(decoder.get_ref().authenticated());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let result = Decoder::new(&b""[..], CompressionMethod::Unknown(14));
        assert!(matches!(result, Err(ZipError::UnsupportedMethod { id: 14 })));
    }

    #[test]
    fn test_aes_layers_pair_up() {
        let strength = AesStrength::Aes128;
        let mut encryptor = Encryptor::Aes(AesWriter::new(Vec::new(), strength, b"pw").expect("aes"));
        encryptor.write_all(b"hello aes").expect("write");
        let sealed = encryptor.finish().expect("finish");

        let mut decryptor =
            Decryptor::aes(&sealed[..], strength, b"pw", sealed.len() as u64, "e").expect("open");
        assert!(decryptor.is_aes());
        let mut out = Vec::new();
        decryptor.read_to_end(&mut out).expect("read");
        assert_eq!(out, b"hello aes");
        assert!(decryptor.authenticated());
    }
}
