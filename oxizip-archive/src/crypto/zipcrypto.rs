//! Traditional PKWARE encryption ("ZipCrypto").
//!
//! **Security Warning**: this cipher is weak and broken by known-plaintext
//! attacks. It exists for compatibility; prefer WinZip AES for new archives.
//!
//! The cipher keeps three 32-bit keys seeded from the password. Each entry's
//! data is preceded by a 12-byte header: 11 random bytes and one check byte,
//! all encrypted. The check byte is the high byte of the entry CRC, or of the
//! DOS modification time when the entry uses a data descriptor, and lets a
//! reader reject most wrong passwords before touching the data.
//!
//! ## Example
//!
//! ```rust
//! use oxizip_archive::crypto::ZipCrypto;
//!
//! let mut cipher = ZipCrypto::new(b"mypassword");
//! let mut data = b"Hello, World!".to_vec();
//! cipher.encrypt_buffer(&mut data);
//!
//! let mut cipher = ZipCrypto::new(b"mypassword");
//! cipher.decrypt_buffer(&mut data);
//! assert_eq!(&data, b"Hello, World!");
//! ```

use oxizip_core::error::{Result, ZipError};
use rand::RngCore;
use std::io::{self, Read, Write};

/// CRC-32 table for the key schedule (polynomial 0xEDB88320, reflected).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

const INITIAL_KEY0: u32 = 0x12345678;
const INITIAL_KEY1: u32 = 0x23456789;
const INITIAL_KEY2: u32 = 0x34567890;

/// Size of the encryption header in bytes.
pub const ENCRYPTION_HEADER_SIZE: usize = 12;

#[inline]
fn crc32_update(crc: u32, byte: u8) -> u32 {
    CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8)
}

/// ZipCrypto key state.
#[derive(Debug, Clone)]
pub struct ZipCrypto {
    key0: u32,
    key1: u32,
    key2: u32,
}

impl Default for ZipCrypto {
    fn default() -> Self {
        Self {
            key0: INITIAL_KEY0,
            key1: INITIAL_KEY1,
            key2: INITIAL_KEY2,
        }
    }
}

impl ZipCrypto {
    /// Initialize the keys from a password.
    #[must_use]
    pub fn new(password: &[u8]) -> Self {
        let mut cipher = Self::default();
        for &byte in password {
            cipher.update_keys(byte);
        }
        cipher
    }

    #[inline]
    fn update_keys(&mut self, byte: u8) {
        self.key0 = crc32_update(self.key0, byte);
        self.key1 = self
            .key1
            .wrapping_add(self.key0 & 0xFF)
            .wrapping_mul(134775813)
            .wrapping_add(1);
        self.key2 = crc32_update(self.key2, (self.key1 >> 24) as u8);
    }

    #[inline]
    fn stream_byte(&self) -> u8 {
        let temp = (self.key2 | 2) as u16;
        (temp.wrapping_mul(temp ^ 1) >> 8) as u8
    }

    /// Encrypt one byte.
    #[inline]
    pub fn encrypt_byte(&mut self, byte: u8) -> u8 {
        let out = byte ^ self.stream_byte();
        self.update_keys(byte);
        out
    }

    /// Decrypt one byte.
    #[inline]
    pub fn decrypt_byte(&mut self, byte: u8) -> u8 {
        let plain = byte ^ self.stream_byte();
        self.update_keys(plain);
        plain
    }

    /// Encrypt a buffer in place.
    pub fn encrypt_buffer(&mut self, buffer: &mut [u8]) {
        for byte in buffer.iter_mut() {
            *byte = self.encrypt_byte(*byte);
        }
    }

    /// Decrypt a buffer in place.
    pub fn decrypt_buffer(&mut self, buffer: &mut [u8]) {
        for byte in buffer.iter_mut() {
            *byte = self.decrypt_byte(*byte);
        }
    }

    /// Build the encrypted 12-byte header from 11 random bytes and a check byte.
    pub fn encrypt_header(
        &mut self,
        random: &[u8; ENCRYPTION_HEADER_SIZE - 1],
        check_byte: u8,
    ) -> [u8; ENCRYPTION_HEADER_SIZE] {
        let mut header = [0u8; ENCRYPTION_HEADER_SIZE];
        header[..ENCRYPTION_HEADER_SIZE - 1].copy_from_slice(random);
        header[ENCRYPTION_HEADER_SIZE - 1] = check_byte;
        self.encrypt_buffer(&mut header);
        header
    }

    /// Decrypt a header and return its check byte.
    pub fn decrypt_header(&mut self, mut header: [u8; ENCRYPTION_HEADER_SIZE]) -> u8 {
        self.decrypt_buffer(&mut header);
        header[ENCRYPTION_HEADER_SIZE - 1]
    }
}

/// Check byte for an entry: CRC high byte, or DOS time high byte with a data descriptor.
pub fn check_byte(crc32: u32, dos_time: u16, uses_data_descriptor: bool) -> u8 {
    if uses_data_descriptor {
        (dos_time >> 8) as u8
    } else {
        (crc32 >> 24) as u8
    }
}

/// A decrypting reader.
pub struct ZipCryptoReader<R> {
    inner: R,
    cipher: ZipCrypto,
}

impl<R: Read> ZipCryptoReader<R> {
    /// Consume and verify the 12-byte header.
    ///
    /// A check byte mismatch is reported as [`ZipError::BadPassword`] for `name`.
    pub fn new(mut inner: R, password: &[u8], expected_check: u8, name: &str) -> Result<Self> {
        let mut header = [0u8; ENCRYPTION_HEADER_SIZE];
        inner
            .read_exact(&mut header)
            .map_err(|e| ZipError::from_read(e, 0, ENCRYPTION_HEADER_SIZE as u64))?;

        let mut cipher = ZipCrypto::new(password);
        if cipher.decrypt_header(header) != expected_check {
            return Err(ZipError::bad_password(name));
        }
        Ok(Self { inner, cipher })
    }

    /// Unwrap, returning the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ZipCryptoReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.decrypt_buffer(&mut buf[..n]);
        Ok(n)
    }
}

/// An encrypting writer. The header is written on construction.
pub struct ZipCryptoWriter<W: Write> {
    inner: W,
    cipher: ZipCrypto,
    scratch: Vec<u8>,
}

impl<W: Write> ZipCryptoWriter<W> {
    /// Write a fresh random header and return the writer.
    pub fn new(mut inner: W, password: &[u8], check_byte: u8) -> io::Result<Self> {
        let mut random = [0u8; ENCRYPTION_HEADER_SIZE - 1];
        rand::thread_rng().fill_bytes(&mut random);

        let mut cipher = ZipCrypto::new(password);
        let header = cipher.encrypt_header(&random, check_byte);
        inner.write_all(&header)?;

        Ok(Self {
            inner,
            cipher,
            scratch: Vec::new(),
        })
    }

    /// Unwrap, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ZipCryptoWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.encrypt_buffer(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
