//! WinZip AES encryption (AE-1 / AE-2).
//!
//! Layout of an encrypted entry's data:
//!
//! ```text
//! ┌──────────┬────────────┬────────────────────┬───────────┐
//! │ salt     │ verifier   │ AES-CTR ciphertext │ auth code │
//! │ 8/12/16  │ 2 bytes    │ ...                │ 10 bytes  │
//! └──────────┴────────────┴────────────────────┴───────────┘
//! ```
//!
//! Keys come from PBKDF2-HMAC-SHA1 (1000 iterations) over the password and
//! salt: cipher key, MAC key, then the two verifier bytes. The counter is a
//! little-endian 128-bit integer starting at 1, unlike NIST CTR. The
//! authentication code is HMAC-SHA1 over the ciphertext, truncated to 10
//! bytes.

use aes::cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use oxizip_core::error::{Result, ZipError};
use rand::RngCore;
use sha1::Sha1;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type HmacSha1 = Hmac<Sha1>;

/// Length of the password verification value.
pub const PASSWORD_VERIFIER_LEN: usize = 2;

/// Length of the truncated HMAC-SHA1 authentication code.
pub const AUTH_CODE_LEN: usize = 10;

/// PBKDF2 iteration count fixed by the WinZip format.
pub const PBKDF2_ITERATIONS: u32 = 1000;

const BLOCK_LEN: usize = 16;

/// AES key strength, as encoded in the 0x9901 extra field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AesStrength {
    /// AES-128.
    Aes128 = 1,
    /// AES-192.
    Aes192 = 2,
    /// AES-256.
    Aes256 = 3,
}

impl AesStrength {
    /// Decode the extra-field byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Aes128),
            2 => Some(Self::Aes192),
            3 => Some(Self::Aes256),
            _ => None,
        }
    }

    /// Salt length in bytes.
    pub fn salt_len(self) -> usize {
        match self {
            Self::Aes128 => 8,
            Self::Aes192 => 12,
            Self::Aes256 => 16,
        }
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Bytes added around the ciphertext: salt, verifier and auth code.
    pub fn overhead(self) -> u64 {
        (self.salt_len() + PASSWORD_VERIFIER_LEN + AUTH_CODE_LEN) as u64
    }
}

struct DerivedKeys {
    cipher_key: Vec<u8>,
    mac_key: Vec<u8>,
    verifier: [u8; PASSWORD_VERIFIER_LEN],
}

fn derive_keys(password: &[u8], salt: &[u8], strength: AesStrength) -> DerivedKeys {
    let key_len = strength.key_len();
    let mut derived = vec![0u8; 2 * key_len + PASSWORD_VERIFIER_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, PBKDF2_ITERATIONS, &mut derived);

    DerivedKeys {
        cipher_key: derived[..key_len].to_vec(),
        mac_key: derived[key_len..2 * key_len].to_vec(),
        verifier: [derived[2 * key_len], derived[2 * key_len + 1]],
    }
}

fn invalid_key() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "invalid AES key length")
}

enum BlockCipher {
    Aes128(aes::Aes128),
    Aes192(aes::Aes192),
    Aes256(aes::Aes256),
}

impl BlockCipher {
    fn new(key: &[u8]) -> io::Result<Self> {
        Ok(match key.len() {
            16 => Self::Aes128(aes::Aes128::new_from_slice(key).map_err(|_| invalid_key())?),
            24 => Self::Aes192(aes::Aes192::new_from_slice(key).map_err(|_| invalid_key())?),
            32 => Self::Aes256(aes::Aes256::new_from_slice(key).map_err(|_| invalid_key())?),
            _ => return Err(invalid_key()),
        })
    }

    fn encrypt_block(&self, block: &mut aes::Block) {
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }
}

/// The WinZip flavour of AES-CTR.
pub struct AesCtr {
    cipher: BlockCipher,
    counter: u128,
    keystream: [u8; BLOCK_LEN],
    used: usize,
}

impl AesCtr {
    /// Key a new keystream. The key length selects AES-128/192/256.
    pub fn new(key: &[u8]) -> io::Result<Self> {
        Ok(Self {
            cipher: BlockCipher::new(key)?,
            counter: 1,
            keystream: [0u8; BLOCK_LEN],
            used: BLOCK_LEN,
        })
    }

    /// XOR the keystream into `data`. Encryption and decryption are the same.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.used == BLOCK_LEN {
                let mut block = aes::Block::from(self.counter.to_le_bytes());
                self.cipher.encrypt_block(&mut block);
                self.keystream.copy_from_slice(&block);
                self.counter = self.counter.wrapping_add(1);
                self.used = 0;
            }
            *byte ^= self.keystream[self.used];
            self.used += 1;
        }
    }
}

/// A decrypting reader over exactly one entry's AES data.
///
/// The inner reader must be positioned at the salt. The authentication code
/// is read and checked as soon as the last ciphertext byte has been
/// consumed; a mismatch surfaces as an I/O error wrapping
/// [`ZipError::MacMismatch`].
pub struct AesReader<R> {
    inner: R,
    ctr: AesCtr,
    mac: HmacSha1,
    remaining: u64,
    name: String,
    verified: Arc<AtomicBool>,
}

impl<R: Read> AesReader<R> {
    /// Read the salt and verifier, derive keys and check the password.
    ///
    /// `compressed_size` is the full stored size including salt, verifier
    /// and auth code.
    pub fn new(
        mut inner: R,
        strength: AesStrength,
        password: &[u8],
        compressed_size: u64,
        name: &str,
    ) -> Result<Self> {
        if compressed_size < strength.overhead() {
            return Err(ZipError::format(
                0,
                format!("{name}: AES entry shorter than its header"),
            ));
        }

        let mut salt = vec![0u8; strength.salt_len()];
        inner
            .read_exact(&mut salt)
            .map_err(|e| ZipError::from_read(e, 0, salt.len() as u64))?;
        let mut verifier = [0u8; PASSWORD_VERIFIER_LEN];
        inner
            .read_exact(&mut verifier)
            .map_err(|e| ZipError::from_read(e, 0, PASSWORD_VERIFIER_LEN as u64))?;

        let keys = derive_keys(password, &salt, strength);
        if keys.verifier != verifier {
            return Err(ZipError::bad_password(name));
        }

        let mac = <HmacSha1 as Mac>::new_from_slice(&keys.mac_key).map_err(|_| invalid_key())?;
        let mut reader = Self {
            inner,
            ctr: AesCtr::new(&keys.cipher_key)?,
            mac,
            remaining: compressed_size - strength.overhead(),
            name: name.to_string(),
            verified: Arc::new(AtomicBool::new(false)),
        };
        if reader.remaining == 0 {
            reader.verify().map_err(ZipError::from_io)?;
        }
        Ok(reader)
    }

    /// Flag that turns true once the authentication code has matched.
    pub fn verified_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.verified)
    }

    fn verify(&mut self) -> io::Result<()> {
        let mut code = [0u8; AUTH_CODE_LEN];
        self.inner.read_exact(&mut code)?;
        self.mac
            .clone()
            .verify_truncated_left(&code)
            .map_err(|_| io::Error::from(ZipError::mac_mismatch(&self.name)))?;
        self.verified.store(true, Ordering::Release);
        Ok(())
    }
}

impl<R: Read> Read for AesReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "AES entry data ended early",
            ));
        }
        self.mac.update(&buf[..n]);
        self.ctr.apply(&mut buf[..n]);
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.verify()?;
        }
        Ok(n)
    }
}

/// An encrypting writer. Salt and verifier are written on construction;
/// [`finish`](Self::finish) appends the authentication code.
pub struct AesWriter<W: Write> {
    inner: W,
    ctr: AesCtr,
    mac: HmacSha1,
    scratch: Vec<u8>,
}

impl<W: Write> AesWriter<W> {
    /// Generate a salt, derive keys and write the header.
    pub fn new(mut inner: W, strength: AesStrength, password: &[u8]) -> io::Result<Self> {
        let mut salt = vec![0u8; strength.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        let keys = derive_keys(password, &salt, strength);

        inner.write_all(&salt)?;
        inner.write_all(&keys.verifier)?;

        Ok(Self {
            inner,
            ctr: AesCtr::new(&keys.cipher_key)?,
            mac: <HmacSha1 as Mac>::new_from_slice(&keys.mac_key).map_err(|_| invalid_key())?,
            scratch: Vec::new(),
        })
    }

    /// Write the authentication code and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let code = self.mac.finalize().into_bytes();
        self.inner.write_all(&code[..AUTH_CODE_LEN])?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for AesWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.ctr.apply(&mut self.scratch);
        self.mac.update(&self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ctr_little_endian_counter() {
        // WinZip AES-256 test vector: "asdf\n" under a fixed derived key.
        let key = [
            0xd1, 0x51, 0xa6, 0xab, 0x53, 0x68, 0xd7, 0xb7, 0xbf, 0x49, 0xf7, 0xf5, 0x8a, 0x4e,
            0x10, 0x36, 0x25, 0x1c, 0x13, 0xba, 0x12, 0x45, 0x37, 0x65, 0xa9, 0xe4, 0xed, 0x9f,
            0x4a, 0xa8, 0xda, 0x3b,
        ];
        let mut data = [0xdc, 0x99, 0x93, 0x5e, 0xbf];
        AesCtr::new(&key).expect("key").apply(&mut data);
        assert_eq!(&data, b"asdf\n");
    }

    #[test]
    fn test_strength_sizes() {
        assert_eq!(AesStrength::Aes128.salt_len(), 8);
        assert_eq!(AesStrength::Aes192.salt_len(), 12);
        assert_eq!(AesStrength::Aes256.salt_len(), 16);
        assert_eq!(AesStrength::Aes256.overhead(), 28);
        assert_eq!(AesStrength::from_u8(2), Some(AesStrength::Aes192));
        assert_eq!(AesStrength::from_u8(4), None);
    }

    fn encrypt(strength: AesStrength, password: &[u8], plain: &[u8]) -> Vec<u8> {
        let mut writer = AesWriter::new(Vec::new(), strength, password).expect("writer");
        writer.write_all(plain).expect("write");
        writer.finish().expect("finish")
    }

    #[test]
    fn test_round_trip_every_strength() {
        let plain: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        for strength in [AesStrength::Aes128, AesStrength::Aes192, AesStrength::Aes256] {
            let encrypted = encrypt(strength, b"hunter2", &plain);
            assert_eq!(encrypted.len() as u64, plain.len() as u64 + strength.overhead());

            let mut reader = AesReader::new(
                Cursor::new(&encrypted),
                strength,
                b"hunter2",
                encrypted.len() as u64,
                "x",
            )
            .expect("verifier");
            let flag = reader.verified_flag();
            let mut out = Vec::new();
            reader.read_to_end(&mut out).expect("read");
            assert_eq!(out, plain);
            assert!(flag.load(Ordering::Acquire));
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails_mac() {
        let mut encrypted = encrypt(AesStrength::Aes128, b"pw", b"some content here");
        let idx = AesStrength::Aes128.salt_len() + PASSWORD_VERIFIER_LEN + 3;
        encrypted[idx] ^= 0x01;

        let mut reader = AesReader::new(
            Cursor::new(&encrypted),
            AesStrength::Aes128,
            b"pw",
            encrypted.len() as u64,
            "t.txt",
        )
        .expect("verifier still matches");
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).expect_err("mac must fail");
        assert!(matches!(
            ZipError::from_io(err),
            ZipError::MacMismatch { .. }
        ));
    }

    #[test]
    fn test_wrong_password_rejected_before_data() {
        let encrypted = encrypt(AesStrength::Aes256, b"right", b"data");
        let result = AesReader::new(
            Cursor::new(&encrypted),
            AesStrength::Aes256,
            b"wrong",
            encrypted.len() as u64,
            "d",
        );
        // The 16-bit verifier lets 1 in 65536 wrong passwords through.
        assert!(matches!(result, Err(ZipError::BadPassword { .. })));
    }

    #[test]
    fn test_empty_payload_verifies_immediately() {
        let encrypted = encrypt(AesStrength::Aes256, b"pw", b"");
        let reader = AesReader::new(
            Cursor::new(&encrypted),
            AesStrength::Aes256,
            b"pw",
            encrypted.len() as u64,
            "e",
        )
        .expect("empty entry");
        assert!(reader.verified_flag().load(Ordering::Acquire));
    }
}
