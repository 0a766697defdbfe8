//! Entry ciphers: traditional PKWARE encryption and WinZip AES.

pub mod aes;
pub mod zipcrypto;

pub use aes::{AUTH_CODE_LEN, AesCtr, AesReader, AesStrength, AesWriter, PASSWORD_VERIFIER_LEN};
pub use zipcrypto::{ENCRYPTION_HEADER_SIZE, ZipCrypto, ZipCryptoReader, ZipCryptoWriter};
