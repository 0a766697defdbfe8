//! Text encoding of entry names and comments.
//!
//! ZIP predates Unicode: names are bytes in IBM code page 437 unless
//! general-purpose bit 11 says UTF-8. `encoding_rs` covers the WHATWG
//! encodings but not CP437, so the upper half of that code page is a table
//! here and the alternate encoding is any `encoding_rs::Encoding`.
//!
//! The write policy is decided per string: the name and the comment of the
//! same entry may end up in different encodings.

use encoding_rs::{Encoding, UTF_8};

/// When to use the alternate encoding instead of CP437.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlternateEncodingUsage {
    /// Always CP437; unmappable characters become `?`.
    Never,
    /// Always the alternate encoding.
    Always,
    /// CP437 when it round-trips the exact string, otherwise the alternate.
    #[default]
    AsNecessary,
}

/// Bytes produced for one string, and whether they are UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedText {
    /// Encoded bytes.
    pub bytes: Vec<u8>,
    /// True when the chosen encoding is UTF-8 (sets flag bit 11 for names).
    pub utf8: bool,
}

/// Encoding configuration of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEncoding {
    /// Encoding used when the policy calls for the alternate.
    pub alternate: &'static Encoding,
    /// The policy.
    pub usage: AlternateEncodingUsage,
}

impl Default for TextEncoding {
    fn default() -> Self {
        Self {
            alternate: UTF_8,
            usage: AlternateEncodingUsage::default(),
        }
    }
}

impl TextEncoding {
    /// CP437 only.
    pub const CP437_ONLY: TextEncoding = TextEncoding {
        alternate: UTF_8,
        usage: AlternateEncodingUsage::Never,
    };

    /// Create a configuration.
    pub fn new(alternate: &'static Encoding, usage: AlternateEncodingUsage) -> Self {
        Self { alternate, usage }
    }

    /// Encode one string according to the policy.
    pub fn encode(&self, text: &str) -> EncodedText {
        match self.usage {
            AlternateEncodingUsage::Never => EncodedText {
                bytes: cp437_encode_lossy(text),
                utf8: false,
            },
            AlternateEncodingUsage::Always => self.encode_alternate(text),
            AlternateEncodingUsage::AsNecessary => {
                let bytes = cp437_encode_lossy(text);
                if cp437_decode(&bytes) == text {
                    EncodedText { bytes, utf8: false }
                } else {
                    self.encode_alternate(text)
                }
            }
        }
    }

    fn encode_alternate(&self, text: &str) -> EncodedText {
        let (bytes, used, _) = self.alternate.encode(text);
        EncodedText {
            bytes: bytes.into_owned(),
            utf8: used == UTF_8,
        }
    }

    /// Decode an entry name (or entry comment) read from a header.
    pub fn decode_name(&self, bytes: &[u8], utf8_flag: bool) -> String {
        if utf8_flag {
            return String::from_utf8_lossy(bytes).into_owned();
        }
        match self.usage {
            AlternateEncodingUsage::Always => self.decode_alternate(bytes),
            _ => cp437_decode(bytes),
        }
    }

    /// Decode the archive comment.
    ///
    /// Uses the alternate encoding whenever one is in play, otherwise CP437.
    /// Writing decides per string, so this is not the inverse of [`encode`](Self::encode).
    pub fn decode_archive_comment(&self, bytes: &[u8]) -> String {
        match self.usage {
            AlternateEncodingUsage::Never => cp437_decode(bytes),
            _ => self.decode_alternate(bytes),
        }
    }

    fn decode_alternate(&self, bytes: &[u8]) -> String {
        self.alternate
            .decode_without_bom_handling(bytes)
            .0
            .into_owned()
    }
}

/// CP437 0x80..=0xFF.
const CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{00A0}',
];

/// Decode CP437 bytes. Every byte maps, so this never fails.
pub fn cp437_decode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                CP437_HIGH[(b - 0x80) as usize]
            }
        })
        .collect()
}

/// Encode to CP437, replacing unmappable characters with `?`.
pub fn cp437_encode_lossy(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| {
            if c.is_ascii() {
                c as u8
            } else {
                CP437_HIGH
                    .iter()
                    .position(|&h| h == c)
                    .map_or(b'?', |i| 0x80 + i as u8)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::SHIFT_JIS;

    #[test]
    fn test_cp437_bijective_over_all_bytes() {
        let all: Vec<u8> = (0..=255u8).collect();
        let text = cp437_decode(&all);
        assert_eq!(cp437_encode_lossy(&text), all);
    }

    #[test]
    fn test_cp437_known_chars() {
        assert_eq!(cp437_encode_lossy("café"), b"caf\x82");
        assert_eq!(cp437_decode(b"\x9c5"), "£5");
        assert_eq!(cp437_encode_lossy("日本"), b"??");
    }

    #[test]
    fn test_as_necessary_is_per_string() {
        let enc = TextEncoding::default();
        let ascii = enc.encode("docs/readme.txt");
        assert_eq!(ascii.bytes, b"docs/readme.txt");
        assert!(!ascii.utf8);

        let accented = enc.encode("résumé.txt");
        assert!(!accented.utf8);
        assert_eq!(accented.bytes, b"r\x82sum\x82.txt");

        let cjk = enc.encode("日本語.txt");
        assert!(cjk.utf8);
        assert_eq!(cjk.bytes, "日本語.txt".as_bytes());
    }

    #[test]
    fn test_never_is_lossy() {
        let enc = TextEncoding::CP437_ONLY;
        let out = enc.encode("日本.txt");
        assert_eq!(out.bytes, b"??.txt");
        assert!(!out.utf8);
    }

    #[test]
    fn test_always_uses_alternate() {
        let enc = TextEncoding::new(SHIFT_JIS, AlternateEncodingUsage::Always);
        let out = enc.encode("日本");
        assert!(!out.utf8);
        assert_eq!(enc.decode_name(&out.bytes, false), "日本");
    }

    #[test]
    fn test_decode_name_honors_utf8_flag() {
        let enc = TextEncoding::CP437_ONLY;
        assert_eq!(enc.decode_name("ü".as_bytes(), true), "ü");
        assert_eq!(enc.decode_name(b"\x81", false), "ü");
    }

    #[test]
    fn test_archive_comment_prefers_alternate() {
        let bytes = "コメント".as_bytes();
        let enc = TextEncoding::default();
        assert_eq!(enc.decode_archive_comment(bytes), "コメント");
        // Names without the flag stay CP437 under the same policy.
        assert_ne!(enc.decode_name(bytes, false), "コメント");

        let legacy = TextEncoding::CP437_ONLY;
        assert_eq!(legacy.decode_archive_comment(b"\x82"), "é");
    }
}
