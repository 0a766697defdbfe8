//! Little-endian binary primitives.
//!
//! ZIP stores every integer little-endian. Records are usually read into a
//! fixed-size buffer first and decoded with the slice accessors ([`le_u16`],
//! [`le_u32`], [`le_u64`]); records being built are appended to a `Vec<u8>`
//! with the `put_*` functions so they can be measured before they are written.

use crate::error::{Result, ZipError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, trace};

/// Decode a `u16` at `at`.
///
/// # Panics
///
/// Panics if `buf` is shorter than `at + 2`.
#[inline]
pub fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

/// Decode a `u32` at `at`.
#[inline]
pub fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decode a `u64` at `at`.
#[inline]
pub fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Append a `u16`.
#[inline]
pub fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u32`.
#[inline]
pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u64`.
#[inline]
pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Overwrite a `u16` in place.
#[inline]
pub fn set_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite a `u32` in place.
#[inline]
pub fn set_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite a `u64` in place.
#[inline]
pub fn set_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a `u16` from a stream.
pub fn read_u16<R: Read + ?Sized>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

/// Read a `u32` from a stream.
pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a `u64` from a stream.
pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Write a `u16` to a stream.
pub fn write_u16<W: Write + ?Sized>(writer: &mut W, value: u16) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Write a `u32` to a stream.
pub fn write_u32<W: Write + ?Sized>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Write a `u64` to a stream.
pub fn write_u64<W: Write + ?Sized>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Read exactly `buf.len()` bytes starting at `offset`.
///
/// A short read is reported as [`ZipError::Truncated`] carrying the offset.
pub fn read_exact_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader
        .read_exact(buf)
        .map_err(|e| ZipError::from_read(e, offset, buf.len() as u64))
}

/// Read `len` bytes into a fresh vector, reporting truncation at `offset`.
pub fn read_vec<R: Read + ?Sized>(reader: &mut R, len: usize, offset: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|e| ZipError::from_read(e, offset, len as u64))?;
    Ok(buf)
}

/// Scan backward from the end of the stream for a four-byte signature.
///
/// The search starts with the last `initial_window` bytes and doubles the
/// window until the signature is found, the window reaches `max_window`, or
/// the start of the stream is reached. The last occurrence wins. Returns the
/// absolute offset of the signature, or `None`.
pub fn find_signature_backward<R: Read + Seek + ?Sized>(
    reader: &mut R,
    signature: u32,
    initial_window: u64,
    max_window: u64,
) -> Result<Option<u64>> {
    let len = reader.seek(SeekFrom::End(0))?;
    let needle = signature.to_le_bytes();
    let mut window = initial_window.max(4).min(max_window.max(4));

    loop {
        let start = len.saturating_sub(window);
        let mut buf = vec![0u8; (len - start) as usize];
        read_exact_at(reader, start, &mut buf)?;
        trace!(start, window, "scanning for signature {signature:#010x}");

        if let Some(pos) = buf.windows(4).rposition(|w| w == needle) {
            let found = start + pos as u64;
            debug!(offset = found, "signature {signature:#010x} found");
            return Ok(Some(found));
        }

        if start == 0 || window >= max_window {
            return Ok(None);
        }
        window = (window * 2).min(max_window);
    }
}

/// Scan forward from the current position for the next of several signatures.
///
/// Returns the absolute offset and which signature matched. The stream is left
/// positioned at the signature.
pub fn find_next_signature<R: Read + Seek + ?Sized>(
    reader: &mut R,
    signatures: &[u32],
) -> Result<Option<(u64, u32)>> {
    let mut pos = reader.stream_position()?;
    let mut chunk = vec![0u8; 64 * 1024];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        let base = pos - carry.len() as u64;
        carry.extend_from_slice(&chunk[..n]);
        for (i, w) in carry.windows(4).enumerate() {
            let value = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            if signatures.contains(&value) {
                let at = base + i as u64;
                reader.seek(SeekFrom::Start(at))?;
                return Ok(Some((at, value)));
            }
        }
        pos += n as u64;
        let keep = carry.len().min(3);
        carry.drain(..carry.len() - keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_slice_accessors() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 0xBEEF);
        put_u32(&mut buf, 0x0403_4B50);
        put_u64(&mut buf, 0x0102_0304_0506_0708);
        assert_eq!(buf.len(), 14);
        assert_eq!(&buf[2..6], b"PK\x03\x04");
        assert_eq!(le_u16(&buf, 0), 0xBEEF);
        assert_eq!(le_u32(&buf, 2), 0x0403_4B50);
        assert_eq!(le_u64(&buf, 6), 0x0102_0304_0506_0708);

        set_u32(&mut buf, 2, 0xFFFF_FFFF);
        assert_eq!(le_u32(&buf, 2), u32::MAX);
    }

    #[test]
    fn test_stream_readers() {
        let mut cur = Cursor::new(vec![0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(read_u16(&mut cur).ok(), Some(0x1234));
        assert_eq!(read_u32(&mut cur).ok(), Some(0x1234_5678));
        assert!(read_u16(&mut cur).is_err());
    }

    #[test]
    fn test_read_exact_at_reports_truncation() {
        let mut cur = Cursor::new(vec![0u8; 10]);
        let mut buf = [0u8; 8];
        let err = read_exact_at(&mut cur, 6, &mut buf);
        assert!(matches!(
            err,
            Err(ZipError::Truncated {
                offset: 6,
                needed: 8
            })
        ));
    }

    #[test]
    fn test_find_signature_backward_grows_window() {
        let mut data = vec![0u8; 40_000];
        data[100..104].copy_from_slice(&0x0605_4B50u32.to_le_bytes());
        let mut cur = Cursor::new(data);

        let found = find_signature_backward(&mut cur, 0x0605_4B50, 1024, 65_536 + 22);
        assert_eq!(found.ok().flatten(), Some(100));

        let found = find_signature_backward(&mut cur, 0x0605_4B50, 1024, 2048);
        assert_eq!(found.ok().flatten(), None);
    }

    #[test]
    fn test_find_signature_backward_prefers_last() {
        let mut data = vec![0u8; 64];
        data[4..8].copy_from_slice(b"PK\x05\x06");
        data[40..44].copy_from_slice(b"PK\x05\x06");
        let mut cur = Cursor::new(data);
        let found = find_signature_backward(&mut cur, 0x0605_4B50, 16, 1024);
        assert_eq!(found.ok().flatten(), Some(40));
    }

    #[test]
    fn test_find_next_signature_across_chunk_boundary() {
        let mut data = vec![0u8; 64 * 1024 + 10];
        let at = 64 * 1024 - 2;
        data[at..at + 4].copy_from_slice(b"PK\x01\x02");
        let mut cur = Cursor::new(data);
        let found = find_next_signature(&mut cur, &[0x0201_4B50, 0x0403_4B50]);
        assert_eq!(found.ok().flatten(), Some((at as u64, 0x0201_4B50)));
        assert_eq!(cur.position(), at as u64);
    }
}
