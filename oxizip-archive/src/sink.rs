//! Output sinks for the save pipeline.
//!
//! A sink is a `Write` that also knows where the next byte lands (disk and
//! offset), whether it can go back to patch a header, and how to keep a block
//! of bytes together on one disk.

use std::io::{self, Seek, SeekFrom, Write};

/// Where a byte lands: disk number and offset within that disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    /// Disk (volume) number, 0-based.
    pub disk: u32,
    /// Offset within the disk.
    pub offset: u64,
}

/// A restore point taken before an entry is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkMark {
    /// Logical position.
    pub position: u64,
    /// Placement at that position.
    pub placement: Placement,
}

/// Destination of a save.
pub trait OutputSink: Write {
    /// Logical bytes written so far, across all disks.
    fn position(&self) -> u64;

    /// True if earlier bytes can be overwritten.
    fn can_seek(&self) -> bool;

    /// Overwrite bytes already written at `at`.
    fn patch(&mut self, at: Placement, bytes: &[u8]) -> io::Result<()>;

    /// Disk the next byte goes to.
    fn current_disk(&self) -> u32;

    /// Where a block of `len` bytes written contiguously would start.
    fn segment_for(&self, len: u64) -> Placement;

    /// Keep the next `len` bytes on one disk, moving to a new disk first if
    /// they do not fit.
    fn begin_contiguous(&mut self, len: u64) -> io::Result<()>;

    /// Leave contiguous mode.
    fn end_contiguous(&mut self);

    /// Take a restore point.
    fn mark(&self) -> SinkMark;

    /// Return to a restore point. `Ok(false)` means the sink cannot go back.
    fn rewind_to(&mut self, mark: SinkMark) -> io::Result<bool>;

    /// Flush everything.
    fn finish(&mut self) -> io::Result<()>;
}

/// A seekable single-disk sink.
pub struct SeekableSink<W: Write + Seek> {
    inner: W,
    pos: u64,
    high_water: u64,
}

impl<W: Write + Seek> SeekableSink<W> {
    /// Wrap a writer; offsets are absolute positions in it.
    pub fn new(mut inner: W) -> io::Result<Self> {
        let pos = inner.stream_position()?;
        Ok(Self {
            inner,
            pos,
            high_water: pos,
        })
    }

    /// Furthest position ever written. Larger than [`OutputSink::position`]
    /// only after a rewind.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Unwrap.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek> Write for SeekableSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        self.high_water = self.high_water.max(self.pos);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Seek> OutputSink for SeekableSink<W> {
    fn position(&self) -> u64 {
        self.pos
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn patch(&mut self, at: Placement, bytes: &[u8]) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(at.offset))?;
        self.inner.write_all(bytes)?;
        self.inner.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    fn current_disk(&self) -> u32 {
        0
    }

    fn segment_for(&self, _len: u64) -> Placement {
        Placement {
            disk: 0,
            offset: self.pos,
        }
    }

    fn begin_contiguous(&mut self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn end_contiguous(&mut self) {}

    fn mark(&self) -> SinkMark {
        SinkMark {
            position: self.pos,
            placement: self.segment_for(0),
        }
    }

    fn rewind_to(&mut self, mark: SinkMark) -> io::Result<bool> {
        self.inner.seek(SeekFrom::Start(mark.position))?;
        self.pos = mark.position;
        Ok(true)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A forward-only sink. Entries get data descriptors.
pub struct StreamingSink<W: Write> {
    inner: W,
    pos: u64,
}

impl<W: Write> StreamingSink<W> {
    /// Wrap a writer; offsets count from the first byte written here.
    pub fn new(inner: W) -> Self {
        Self { inner, pos: 0 }
    }

    /// Unwrap.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for StreamingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> OutputSink for StreamingSink<W> {
    fn position(&self) -> u64 {
        self.pos
    }

    fn can_seek(&self) -> bool {
        false
    }

    fn patch(&mut self, _at: Placement, _bytes: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "cannot patch a forward-only stream",
        ))
    }

    fn current_disk(&self) -> u32 {
        0
    }

    fn segment_for(&self, _len: u64) -> Placement {
        Placement {
            disk: 0,
            offset: self.pos,
        }
    }

    fn begin_contiguous(&mut self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn end_contiguous(&mut self) {}

    fn mark(&self) -> SinkMark {
        SinkMark {
            position: self.pos,
            placement: self.segment_for(0),
        }
    }

    fn rewind_to(&mut self, mark: SinkMark) -> io::Result<bool> {
        Ok(mark.position == self.pos)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `&mut S` is a sink too, so pipelines can borrow one.
impl<S: OutputSink + ?Sized> OutputSink for &mut S {
    fn position(&self) -> u64 {
        (**self).position()
    }
    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }
    fn patch(&mut self, at: Placement, bytes: &[u8]) -> io::Result<()> {
        (**self).patch(at, bytes)
    }
    fn current_disk(&self) -> u32 {
        (**self).current_disk()
    }
    fn segment_for(&self, len: u64) -> Placement {
        (**self).segment_for(len)
    }
    fn begin_contiguous(&mut self, len: u64) -> io::Result<()> {
        (**self).begin_contiguous(len)
    }
    fn end_contiguous(&mut self) {
        (**self).end_contiguous()
    }
    fn mark(&self) -> SinkMark {
        (**self).mark()
    }
    fn rewind_to(&mut self, mark: SinkMark) -> io::Result<bool> {
        (**self).rewind_to(mark)
    }
    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_seekable_patch_and_rewind() {
        let mut sink = SeekableSink::new(Cursor::new(Vec::new())).expect("sink");
        sink.write_all(b"HEADER....").expect("write");
        let mark = sink.mark();
        sink.write_all(b"data").expect("write");
        sink.patch(Placement { disk: 0, offset: 6 }, b"1234").expect("patch");
        assert_eq!(sink.position(), 14);

        assert!(sink.rewind_to(mark).expect("rewind"));
        assert_eq!(sink.position(), 10);
        assert_eq!(sink.high_water(), 14);
        sink.write_all(b"DATA").expect("write");
        assert_eq!(sink.into_inner().into_inner(), b"HEADER1234DATA");
    }

    #[test]
    fn test_seekable_offsets_are_absolute() {
        let mut cursor = Cursor::new(vec![0u8; 5]);
        cursor.set_position(5);
        let sink = SeekableSink::new(cursor).expect("sink");
        assert_eq!(sink.segment_for(10).offset, 5);
    }

    #[test]
    fn test_streaming_rewind_only_in_place() {
        let mut sink = StreamingSink::new(Vec::new());
        let mark = sink.mark();
        assert!(sink.rewind_to(mark).expect("rewind"));
        sink.write_all(b"x").expect("write");
        assert!(!sink.rewind_to(mark).expect("rewind"));
        assert!(!sink.can_seek());
        assert!(sink.patch(Placement::default(), b"y").is_err());
    }
}
