//! Split (multi-volume) archives.
//!
//! A split archive `name.zip` is stored as `name.z01`, `name.z02`, ... with
//! the last volume taking the `.zip` name. Offsets in headers are relative
//! to the volume that holds the record, so readers and writers both need to
//! map between `(disk, offset)` and a logical position over all volumes.

use crate::sink::{OutputSink, Placement, SinkMark};
use oxizip_core::error::{Result, ZipError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Smallest accepted volume size.
pub const MIN_SEGMENT_SIZE: u64 = 64 * 1024;

/// Largest accepted volume size; offsets within a volume stay below the
/// ZIP64 threshold.
pub const MAX_SEGMENT_SIZE: u64 = 0xFFFF_FFFE;

/// Check a volume size setting; 0 means unsegmented.
pub fn validate_segment_size(size: u64) -> Result<()> {
    if size == 0 || (MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(ZipError::InvalidSegmentSize { size })
    }
}

/// Path of volume `disk` (0-based) of a split archive whose last volume is `archive`.
pub fn volume_path(archive: &Path, disk: u32) -> PathBuf {
    archive.with_extension(format!("z{:02}", disk + 1))
}

/// Writes volumes of at most `max_size` bytes into a directory.
pub struct SegmentedWriter {
    archive: PathBuf,
    max_size: u64,
    volumes: Vec<PathBuf>,
    lengths: Vec<u64>,
    current: BufWriter<File>,
    disk_offset: u64,
    pos: u64,
    contiguous: bool,
    finished: bool,
}

impl SegmentedWriter {
    /// Start the first volume of `archive` (the final `.zip` path).
    pub fn create(archive: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        if max_size == 0 {
            return Err(ZipError::InvalidSegmentSize { size: 0 });
        }
        validate_segment_size(max_size)?;
        let archive = archive.into();
        let first = volume_path(&archive, 0);
        let current = BufWriter::new(File::create(&first)?);
        Ok(Self {
            archive,
            max_size,
            volumes: vec![first],
            lengths: Vec::new(),
            current,
            disk_offset: 0,
            pos: 0,
            contiguous: false,
            finished: false,
        })
    }

    fn disk(&self) -> u32 {
        (self.volumes.len() - 1) as u32
    }

    fn room(&self) -> u64 {
        self.max_size - self.disk_offset
    }

    fn roll(&mut self) -> io::Result<()> {
        self.current.flush()?;
        self.lengths.push(self.disk_offset);
        let next = volume_path(&self.archive, self.volumes.len() as u32);
        debug!(volume = %next.display(), "starting volume");
        self.current = BufWriter::new(File::create(&next)?);
        self.volumes.push(next);
        self.disk_offset = 0;
        Ok(())
    }

    fn volume_len(&self, disk: usize) -> u64 {
        self.lengths.get(disk).copied().unwrap_or(self.disk_offset)
    }

    /// Paths of all volumes, in disk order. Valid after [`OutputSink::finish`].
    pub fn volumes(&self) -> &[PathBuf] {
        &self.volumes
    }
}

impl Write for SegmentedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.contiguous && self.room() == 0 {
            self.roll()?;
        }
        let n = if self.contiguous {
            buf.len()
        } else {
            buf.len().min(usize::try_from(self.room()).unwrap_or(usize::MAX))
        };
        let n = self.current.write(&buf[..n])?;
        self.disk_offset += n as u64;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.flush()
    }
}

impl OutputSink for SegmentedWriter {
    fn position(&self) -> u64 {
        self.pos
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn patch(&mut self, at: Placement, bytes: &[u8]) -> io::Result<()> {
        let mut disk = at.disk as usize;
        let mut offset = at.offset;
        let mut rest = bytes;
        while !rest.is_empty() {
            if disk >= self.volumes.len() {
                return Err(io::Error::other("patch past the last volume"));
            }
            let avail = self.volume_len(disk).saturating_sub(offset);
            let n = rest.len().min(usize::try_from(avail).unwrap_or(usize::MAX));
            if disk == self.volumes.len() - 1 {
                self.current.seek(SeekFrom::Start(offset))?;
                self.current.write_all(&rest[..n])?;
                self.current.seek(SeekFrom::Start(self.disk_offset))?;
            } else {
                let mut file = OpenOptions::new().write(true).open(&self.volumes[disk])?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&rest[..n])?;
            }
            rest = &rest[n..];
            disk += 1;
            offset = 0;
        }
        Ok(())
    }

    fn current_disk(&self) -> u32 {
        self.disk()
    }

    fn segment_for(&self, len: u64) -> Placement {
        let fits = len <= self.room() || len > self.max_size;
        if fits && self.room() > 0 {
            Placement {
                disk: self.disk(),
                offset: self.disk_offset,
            }
        } else {
            Placement {
                disk: self.disk() + 1,
                offset: 0,
            }
        }
    }

    fn begin_contiguous(&mut self, len: u64) -> io::Result<()> {
        if len > self.max_size {
            debug!(len, max = self.max_size, "block larger than a volume, splitting");
            return Ok(());
        }
        if len > self.room() {
            self.roll()?;
        }
        self.contiguous = true;
        Ok(())
    }

    fn end_contiguous(&mut self) {
        self.contiguous = false;
    }

    fn mark(&self) -> SinkMark {
        SinkMark {
            position: self.pos,
            placement: Placement {
                disk: self.disk(),
                offset: self.disk_offset,
            },
        }
    }

    fn rewind_to(&mut self, mark: SinkMark) -> io::Result<bool> {
        let keep = mark.placement.disk as usize;
        if keep >= self.volumes.len() {
            return Ok(false);
        }
        self.current.flush()?;
        let mut file = OpenOptions::new().write(true).open(&self.volumes[keep])?;
        file.set_len(mark.placement.offset)?;
        file.seek(SeekFrom::Start(mark.placement.offset))?;
        self.current = BufWriter::new(file);
        for stale in self.volumes.drain(keep + 1..) {
            fs::remove_file(&stale)?;
        }
        self.lengths.truncate(keep);
        self.disk_offset = mark.placement.offset;
        self.pos = mark.position;
        Ok(true)
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.current.flush()?;
        self.current.get_ref().sync_all()?;
        if let Some(last) = self.volumes.last_mut() {
            fs::rename(&*last, &self.archive)?;
            *last = self.archive.clone();
        }
        self.finished = true;
        debug!(volumes = self.volumes.len(), "split archive finished");
        Ok(())
    }
}

/// Reads the volumes of a split archive as one logical stream.
pub struct SegmentedReader {
    volumes: Vec<File>,
    starts: Vec<u64>,
    total: u64,
    pos: u64,
}

impl SegmentedReader {
    /// Open `archive` and its `.z01`, `.z02`, ... siblings.
    pub fn open(archive: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let mut disk = 0;
        loop {
            let path = volume_path(archive, disk);
            if !path.is_file() {
                break;
            }
            files.push(File::open(&path)?);
            disk += 1;
        }
        files.push(File::open(archive)?);
        Self::from_volumes(files)
    }

    /// Present already-open volumes, in disk order.
    pub fn from_volumes(volumes: Vec<File>) -> Result<Self> {
        let mut starts = Vec::with_capacity(volumes.len());
        let mut total = 0;
        for file in &volumes {
            starts.push(total);
            total += file.metadata()?.len();
        }
        debug!(volumes = volumes.len(), total, "opened split archive");
        Ok(Self {
            volumes,
            starts,
            total,
            pos: 0,
        })
    }

    /// Number of volumes.
    pub fn disk_count(&self) -> u32 {
        self.volumes.len() as u32
    }

    /// Logical position of `offset` on `disk`.
    pub fn resolve(&self, disk: u32, offset: u64) -> Result<u64> {
        self.starts
            .get(disk as usize)
            .map(|start| start + offset)
            .ok_or_else(|| {
                ZipError::format(
                    offset,
                    format!("disk {disk} does not exist ({} volumes)", self.volumes.len()),
                )
            })
    }

    /// True if more than one volume is present.
    pub fn is_split(&self) -> bool {
        self.volumes.len() > 1
    }
}

impl Read for SegmentedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.total || buf.is_empty() {
            return Ok(0);
        }
        let idx = self.starts.partition_point(|&s| s <= self.pos) - 1;
        let local = self.pos - self.starts[idx];
        let end = self.starts.get(idx + 1).copied().unwrap_or(self.total);
        let avail = end - self.pos;
        let want = buf.len().min(usize::try_from(avail).unwrap_or(usize::MAX));

        let file = &mut self.volumes[idx];
        file.seek(SeekFrom::Start(local))?;
        let n = file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SegmentedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.total.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of split archive",
            )),
        }
    }
}
