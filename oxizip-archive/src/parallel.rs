//! Parallel deflate.
//!
//! Input is cut into fixed-size blocks that are compressed independently on
//! a bounded rayon pool. Every block but the last ends with a sync flush, so
//! the concatenation is one valid raw deflate stream. Blocks are written in
//! their original order.

use crate::options::ParallelDeflate;
use flate2::{Compress, Compression, FlushCompress, Status};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::io::{self, Write};
use tracing::trace;

/// Compress one block as raw deflate.
///
/// Non-final blocks end on a byte boundary after a sync flush; the final
/// block finishes the stream.
pub fn deflate_block(data: &[u8], level: Compression, last: bool) -> io::Result<Vec<u8>> {
    let mut compress = Compress::new(level, false);
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let flush = if last {
        FlushCompress::Finish
    } else {
        FlushCompress::Sync
    };

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(64));
        }
        let consumed = compress.total_in() as usize;
        let status = compress
            .compress_vec(&data[consumed..], &mut out, flush)
            .map_err(io::Error::other)?;
        let input_done = compress.total_in() as usize == data.len();
        match status {
            Status::StreamEnd => break,
            _ if !last && input_done && out.len() < out.capacity() => break,
            _ => {}
        }
    }
    Ok(out)
}

/// A writer that deflates through a worker pool.
pub struct ParallelDeflater<W: Write> {
    inner: W,
    pool: ThreadPool,
    level: Compression,
    block_size: usize,
    in_flight: usize,
    current: Vec<u8>,
    pending: Vec<Vec<u8>>,
}

impl<W: Write> ParallelDeflater<W> {
    /// Create a deflater with its own pool.
    pub fn new(inner: W, settings: &ParallelDeflate, level: u32) -> io::Result<Self> {
        let threads = settings.max_threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("oxizip-deflate-{i}"))
            .build()
            .map_err(io::Error::other)?;
        let block_size = settings.block_size.max(4096);
        Ok(Self {
            inner,
            pool,
            level: Compression::new(level.min(9)),
            block_size,
            in_flight: threads * 2,
            current: Vec::with_capacity(block_size),
            pending: Vec::new(),
        })
    }

    fn drain_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let level = self.level;
        let blocks = std::mem::take(&mut self.pending);
        trace!(blocks = blocks.len(), "compressing batch");
        let compressed: Vec<io::Result<Vec<u8>>> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| deflate_block(block, level, false))
                .collect()
        });
        for block in compressed {
            self.inner.write_all(&block?)?;
        }
        Ok(())
    }

    /// Compress what is left, finish the stream and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.drain_pending()?;
        let last = deflate_block(&self.current, self.level, true)?;
        self.inner.write_all(&last)?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ParallelDeflater<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.current.len();
        let take = room.min(buf.len());
        self.current.extend_from_slice(&buf[..take]);
        if self.current.len() == self.block_size {
            let full = std::mem::replace(&mut self.current, Vec::with_capacity(self.block_size));
            self.pending.push(full);
            if self.pending.len() >= self.in_flight {
                self.drain_pending()?;
            }
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
