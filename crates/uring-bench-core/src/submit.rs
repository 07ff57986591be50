//! Batch submission of block reads
//!
//! A batch is staged into the submission ring, made visible with one release
//! store of the tail, and handed to the kernel with a single `io_uring_enter`.

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::sys::IoUringSqe;
use nix::libc;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, trace};

// ============================================================================
// Read target
// ============================================================================

/// File or block device the benchmark reads from.
#[derive(Debug)]
pub struct ReadTarget {
    file: File,
    size: u64,
}

impl ReadTarget {
    /// Open `path` read-only with `O_DIRECT`, bypassing the page cache.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path.as_ref())
            .map_err(Error::Target)?;
        Self::from_file(file)
    }

    /// Use an already open file; size is taken from its end offset, which
    /// also works for block devices.
    pub fn from_file(mut file: File) -> Result<Self> {
        let size = file.seek(SeekFrom::End(0)).map_err(Error::Target)?;
        Ok(Self { file, size })
    }

    pub(crate) fn with_size(file: File, size: u64) -> Self {
        Self { file, size }
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whole blocks of `block_size` bytes in the target
    #[inline]
    pub fn blocks(&self, block_size: usize) -> u64 {
        self.size / block_size as u64
    }
}

// ============================================================================
// Offset policy
// ============================================================================

/// Chooses which block each read targets.
pub trait OffsetPolicy {
    /// Block index in `0..blocks`; `blocks` is never zero.
    fn next_block(&mut self, blocks: u64) -> u64;
}

impl<F: FnMut(u64) -> u64> OffsetPolicy for F {
    fn next_block(&mut self, blocks: u64) -> u64 {
        self(blocks)
    }
}

/// Walks blocks in order, wrapping at the end of the target.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    next: u64,
}

impl OffsetPolicy for Sequential {
    fn next_block(&mut self, blocks: u64) -> u64 {
        let block = self.next % blocks;
        self.next = block + 1;
        block
    }
}

// ============================================================================
// Submission
// ============================================================================

impl<K: Kernel> Engine<K> {
    /// Submit up to `requested` block reads from `target`.
    ///
    /// The count is clamped to free submission capacity; the number actually
    /// submitted is returned and is zero when the ring is full.
    pub fn submit_reads<P>(
        &mut self,
        target: &ReadTarget,
        requested: u32,
        policy: &mut P,
    ) -> Result<u32>
    where
        P: OffsetPolicy + ?Sized,
    {
        let count = requested.min(self.ring.available());
        if count == 0 {
            trace!(
                requested,
                in_flight = self.ring.in_flight,
                "ring full, nothing to submit"
            );
            return Ok(0);
        }

        let block_size = self.pool.block_size();
        let blocks = target.blocks(block_size);
        if blocks == 0 {
            return Err(Error::FileTooSmall {
                size: target.size(),
                block_size,
            });
        }

        let fd = target.file.as_raw_fd();
        let len = block_size as u32;
        let mut tail = self.ring.sq.tail.observe();
        for _ in 0..count {
            let buffer = self.pool.allocate()?;
            let block = policy.next_block(blocks) % blocks;
            let offset = block * block_size as u64;
            let (tag, addr) = self.pool.loan(buffer);
            let sqe = IoUringSqe::read(fd, offset, addr as u64, len, tag);
            self.ring.sq.stage(tail, sqe);
            trace!(tag, block, "read staged");
            tail = tail.wrapping_add(1);
        }
        self.ring.sq.tail.publish(tail);

        let accepted = self.ring.enter(count, 0, 0)?;
        self.ring.in_flight += accepted.min(count);
        if accepted != count {
            return Err(Error::PartialSubmit {
                requested: count,
                accepted,
            });
        }

        debug!(
            submitted = count,
            in_flight = self.ring.in_flight,
            "reads submitted"
        );
        Ok(count)
    }
}
