//! Completion reaping
//!
//! Completions are consumed one at a time: acquire-load the kernel's tail,
//! copy the entry out, release-store the advanced head. A blocking reap waits
//! in `io_uring_enter` for at least one completion and retries exactly once.

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::pool::Buffer;
use crate::ring::Ring;
use crate::sys::{IoUringCqe, IORING_ENTER_GETEVENTS};
use std::io;
use tracing::{debug, trace, warn};

/// Whether a reap may wait for the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapMode {
    /// Return `None` when nothing has completed
    NonBlocking,
    /// Wait for a completion if reads are in flight
    Blocking,
}

/// A finished read and the buffer holding its data.
#[derive(Debug)]
#[must_use = "the buffer must be released back to the engine"]
pub struct Completion {
    pub buffer: Buffer,
    /// Bytes transferred; always one full block
    pub bytes: usize,
}

impl<K: Kernel> Ring<K> {
    /// Consume the next completion entry, if the kernel has posted one.
    pub(crate) fn try_reap(&mut self) -> Result<Option<IoUringCqe>> {
        let head = self.cq.head.observe();
        let tail = self.cq.tail.observe();
        let ready = tail.wrapping_sub(head);
        if ready == 0 {
            return Ok(None);
        }
        if ready > self.cq.entries {
            return Err(Error::RingDesync {
                head,
                tail,
                entries: self.cq.entries,
            });
        }

        let cqe = self.cq.entry(head);
        self.cq.head.publish(head.wrapping_add(1));
        trace!(user_data = cqe.user_data, res = cqe.res, "cqe consumed");
        Ok(Some(cqe))
    }

    /// Block until the kernel has posted at least one completion.
    fn wait_for_completion(&self) -> Result<()> {
        loop {
            match self.enter(0, 1, IORING_ENTER_GETEVENTS) {
                Ok(_) => return Ok(()),
                Err(Error::Enter(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("wait interrupted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<K: Kernel> Engine<K> {
    /// Take one completed read.
    ///
    /// Returns `None` when nothing is ready in `NonBlocking` mode, or when no
    /// reads are in flight. Any failed or short read is an error.
    pub fn reap(&mut self, mode: ReapMode) -> Result<Option<Completion>> {
        let cqe = match self.ring.try_reap()? {
            Some(cqe) => cqe,
            None if mode == ReapMode::Blocking && self.ring.in_flight > 0 => {
                self.ring.wait_for_completion()?;
                self.ring.try_reap()?.ok_or(Error::EmptyAfterWait)?
            }
            None => return Ok(None),
        };

        let buffer = self.pool.reclaim(cqe.user_data)?;
        self.ring.in_flight = self.ring.in_flight.saturating_sub(1);

        let expected = self.pool.block_size();
        if cqe.res < 0 {
            let tag = cqe.user_data;
            self.pool.release(buffer)?;
            warn!(tag, errno = -cqe.res, "read failed");
            return Err(Error::CompletionFailed {
                tag,
                errno: -cqe.res,
            });
        }
        let bytes = cqe.res as usize;
        if bytes != expected {
            let tag = cqe.user_data;
            self.pool.release(buffer)?;
            return Err(Error::ShortRead {
                tag,
                expected,
                actual: bytes,
            });
        }

        Ok(Some(Completion { buffer, bytes }))
    }

    /// Reap everything that is ready.
    ///
    /// In `Blocking` mode the first reap may wait; the rest never do.
    pub fn drain(&mut self, mode: ReapMode) -> Result<Vec<Completion>> {
        let mut done = Vec::new();
        let mut next = self.reap(mode)?;
        while let Some(completion) = next {
            done.push(completion);
            next = self.reap(ReapMode::NonBlocking)?;
        }
        Ok(done)
    }
}
