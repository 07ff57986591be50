//! Simulated kernel for exercising the ring protocol without io_uring
//!
//! `SimKernel` implements [`Kernel`] over heap memory. It lays the regions out
//! the way Linux does, consumes published submission entries on `enter`, serves
//! reads from an in-memory file, and posts completions with release stores, so
//! the engine runs the same code path it runs against the real kernel.
//!
//! Knobs let tests reorder completions, defer them until a blocking wait,
//! accept only part of a batch, inject failing or short results, and
//! interrupt a wait with `EINTR`.

use crate::kernel::{Kernel, MappedRegion};
use crate::submit::ReadTarget;
use crate::sys::*;
use nix::libc;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

// Region layout, matching what current kernels report
const SQ_HEAD: u32 = 0;
const SQ_TAIL: u32 = 4;
const SQ_MASK: u32 = 8;
const SQ_ENTRIES: u32 = 12;
const SQ_FLAGS: u32 = 16;
const SQ_DROPPED: u32 = 20;
const SQ_ARRAY: u32 = 24;

const CQ_HEAD: u32 = 0;
const CQ_TAIL: u32 = 4;
const CQ_MASK: u32 = 8;
const CQ_ENTRIES: u32 = 12;
const CQ_OVERFLOW: u32 = 16;
const CQ_FLAGS: u32 = 20;
const CQ_CQES: u32 = 32;

/// Counters describing what the simulated kernel did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Calls to `enter`
    pub enters: u64,
    /// Calls to `enter` with `IORING_ENTER_GETEVENTS`
    pub waits: u64,
    /// Submission entries consumed
    pub submitted: u64,
    /// Completions posted to the completion ring
    pub completed: u64,
    /// Completions lost to a full completion ring
    pub overflowed: u64,
}

/// One heap-backed region; 8-byte aligned like a real mapping
struct Region {
    ptr: NonNull<u8>,
    len: usize,
    _backing: Vec<u64>,
}

// SAFETY: the pointer refers to the region's own heap backing
unsafe impl Send for Region {}

impl Region {
    fn new(len: usize) -> Self {
        let mut backing = vec![0u64; len.div_ceil(8).max(1)];
        let ptr = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            _backing: backing,
        }
    }

    fn index(&self, offset: u32) -> &AtomicU32 {
        debug_assert!(offset as usize + 4 <= self.len);
        // SAFETY: offset is one of the fixed 4-byte aligned fields inside len
        unsafe { &*self.ptr.as_ptr().add(offset as usize).cast::<AtomicU32>() }
    }

    /// Initialize a field before the ring is shared
    fn set(&self, offset: u32, value: u32) {
        self.index(offset).store(value, Ordering::Relaxed);
    }

    fn ptr_at<T>(&self, offset: usize) -> *mut T {
        // SAFETY: callers stay inside the region
        unsafe { self.ptr.as_ptr().add(offset).cast::<T>() }
    }
}

struct Rings {
    sq_ring: Region,
    sqes: Region,
    cq_ring: Region,
    sq_entries: u32,
    cq_entries: u32,
    /// Kernel-private consumption point of the submission ring
    sq_head: u32,
}

#[derive(Default)]
struct SimState {
    file: Vec<u8>,
    rings: Option<Rings>,
    fail_setup: Option<i32>,
    fail_map: Option<u64>,
    defer: bool,
    reverse: bool,
    stalled: bool,
    accept_limit: Option<u32>,
    injected: VecDeque<i32>,
    interrupts: u32,
    pending: VecDeque<IoUringCqe>,
    stats: SimStats,
}

/// In-process stand-in for the io_uring syscalls.
pub struct SimKernel {
    state: RefCell<SimState>,
}

impl std::fmt::Debug for SimKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SimKernel")
            .field("file_len", &state.file.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl SimKernel {
    /// Simulated kernel serving reads from `file`.
    pub fn new(file: Vec<u8>) -> Self {
        Self {
            state: RefCell::new(SimState {
                file,
                ..Default::default()
            }),
        }
    }

    /// File of `blocks` blocks where every byte of block `i` equals `i as u8`.
    pub fn patterned_file(blocks: usize, block_size: usize) -> Vec<u8> {
        (0..blocks)
            .flat_map(|i| std::iter::repeat(i as u8).take(block_size))
            .collect()
    }

    /// Fail `io_uring_setup` with `errno`.
    pub fn fail_setup(mut self, errno: i32) -> Self {
        self.state.get_mut().fail_setup = Some(errno);
        self
    }

    /// Fail the mapping of region `offset` with `ENOMEM`.
    pub fn fail_map(mut self, offset: u64) -> Self {
        self.state.get_mut().fail_map = Some(offset);
        self
    }

    /// Only post completions during a blocking wait.
    pub fn deferred(mut self) -> Self {
        self.state.get_mut().defer = true;
        self
    }

    /// Complete each submitted batch in reverse order.
    pub fn reversed(mut self) -> Self {
        self.state.get_mut().reverse = true;
        self
    }

    /// Never post completions; waits return with the ring empty.
    pub fn stalled(mut self) -> Self {
        self.state.get_mut().stalled = true;
        self
    }

    /// Consume at most `n` entries per `enter`.
    pub fn accept_at_most(mut self, n: u32) -> Self {
        self.state.get_mut().accept_limit = Some(n);
        self
    }

    /// Complete the next consumed read with `res` instead of performing it.
    ///
    /// Positive values are short reads: that many bytes are copied.
    pub fn inject_result(&self, res: i32) {
        self.state.borrow_mut().injected.push_back(res);
    }

    /// Make the next blocking wait fail with `EINTR`.
    pub fn interrupt_next_wait(&self) {
        self.state.borrow_mut().interrupts += 1;
    }

    /// Post a completion directly, bypassing any submission.
    pub fn post_raw(&self, cqe: IoUringCqe) {
        let mut state = self.state.borrow_mut();
        state.pending.push_back(cqe);
        state.flush();
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats.clone()
    }

    /// Read target sized to the in-memory file.
    ///
    /// The descriptor is `/dev/null`; reads are served from memory.
    pub fn target(&self) -> io::Result<ReadTarget> {
        let size = self.state.borrow().file.len() as u64;
        Ok(ReadTarget::with_size(File::open("/dev/null")?, size))
    }
}

impl SimState {
    fn perform(&mut self, sqe: &IoUringSqe) -> IoUringCqe {
        let res = match sqe.opcode {
            IORING_OP_NOP => 0,
            IORING_OP_READ => match self.injected.pop_front() {
                Some(res) if res <= 0 => res,
                Some(res) => self.copy_out(sqe, (res as usize).min(sqe.len as usize)),
                None => self.copy_out(sqe, sqe.len as usize),
            },
            _ => -libc::EINVAL,
        };
        IoUringCqe {
            user_data: sqe.user_data,
            res,
            flags: 0,
        }
    }

    fn copy_out(&self, sqe: &IoUringSqe, len: usize) -> i32 {
        let start = (sqe.off as usize).min(self.file.len());
        let end = start.saturating_add(len).min(self.file.len());
        let count = end - start;
        if count > 0 {
            // SAFETY: the engine loaned a block of at least `sqe.len` bytes at addr
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.file[start..end].as_ptr(),
                    sqe.addr as *mut u8,
                    count,
                );
            }
        }
        count as i32
    }

    /// Consume up to `limit` published submission entries.
    fn consume(&mut self, limit: u32) -> u32 {
        let Some(rings) = self.rings.as_mut() else {
            return 0;
        };
        let tail = rings.sq_ring.index(SQ_TAIL).load(Ordering::Acquire);
        let published = tail.wrapping_sub(rings.sq_head);
        let take = published.min(limit);
        let mask = rings.sq_entries - 1;

        let mut batch = Vec::with_capacity(take as usize);
        for _ in 0..take {
            let slot = rings.sq_head & mask;
            // SAFETY: slot < sq_entries, array and sqes sized for sq_entries
            let sqe = unsafe {
                let idx_offset = SQ_ARRAY as usize + slot as usize * 4;
                let idx = rings.sq_ring.ptr_at::<u32>(idx_offset).read();
                let sqe_offset = (idx & mask) as usize * std::mem::size_of::<IoUringSqe>();
                rings.sqes.ptr_at::<IoUringSqe>(sqe_offset).read()
            };
            batch.push(sqe);
            rings.sq_head = rings.sq_head.wrapping_add(1);
        }
        let head = rings.sq_head;
        rings.sq_ring.index(SQ_HEAD).store(head, Ordering::Release);

        let mut completions: Vec<_> = batch.iter().map(|sqe| self.perform(sqe)).collect();
        if self.reverse {
            completions.reverse();
        }
        self.pending.extend(completions);
        self.stats.submitted += u64::from(take);
        take
    }

    /// Move pending completions onto the completion ring.
    fn flush(&mut self) {
        if self.stalled {
            return;
        }
        let Some(rings) = self.rings.as_ref() else {
            return;
        };
        let mask = rings.cq_entries - 1;
        while let Some(cqe) = self.pending.pop_front() {
            let tail = rings.cq_ring.index(CQ_TAIL).load(Ordering::Relaxed);
            let head = rings.cq_ring.index(CQ_HEAD).load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= rings.cq_entries {
                self.stats.overflowed += 1;
                continue;
            }
            let slot = (tail & mask) as usize;
            let offset = CQ_CQES as usize + slot * std::mem::size_of::<IoUringCqe>();
            // SAFETY: slot inside the CQE array
            unsafe { rings.cq_ring.ptr_at::<IoUringCqe>(offset).write(cqe) };
            let next = tail.wrapping_add(1);
            rings.cq_ring.index(CQ_TAIL).store(next, Ordering::Release);
            self.stats.completed += 1;
        }
    }
}

impl Kernel for SimKernel {
    fn setup(&self, entries: u32, params: &mut IoUringParams) -> io::Result<OwnedFd> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.fail_setup {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if entries == 0 || entries > IORING_MAX_ENTRIES {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let sq_entries = entries.next_power_of_two();
        let cq_entries = sq_entries * 2;

        *params = IoUringParams {
            sq_entries,
            cq_entries,
            features: IORING_FEAT_SINGLE_MMAP,
            ..Default::default()
        };
        params.sq_off = SqRingOffsets {
            head: SQ_HEAD,
            tail: SQ_TAIL,
            ring_mask: SQ_MASK,
            ring_entries: SQ_ENTRIES,
            flags: SQ_FLAGS,
            dropped: SQ_DROPPED,
            array: SQ_ARRAY,
            ..Default::default()
        };
        params.cq_off = CqRingOffsets {
            head: CQ_HEAD,
            tail: CQ_TAIL,
            ring_mask: CQ_MASK,
            ring_entries: CQ_ENTRIES,
            overflow: CQ_OVERFLOW,
            cqes: CQ_CQES,
            flags: CQ_FLAGS,
            ..Default::default()
        };

        let sq_ring = Region::new(sq_ring_len(params));
        let sqes = Region::new(sqes_len(params));
        let cq_ring = Region::new(cq_ring_len(params));
        sq_ring.set(SQ_MASK, sq_entries - 1);
        sq_ring.set(SQ_ENTRIES, sq_entries);
        cq_ring.set(CQ_MASK, cq_entries - 1);
        cq_ring.set(CQ_ENTRIES, cq_entries);

        state.rings = Some(Rings {
            sq_ring,
            sqes,
            cq_ring,
            sq_entries,
            cq_entries,
            sq_head: 0,
        });

        Ok(File::open("/dev/null")?.into())
    }

    fn map(&self, _ring: BorrowedFd<'_>, len: usize, offset: u64) -> io::Result<MappedRegion> {
        let state = self.state.borrow();
        if state.fail_map == Some(offset) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let rings = state
            .rings
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let region = match offset {
            IORING_OFF_SQ_RING => &rings.sq_ring,
            IORING_OFF_SQES => &rings.sqes,
            IORING_OFF_CQ_RING => &rings.cq_ring,
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };
        if len > region.len {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        // SAFETY: the region's backing lives as long as this kernel, which the
        // ring owns and drops after its mappings
        Ok(unsafe { MappedRegion::from_raw(region.ptr, len) })
    }

    fn enter(
        &self,
        _ring: BorrowedFd<'_>,
        to_submit: u32,
        _min_complete: u32,
        flags: u32,
    ) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        state.stats.enters += 1;
        let wait = flags & IORING_ENTER_GETEVENTS != 0;

        let limit = state.accept_limit.map_or(to_submit, |n| n.min(to_submit));
        let consumed = state.consume(limit);

        if wait {
            state.stats.waits += 1;
            if state.interrupts > 0 {
                state.interrupts -= 1;
                return Err(io::Error::from_raw_os_error(libc::EINTR));
            }
        }
        if wait || !state.defer {
            state.flush();
        }
        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    fn setup(kernel: &SimKernel, entries: u32) -> (OwnedFd, IoUringParams) {
        let mut params = IoUringParams::default();
        let fd = kernel.setup(entries, &mut params).unwrap();
        (fd, params)
    }

    #[test]
    fn test_setup_rounds_to_power_of_two() {
        let kernel = SimKernel::new(Vec::new());
        let (_fd, params) = setup(&kernel, 5);
        assert_eq!(params.sq_entries, 8);
        assert_eq!(params.cq_entries, 16);
        assert_eq!(params.sq_off.array, SQ_ARRAY);
        assert_eq!(params.cq_off.cqes, CQ_CQES);
    }

    #[test]
    fn test_setup_rejects_oversized() {
        let kernel = SimKernel::new(Vec::new());
        let mut params = IoUringParams::default();
        let entries = IORING_MAX_ENTRIES + 1;
        let err = kernel.setup(entries, &mut params).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_map_rejects_unknown_region() {
        let kernel = SimKernel::new(Vec::new());
        let (fd, _) = setup(&kernel, 4);
        let err = kernel.map(fd.as_fd(), 8, 0x42).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_map_before_setup_fails() {
        let kernel = SimKernel::new(Vec::new());
        let devnull = File::open("/dev/null").unwrap();
        assert!(kernel.map(devnull.as_fd(), 8, IORING_OFF_SQ_RING).is_err());
    }

    #[test]
    fn test_patterned_file() {
        let file = SimKernel::patterned_file(3, 4);
        assert_eq!(file, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_enter_without_entries_consumes_nothing() {
        let kernel = SimKernel::new(vec![0; 64]);
        let (fd, _) = setup(&kernel, 4);
        assert_eq!(kernel.enter(fd.as_fd(), 4, 0, 0).unwrap(), 0);
        let stats = kernel.stats();
        assert_eq!(stats.enters, 1);
        assert_eq!(stats.submitted, 0);
    }

    #[test]
    fn test_interrupted_wait() {
        let kernel = SimKernel::new(Vec::new());
        let (fd, _) = setup(&kernel, 4);
        kernel.interrupt_next_wait();

        let (ring, wait) = (fd.as_fd(), IORING_ENTER_GETEVENTS);
        let err = kernel.enter(ring, 0, 1, wait).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINTR));
        assert!(kernel.enter(ring, 0, 1, wait).is_ok());
        assert_eq!(kernel.stats().waits, 2);
    }
}
