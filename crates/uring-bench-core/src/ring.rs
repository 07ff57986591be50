//! Ring transport: creation, region mapping, and index hand-off
//!
//! The three regions shared with the kernel are mapped once at creation and
//! every pointer the engine needs is derived from the offsets the kernel
//! reports. Index fields that cross the kernel/user boundary are only touched
//! through [`RingIndex`], which bakes in acquire loads and release stores.

use crate::error::{Error, RegionKind, Result};
use crate::kernel::{Kernel, MappedRegion, SysKernel};
use crate::sys::*;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

// ============================================================================
// Shared index
// ============================================================================

/// A `u32` ring index living in memory shared with the kernel.
///
/// `observe` pairs with the other side's `publish`: everything written before
/// the release store is visible after the acquire load that sees its value.
#[derive(Debug)]
pub struct RingIndex {
    ptr: NonNull<AtomicU32>,
}

impl RingIndex {
    fn new(region: &MappedRegion, kind: RegionKind, offset: u32) -> Result<Self> {
        let ptr = field::<u32>(region, kind, offset, 1)?;
        Ok(Self { ptr: ptr.cast() })
    }

    /// Load with acquire ordering.
    #[inline]
    pub fn observe(&self) -> u32 {
        // SAFETY: points into a live mapping, 4-byte aligned (checked in `field`)
        unsafe { self.ptr.as_ref() }.load(Ordering::Acquire)
    }

    /// Store with release ordering.
    #[inline]
    pub fn publish(&self, value: u32) {
        // SAFETY: see observe
        unsafe { self.ptr.as_ref() }.store(value, Ordering::Release)
    }
}

fn field<T>(
    region: &MappedRegion,
    kind: RegionKind,
    offset: u32,
    count: usize,
) -> Result<NonNull<T>> {
    match region.at::<T>(offset as usize, count) {
        Some(ptr) => Ok(ptr),
        None => Err(Error::RegionBounds {
            region: kind,
            offset: offset as usize,
            size: std::mem::size_of::<T>() * count,
            len: region.len(),
        }),
    }
}

// ============================================================================
// Queues
// ============================================================================

/// User-side view of the submission ring and entry table.
#[derive(Debug)]
pub(crate) struct SubmissionQueue {
    /// Written by us, read by the kernel
    pub(crate) tail: RingIndex,
    pub(crate) mask: u32,
    pub(crate) entries: u32,
    /// Index array: slot `i` names the SQE the kernel should consume next
    array: NonNull<u32>,
    sqes: NonNull<IoUringSqe>,
}

impl SubmissionQueue {
    /// Write `sqe` into the slot for ring position `tail` and point the index
    /// array at it.
    ///
    /// Entries stay invisible to the kernel until the tail is published.
    #[inline]
    pub(crate) fn stage(&mut self, tail: u32, sqe: IoUringSqe) {
        let index = tail & self.mask;
        // SAFETY: index <= mask < entries, both arrays were bounds-checked for `entries` items
        unsafe {
            self.sqes.as_ptr().add(index as usize).write(sqe);
            self.array.as_ptr().add(index as usize).write(index);
        }
    }
}

/// User-side view of the completion ring.
#[derive(Debug)]
pub(crate) struct CompletionQueue {
    /// Written by us, read by the kernel
    pub(crate) head: RingIndex,
    /// Written by the kernel, read by us
    pub(crate) tail: RingIndex,
    pub(crate) mask: u32,
    pub(crate) entries: u32,
    cqes: NonNull<IoUringCqe>,
}

impl CompletionQueue {
    /// Copy out the CQE at ring position `head`.
    #[inline]
    pub(crate) fn entry(&self, head: u32) -> IoUringCqe {
        let index = head & self.mask;
        // SAFETY: index <= mask < entries, array bounds-checked at creation
        unsafe { self.cqes.as_ptr().add(index as usize).read() }
    }
}

// ============================================================================
// Ring descriptor
// ============================================================================

/// An io_uring instance with its three regions mapped into our address space.
///
/// Owns the ring descriptor, the negotiated parameters, the mappings, and the
/// count of operations submitted but not yet reaped.
pub struct Ring<K: Kernel = SysKernel> {
    pub(crate) sq: SubmissionQueue,
    pub(crate) cq: CompletionQueue,
    pub(crate) in_flight: u32,
    params: IoUringParams,
    // Mappings must outlive sq/cq; dropped after them by declaration order
    _sq_ring: MappedRegion,
    _sqes: MappedRegion,
    _cq_ring: MappedRegion,
    fd: OwnedFd,
    kernel: K,
}

// SAFETY: the raw pointers all point into mappings owned by this struct; all
// access requires `&mut self` or goes through atomics.
unsafe impl<K: Kernel + Send> Send for Ring<K> {}

impl Ring<SysKernel> {
    /// Create a ring backed by the real kernel.
    pub fn new(capacity: u32) -> Result<Self> {
        Self::create(SysKernel, capacity)
    }
}

impl<K: Kernel> Ring<K> {
    /// Ask the kernel for a ring of at least `capacity` submission slots and map it.
    ///
    /// The kernel may round the depth up; the negotiated value is what
    /// [`capacity`](Self::capacity) reports from then on.
    pub fn create(kernel: K, capacity: u32) -> Result<Self> {
        if capacity == 0 || capacity > IORING_MAX_ENTRIES {
            return Err(Error::InvalidCapacity(capacity));
        }

        let mut params = IoUringParams::default();
        let fd = kernel.setup(capacity, &mut params).map_err(Error::Setup)?;
        if params.sq_entries < capacity || params.cq_entries < params.sq_entries {
            return Err(Error::Setup(io::Error::other(format!(
                "kernel negotiated sq_entries={} cq_entries={} for requested {}",
                params.sq_entries, params.cq_entries, capacity
            ))));
        }

        let sq_ring = map(&kernel, fd.as_fd(), &params, RegionKind::SubmissionRing)?;
        let sqes = map(&kernel, fd.as_fd(), &params, RegionKind::SubmissionEntries)?;
        let cq_ring = map(&kernel, fd.as_fd(), &params, RegionKind::CompletionRing)?;

        let sq_entries = params.sq_entries;
        let cq_entries = params.cq_entries;

        let kind = RegionKind::SubmissionRing;
        let off = &params.sq_off;
        let len = sq_entries as usize;
        let sq = SubmissionQueue {
            tail: RingIndex::new(&sq_ring, kind, off.tail)?,
            mask: RingIndex::new(&sq_ring, kind, off.ring_mask)?.observe(),
            entries: sq_entries,
            array: field(&sq_ring, kind, off.array, len)?,
            sqes: field(&sqes, RegionKind::SubmissionEntries, 0, len)?,
        };

        let kind = RegionKind::CompletionRing;
        let off = &params.cq_off;
        let cq = CompletionQueue {
            head: RingIndex::new(&cq_ring, kind, off.head)?,
            tail: RingIndex::new(&cq_ring, kind, off.tail)?,
            mask: RingIndex::new(&cq_ring, kind, off.ring_mask)?.observe(),
            entries: cq_entries,
            cqes: field(&cq_ring, kind, off.cqes, cq_entries as usize)?,
        };

        if sq.mask != sq_entries - 1 || cq.mask != cq_entries - 1 {
            return Err(Error::Setup(io::Error::other(format!(
                "ring masks {:#x}/{:#x} do not match entries {}/{}",
                sq.mask, cq.mask, sq_entries, cq_entries
            ))));
        }

        info!(
            requested = capacity,
            sq_entries,
            cq_entries,
            sqes = ?sqes.as_ptr(),
            sq_ring = ?sq_ring.as_ptr(),
            cq_ring = ?cq_ring.as_ptr(),
            "io_uring mapped"
        );

        Ok(Self {
            sq,
            cq,
            in_flight: 0,
            params,
            _sq_ring: sq_ring,
            _sqes: sqes,
            _cq_ring: cq_ring,
            fd,
            kernel,
        })
    }

    /// Negotiated submission depth.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.sq.entries
    }

    /// Negotiated submission ring entries.
    #[inline]
    pub fn sq_entries(&self) -> u32 {
        self.params.sq_entries
    }

    /// Negotiated completion ring entries.
    #[inline]
    pub fn cq_entries(&self) -> u32 {
        self.params.cq_entries
    }

    /// Feature bits reported by the kernel.
    #[inline]
    pub fn features(&self) -> u32 {
        self.params.features
    }

    /// Operations submitted and not yet reaped.
    #[inline]
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Free submission capacity: `capacity - in_flight`.
    #[inline]
    pub fn available(&self) -> u32 {
        self.capacity() - self.in_flight
    }

    /// Completions the kernel has published that we have not consumed yet.
    pub fn ready(&self) -> u32 {
        self.cq.tail.observe().wrapping_sub(self.cq.head.observe())
    }

    /// The kernel backing this ring.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Ring file descriptor.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Tell the kernel about `to_submit` published entries and/or wait for
    /// completions.
    pub(crate) fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32> {
        debug!(to_submit, min_complete, flags, "io_uring_enter");
        self.kernel
            .enter(self.fd.as_fd(), to_submit, min_complete, flags)
            .map_err(Error::Enter)
    }
}

impl<K: Kernel> std::fmt::Debug for Ring<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("sq_entries", &self.sq_entries())
            .field("cq_entries", &self.cq_entries())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// Map one of the three regions at the size the negotiated parameters call for.
fn map<K: Kernel>(
    kernel: &K,
    fd: BorrowedFd<'_>,
    params: &IoUringParams,
    region: RegionKind,
) -> Result<MappedRegion> {
    let (len, offset) = match region {
        RegionKind::SubmissionRing => (sq_ring_len(params), IORING_OFF_SQ_RING),
        RegionKind::SubmissionEntries => (sqes_len(params), IORING_OFF_SQES),
        RegionKind::CompletionRing => (cq_ring_len(params), IORING_OFF_CQ_RING),
    };
    let mapped = kernel
        .map(fd, len, offset)
        .map_err(|source| Error::Mmap { region, source })?;
    debug!(%region, len, "region mapped");
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    // ========================================================================
    // Creation
    // ========================================================================

    #[test]
    fn test_create_rejects_zero_capacity() {
        let kernel = SimKernel::new(vec![0; 4096]);
        let err = Ring::create(kernel, 0).err().unwrap();
        assert!(matches!(err, Error::InvalidCapacity(0)));
    }

    #[test]
    fn test_create_rejects_oversized_capacity() {
        let kernel = SimKernel::new(vec![0; 4096]);
        let err = Ring::create(kernel, IORING_MAX_ENTRIES + 1).err().unwrap();
        assert!(matches!(err, Error::InvalidCapacity(_)));
    }

    #[test]
    fn test_create_exact_capacity() {
        let ring = Ring::create(SimKernel::new(vec![0; 4096]), 8).unwrap();
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.sq_entries(), 8);
        assert_eq!(ring.cq_entries(), 16);
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.ready(), 0);
    }

    #[test]
    fn test_create_honors_negotiated_capacity() {
        // Kernel rounds 5 up to the next power of two
        let ring = Ring::create(SimKernel::new(vec![0; 4096]), 5).unwrap();
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.available(), 8);
    }

    #[test]
    fn test_create_setup_failure() {
        let kernel = SimKernel::new(vec![0; 4096]).fail_setup(nix::libc::ENOSYS);
        let err = Ring::create(kernel, 4).err().unwrap();
        match err {
            Error::Setup(e) => assert_eq!(e.raw_os_error(), Some(nix::libc::ENOSYS)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_create_mmap_failure_names_region() {
        let kernel = SimKernel::new(vec![0; 4096]).fail_map(IORING_OFF_CQ_RING);
        let err = Ring::create(kernel, 4).err().unwrap();
        match err {
            Error::Mmap { region, .. } => assert_eq!(region, RegionKind::CompletionRing),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // ========================================================================
    // Index hand-off
    // ========================================================================

    #[test]
    fn test_ring_index_publish_observe() {
        let ring = Ring::create(SimKernel::new(vec![0; 4096]), 4).unwrap();
        assert_eq!(ring.sq.tail.observe(), 0);
        ring.sq.tail.publish(3);
        assert_eq!(ring.sq.tail.observe(), 3);
        ring.sq.tail.publish(u32::MAX);
        assert_eq!(ring.sq.tail.observe(), u32::MAX);
    }

    #[test]
    fn test_ready_counts_wrapping_indices() {
        let ring = Ring::create(SimKernel::new(vec![0; 4096]), 4).unwrap();
        ring.cq.head.publish(u32::MAX - 1);
        ring.cq.tail.publish(1);
        assert_eq!(ring.ready(), 3);
    }
}
