//! Kernel interaction shim
//!
//! The ring protocol only ever needs three things from the kernel: create a
//! ring, map one of its regions, and enter it. This module puts those behind
//! the `Kernel` trait so the protocol logic can be exercised against a
//! simulated kernel.
//!
//! - `Kernel`: trait for ring setup, region mapping, and `io_uring_enter`
//! - `SysKernel`: production implementation using raw syscalls
//! - `MappedRegion`: one mapped region, unmapped on drop

use crate::sys::IoUringParams;
use nix::libc;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

// ============================================================================
// Kernel Shim Trait
// ============================================================================

/// Trait abstracting the io_uring system calls
pub trait Kernel {
    /// `io_uring_setup(2)`: create a ring of at least `entries` slots.
    ///
    /// The kernel writes the negotiated sizes and region offsets into `params`.
    fn setup(&self, entries: u32, params: &mut IoUringParams) -> io::Result<OwnedFd>;

    /// Map `len` bytes of the ring at region selector `offset`, read/write and shared.
    fn map(&self, ring: BorrowedFd<'_>, len: usize, offset: u64) -> io::Result<MappedRegion>;

    /// `io_uring_enter(2)`: consume up to `to_submit` published entries and,
    /// with `IORING_ENTER_GETEVENTS`, wait until `min_complete` completions exist.
    fn enter(
        &self,
        ring: BorrowedFd<'_>,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
    ) -> io::Result<u32>;
}

// ============================================================================
// Mapped region
// ============================================================================

/// One region of the ring shared with the kernel.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    owned: bool,
}

impl MappedRegion {
    /// Take ownership of an `mmap` result; it is unmapped on drop.
    ///
    /// # Safety
    /// `ptr` must come from a successful `mmap` of exactly `len` bytes that
    /// nothing else will unmap.
    pub unsafe fn from_mmap(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            owned: true,
        }
    }

    /// Wrap memory the caller keeps alive and frees itself.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes, aligned to 8,
    /// for as long as the region (and any ring built on it) is alive.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            owned: false,
        }
    }

    /// Base address
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to `count` values of `T` at byte `offset`, if they fit and are aligned.
    pub fn at<T>(&self, offset: usize, count: usize) -> Option<NonNull<T>> {
        let size = std::mem::size_of::<T>().checked_mul(count)?;
        let end = offset.checked_add(size)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset + size <= len, so the pointer stays inside the region
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        if (ptr as usize) % std::mem::align_of::<T>() != 0 {
            return None;
        }
        NonNull::new(ptr.cast::<T>())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: from_mmap guarantees we own this mapping
            let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
            if rc < 0 {
                let error = io::Error::last_os_error();
                tracing::warn!(len = self.len, %error, "munmap failed");
            }
        }
    }
}

// ============================================================================
// Real Kernel Shim Implementation
// ============================================================================

/// Production implementation using the raw io_uring syscalls
#[derive(Debug, Clone, Copy, Default)]
pub struct SysKernel;

impl Kernel for SysKernel {
    fn setup(&self, entries: u32, params: &mut IoUringParams) -> io::Result<OwnedFd> {
        // SAFETY: params points to a valid, writable io_uring_params
        let fd = unsafe {
            libc::syscall(
                libc::SYS_io_uring_setup,
                entries as libc::c_uint,
                params as *mut IoUringParams,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel just handed us this descriptor
        Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
    }

    fn map(&self, ring: BorrowedFd<'_>, len: usize, offset: u64) -> io::Result<MappedRegion> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                ring.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        // SAFETY: fresh mapping of exactly len bytes
        Ok(unsafe { MappedRegion::from_mmap(ptr, len) })
    }

    fn enter(
        &self,
        ring: BorrowedFd<'_>,
        to_submit: u32,
        min_complete: u32,
        flags: u32,
    ) -> io::Result<u32> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_uring_enter,
                ring.as_raw_fd(),
                to_submit as libc::c_uint,
                min_complete as libc::c_uint,
                flags as libc::c_uint,
                ptr::null::<libc::c_void>(),
                0usize,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as u32)
    }
}
