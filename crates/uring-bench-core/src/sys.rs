//! Raw io_uring kernel interface definitions
//!
//! Direct port of the parts of Linux include/uapi/linux/io_uring.h that the
//! read engine needs. No liburing, no io-uring crate: the rings are mapped and
//! driven by hand through `io_uring_setup(2)` and `io_uring_enter(2)`.

use std::mem::size_of;

// ============================================================================
// mmap region selectors
// ============================================================================

/// Submission ring (head, tail, mask, index array)
pub const IORING_OFF_SQ_RING: u64 = 0;
/// Completion ring (head, tail, mask, CQE array)
pub const IORING_OFF_CQ_RING: u64 = 0x0800_0000;
/// Submission entry table
pub const IORING_OFF_SQES: u64 = 0x1000_0000;

// ============================================================================
// Opcodes and flags
// ============================================================================

pub const IORING_OP_NOP: u8 = 0;
pub const IORING_OP_READ: u8 = 22;

/// `io_uring_enter(2)`: wait for `min_complete` completions before returning
pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;

/// Kernel maps SQ and CQ rings with a single mmap (5.4+)
pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;

/// Largest submission depth the kernel accepts
pub const IORING_MAX_ENTRIES: u32 = 32768;

// ============================================================================
// Kernel Structures
// ============================================================================

/// Submission ring offsets (40 bytes) - matches kernel io_sqring_offsets
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// Completion ring offsets (40 bytes) - matches kernel io_cqring_offsets
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// Setup parameters (120 bytes) - matches kernel io_uring_params
///
/// Filled in by `io_uring_setup(2)`: the kernel writes back the negotiated
/// entry counts and the byte offsets of every ring field.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

/// Submission queue entry (64 bytes) - matches kernel io_uring_sqe
///
/// Unions are flattened to the member the read path uses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoUringSqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub rw_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub file_index: u32,
    pub addr3: u64,
    pub pad2: u64,
}

impl IoUringSqe {
    /// Build an `IORING_OP_READ` of `len` bytes at `off` into `addr`
    #[inline]
    pub fn read(fd: i32, off: u64, addr: u64, len: u32, user_data: u64) -> Self {
        Self {
            opcode: IORING_OP_READ,
            fd,
            off,
            addr,
            len,
            user_data,
            ..Default::default()
        }
    }
}

/// Completion queue entry (16 bytes) - matches kernel io_uring_cqe
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoUringCqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

// ============================================================================
// Region sizes
// ============================================================================

/// Bytes to map for the submission ring: everything up to the end of the index array
#[inline]
pub const fn sq_ring_len(p: &IoUringParams) -> usize {
    p.sq_off.array as usize + (p.sq_entries as usize) * size_of::<u32>()
}

/// Bytes to map for the submission entry table
#[inline]
pub const fn sqes_len(p: &IoUringParams) -> usize {
    (p.sq_entries as usize) * size_of::<IoUringSqe>()
}

/// Bytes to map for the completion ring: everything up to the end of the CQE array
#[inline]
pub const fn cq_ring_len(p: &IoUringParams) -> usize {
    p.cq_off.cqes as usize + (p.cq_entries as usize) * size_of::<IoUringCqe>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    // ========================================================================
    // Struct layout
    // ========================================================================

    #[test]
    fn test_sq_ring_offsets_size() {
        assert_eq!(size_of::<SqRingOffsets>(), 40);
    }

    #[test]
    fn test_cq_ring_offsets_size() {
        assert_eq!(size_of::<CqRingOffsets>(), 40);
    }

    #[test]
    fn test_params_size() {
        assert_eq!(size_of::<IoUringParams>(), 120);
    }

    #[test]
    fn test_params_layout() {
        // __u32 sq_entries      @ 0
        // __u32 cq_entries      @ 4
        // __u32 flags           @ 8
        // __u32 sq_thread_cpu   @ 12
        // __u32 sq_thread_idle  @ 16
        // __u32 features        @ 20
        // __u32 wq_fd           @ 24
        // __u32 resv[3]         @ 28
        // io_sqring_offsets     @ 40
        // io_cqring_offsets     @ 80
        assert_eq!(offset_of!(IoUringParams, sq_entries), 0);
        assert_eq!(offset_of!(IoUringParams, cq_entries), 4);
        assert_eq!(offset_of!(IoUringParams, flags), 8);
        assert_eq!(offset_of!(IoUringParams, features), 20);
        assert_eq!(offset_of!(IoUringParams, wq_fd), 24);
        assert_eq!(offset_of!(IoUringParams, resv), 28);
        assert_eq!(offset_of!(IoUringParams, sq_off), 40);
        assert_eq!(offset_of!(IoUringParams, cq_off), 80);
    }

    #[test]
    fn test_sqe_size() {
        assert_eq!(size_of::<IoUringSqe>(), 64, "io_uring_sqe must be 64 bytes");
    }

    #[test]
    fn test_sqe_layout() {
        // __u8  opcode      @ 0
        // __u8  flags       @ 1
        // __u16 ioprio      @ 2
        // __s32 fd          @ 4
        // __u64 off         @ 8
        // __u64 addr        @ 16
        // __u32 len         @ 24
        // __u32 rw_flags    @ 28
        // __u64 user_data   @ 32
        // __u16 buf_index   @ 40
        // __u16 personality @ 42
        // __u32 file_index  @ 44
        // __u64 addr3       @ 48
        assert_eq!(offset_of!(IoUringSqe, opcode), 0);
        assert_eq!(offset_of!(IoUringSqe, flags), 1);
        assert_eq!(offset_of!(IoUringSqe, ioprio), 2);
        assert_eq!(offset_of!(IoUringSqe, fd), 4);
        assert_eq!(offset_of!(IoUringSqe, off), 8);
        assert_eq!(offset_of!(IoUringSqe, addr), 16);
        assert_eq!(offset_of!(IoUringSqe, len), 24);
        assert_eq!(offset_of!(IoUringSqe, rw_flags), 28);
        assert_eq!(offset_of!(IoUringSqe, user_data), 32);
        assert_eq!(offset_of!(IoUringSqe, buf_index), 40);
        assert_eq!(offset_of!(IoUringSqe, personality), 42);
        assert_eq!(offset_of!(IoUringSqe, file_index), 44);
        assert_eq!(offset_of!(IoUringSqe, addr3), 48);
    }

    #[test]
    fn test_cqe_layout() {
        // __u64 user_data @ 0
        // __s32 res       @ 8
        // __u32 flags     @ 12
        assert_eq!(size_of::<IoUringCqe>(), 16);
        assert_eq!(offset_of!(IoUringCqe, user_data), 0);
        assert_eq!(offset_of!(IoUringCqe, res), 8);
        assert_eq!(offset_of!(IoUringCqe, flags), 12);
    }

    #[test]
    fn test_struct_alignment() {
        assert_eq!(align_of::<IoUringParams>(), 8);
        assert_eq!(align_of::<IoUringSqe>(), 8);
        assert_eq!(align_of::<IoUringCqe>(), 8);
    }

    // ========================================================================
    // Constants
    // ========================================================================

    #[test]
    fn test_mmap_offsets() {
        assert_eq!(IORING_OFF_SQ_RING, 0);
        assert_eq!(IORING_OFF_CQ_RING, 0x8000000);
        assert_eq!(IORING_OFF_SQES, 0x10000000);
    }

    #[test]
    fn test_opcodes() {
        assert_eq!(IORING_OP_NOP, 0);
        assert_eq!(IORING_OP_READ, 22);
    }

    #[test]
    fn test_enter_flags() {
        assert_eq!(IORING_ENTER_GETEVENTS, 1);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    #[test]
    fn test_read_sqe() {
        let sqe = IoUringSqe::read(7, 8192, 0x1000, 4096, 42);
        assert_eq!(sqe.opcode, IORING_OP_READ);
        assert_eq!(sqe.fd, 7);
        assert_eq!(sqe.off, 8192);
        assert_eq!(sqe.addr, 0x1000);
        assert_eq!(sqe.len, 4096);
        assert_eq!(sqe.user_data, 42);
        assert_eq!(sqe.flags, 0);
        assert_eq!(sqe.rw_flags, 0);
    }

    #[test]
    fn test_region_lengths() {
        let mut p = IoUringParams {
            sq_entries: 8,
            cq_entries: 16,
            ..Default::default()
        };
        p.sq_off.array = 64;
        p.cq_off.cqes = 64;

        assert_eq!(sq_ring_len(&p), 64 + 8 * 4);
        assert_eq!(sqes_len(&p), 8 * 64);
        assert_eq!(cq_ring_len(&p), 64 + 16 * 16);
    }

    #[test]
    fn test_params_default_zeroed() {
        let p = IoUringParams::default();
        assert_eq!(p.sq_entries, 0);
        assert_eq!(p.flags, 0);
        assert_eq!(p.resv, [0; 3]);
        assert_eq!(p.sq_off, SqRingOffsets::default());
    }
}
