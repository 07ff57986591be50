//! Error types for uring-bench-core.
//!
//! Every variant is fatal to the benchmark; the classification only tells the
//! caller which phase broke.

use nix::libc;
use thiserror::Error;

/// Which shared region a mapping error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    SubmissionRing,
    SubmissionEntries,
    CompletionRing,
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegionKind::SubmissionRing => "submission ring",
            RegionKind::SubmissionEntries => "submission entries",
            RegionKind::CompletionRing => "completion ring",
        };
        f.write_str(name)
    }
}

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Ring creation, region mapping, invalid configuration
    Setup,
    /// Kernel/user desynchronization or a buffer-lifetime bug
    Protocol,
    /// Out of memory for I/O buffers
    Resource,
}

/// Errors raised by the ring engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Requested ring depth is outside 1..=32768.
    #[error("invalid ring capacity {0}: must be between 1 and 32768")]
    InvalidCapacity(u32),

    /// Pool configuration rejected.
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),

    /// `io_uring_setup(2)` failed.
    #[error("io_uring_setup failed: {0}")]
    Setup(#[source] std::io::Error),

    /// Mapping one of the three shared regions failed.
    #[error("failed to mmap {region}: {source}")]
    Mmap {
        region: RegionKind,
        #[source]
        source: std::io::Error,
    },

    /// The kernel reported a field offset outside its own region.
    #[error("{region} field at {offset}+{size} exceeds mapped length {len}")]
    RegionBounds {
        region: RegionKind,
        offset: usize,
        size: usize,
        len: usize,
    },

    /// Opening or inspecting the target file failed.
    #[error("cannot open read target: {0}")]
    Target(#[source] std::io::Error),

    /// The target file holds less than one block.
    #[error("file of {size} bytes is smaller than one {block_size}-byte block")]
    FileTooSmall { size: u64, block_size: usize },

    /// `io_uring_enter(2)` failed.
    #[error("io_uring_enter failed: {0}")]
    Enter(#[source] std::io::Error),

    /// The kernel accepted fewer entries than were published.
    #[error("partial submit: published {requested}, kernel accepted {accepted}")]
    PartialSubmit { requested: u32, accepted: u32 },

    /// A completion carried a negative result.
    #[error("read for tag {tag} failed: {}", os_error(.errno))]
    CompletionFailed { tag: u64, errno: i32 },

    /// A completion transferred fewer bytes than one block.
    #[error("short read for tag {tag}: expected {expected} bytes, got {actual}")]
    ShortRead {
        tag: u64,
        expected: usize,
        actual: usize,
    },

    /// A blocking wait returned but the completion ring was still empty.
    #[error("completion ring empty after waiting for a completion")]
    EmptyAfterWait,

    /// Completion ring indices claim more entries than the ring holds.
    #[error("completion ring desync: head {head}, tail {tail}, size {entries}")]
    RingDesync { head: u32, tail: u32, entries: u32 },

    /// A completion tag does not name a buffer on loan to the kernel.
    #[error("completion tag {0} does not match any in-flight buffer")]
    UnknownTag(u64),

    /// A free buffer's canary was overwritten.
    #[error("buffer {id} canary overwritten: {found:#x}, expected {expected:#x}")]
    CanaryMismatch { id: u32, found: u64, expected: u64 },

    /// A buffer was released while not held by the caller.
    #[error("buffer {0} released while not held")]
    DoubleRelease(u32),

    /// A buffer handle was presented to a pool that did not issue it.
    #[error("buffer {0} does not belong to this pool")]
    ForeignBuffer(u32),

    /// Allocating a new aligned block failed.
    #[error("buffer allocation failed: {0}")]
    Alloc(#[source] std::io::Error),

    /// The pool ran out of buffer ids.
    #[error("buffer pool exhausted at {0} blocks")]
    PoolExhausted(usize),
}

impl Error {
    /// Classify into setup / protocol / resource errors.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidCapacity(_)
            | Self::InvalidConfig(_)
            | Self::Setup(_)
            | Self::Mmap { .. }
            | Self::RegionBounds { .. }
            | Self::Target(_)
            | Self::FileTooSmall { .. } => ErrorClass::Setup,
            Self::Alloc(_) | Self::PoolExhausted(_) => ErrorClass::Resource,
            Self::Enter(_)
            | Self::PartialSubmit { .. }
            | Self::CompletionFailed { .. }
            | Self::ShortRead { .. }
            | Self::EmptyAfterWait
            | Self::RingDesync { .. }
            | Self::UnknownTag(_)
            | Self::CanaryMismatch { .. }
            | Self::DoubleRelease(_)
            | Self::ForeignBuffer(_) => ErrorClass::Protocol,
        }
    }

    /// Convert to negative errno. The CLI exits with its magnitude.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::InvalidCapacity(_) | Self::InvalidConfig(_) => -libc::EINVAL,
            Self::Setup(e) | Self::Target(e) | Self::Enter(e) => {
                -e.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::Mmap { source, .. } => -source.raw_os_error().unwrap_or(libc::ENOMEM),
            Self::Alloc(e) => -e.raw_os_error().unwrap_or(libc::ENOMEM),
            Self::PoolExhausted(_) => -libc::ENOMEM,
            Self::FileTooSmall { .. } => -libc::EINVAL,
            Self::CompletionFailed { errno, .. } => -errno,
            Self::RegionBounds { .. }
            | Self::PartialSubmit { .. }
            | Self::ShortRead { .. }
            | Self::EmptyAfterWait
            | Self::RingDesync { .. }
            | Self::UnknownTag(_)
            | Self::CanaryMismatch { .. }
            | Self::DoubleRelease(_)
            | Self::ForeignBuffer(_) => -libc::EPROTO,
        }
    }
}

fn os_error(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

/// Result type for ring engine operations.
pub type Result<T> = std::result::Result<T, Error>;
