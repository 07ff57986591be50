//! Raw io_uring random-read engine.
//!
//! This crate drives io_uring by hand: it creates the ring with
//! `io_uring_setup(2)`, maps the submission ring, the submission entry table
//! and the completion ring, and moves entries across them with acquire/release
//! index hand-off. Reads land in page-aligned blocks from a recycling pool so
//! the target can be opened with `O_DIRECT`.
//!
//! # Example
//!
//! ```no_run
//! use uring_bench_core::{Engine, ReadTarget, ReapMode};
//!
//! let target = ReadTarget::open("/dev/nvme0n1")?;
//! let mut engine = Engine::new(32)?;
//! let mut policy = |blocks: u64| blocks / 2;
//!
//! engine.submit_reads(&target, 32, &mut policy)?;
//! for done in engine.drain(ReapMode::Blocking)? {
//!     assert_eq!(done.bytes, engine.block_size());
//!     engine.release(done.buffer)?;
//! }
//! # Ok::<(), uring_bench_core::Error>(())
//! ```

#![warn(clippy::all)]

mod engine;
mod error;
pub mod kernel;
pub mod pool;
mod reap;
pub mod ring;
mod submit;
pub mod sys;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use engine::Engine;
pub use error::{Error, ErrorClass, RegionKind, Result};
pub use kernel::{Kernel, MappedRegion, SysKernel};
pub use pool::{
    BlockState, Buffer, BufferId, BufferPool, PoolConfig, PoolStats, CANARY, PAGE_SIZE,
};
pub use reap::{Completion, ReapMode};
pub use ring::{Ring, RingIndex};
pub use submit::{OffsetPolicy, ReadTarget, Sequential};
