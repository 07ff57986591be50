//! # uring-bench
//!
//! Random-read benchmark engine driven through raw io_uring.
//!
//! This is the workspace root crate that re-exports core functionality.
//! For direct usage, depend on individual sub-crates:
//!
//! - [`uring-bench-core`] - ring setup, buffer pool, submission and reaping
//! - [`uring-randread`] - CLI tool (`uring-randread` binary) and driver loop

pub use uring_bench_core::*;
