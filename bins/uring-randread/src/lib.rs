//! uring-randread - random O_DIRECT read benchmark over raw io_uring
//!
//! The binary is a thin CLI over these modules; they are a library so the
//! driver loop can be tested against the simulated kernel.

pub mod driver;
pub mod policy;
pub mod signal;
pub mod stats;

pub use driver::{run, DriverConfig};
pub use policy::RandomBlocks;
pub use stats::{IntervalReport, RunSummary, StopReason, ThroughputMeter};
