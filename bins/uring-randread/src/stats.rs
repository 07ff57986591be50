//! Throughput accounting for the driver loop

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

const MIB: f64 = 1024.0 * 1024.0;

/// Counts completed reads and cuts them into fixed reporting intervals.
#[derive(Debug)]
pub struct ThroughputMeter {
    block_size: usize,
    interval: Duration,
    started: Instant,
    last_report: Instant,
    total_reads: u64,
    interval_reads: u64,
}

impl ThroughputMeter {
    pub fn new(block_size: usize, interval: Duration) -> Self {
        Self::starting_at(block_size, interval, Instant::now())
    }

    pub fn starting_at(block_size: usize, interval: Duration, now: Instant) -> Self {
        Self {
            block_size,
            interval,
            started: now,
            last_report: now,
            total_reads: 0,
            interval_reads: 0,
        }
    }

    /// Record one completed read
    #[inline]
    pub fn record(&mut self) {
        self.total_reads += 1;
        self.interval_reads += 1;
    }

    /// Reads completed since the start
    pub fn total_reads(&self) -> u64 {
        self.total_reads
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Close the current interval if it has run its length.
    pub fn tick(&mut self, now: Instant, in_flight: u32) -> Option<IntervalReport> {
        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed < self.interval {
            return None;
        }
        let report = IntervalReport {
            in_flight,
            reads: self.interval_reads,
            elapsed,
            block_size: self.block_size,
        };
        self.interval_reads = 0;
        self.last_report = now;
        Some(report)
    }
}

/// Throughput over one reporting interval
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalReport {
    pub in_flight: u32,
    pub reads: u64,
    pub elapsed: Duration,
    pub block_size: usize,
}

impl IntervalReport {
    /// Completed reads per second
    pub fn reads_per_sec(&self) -> f64 {
        rate(self.reads as f64, self.elapsed)
    }

    /// Read bandwidth in MiB/s
    pub fn mib_per_sec(&self) -> f64 {
        let mib = self.reads as f64 * self.block_size as f64 / MIB;
        rate(mib, self.elapsed)
    }
}

impl fmt::Display for IntervalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in_flight: {}, read_blocks/s: {:.2}K, read_bytes: {:.2} MiB/s",
            self.in_flight,
            self.reads_per_sec() / 1000.0,
            self.mib_per_sec()
        )
    }
}

/// Why the driver loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// SIGINT/SIGTERM
    Signal,
    /// `--duration` elapsed
    Duration,
    /// `--reads` completed
    ReadLimit,
}

/// Whole-run results, printed at exit
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub version: String,
    pub queue_depth: u32,
    pub block_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub elapsed_secs: f64,
    pub reads: u64,
    pub bytes: u64,
    pub iops: f64,
    pub mib_per_sec: f64,
    pub pool_blocks: usize,
    pub stopped_by: StopReason,
}

impl RunSummary {
    pub fn new(
        queue_depth: u32,
        block_size: usize,
        reads: u64,
        elapsed: Duration,
        pool_blocks: usize,
        stopped_by: StopReason,
    ) -> Self {
        let bytes = reads * block_size as u64;
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            queue_depth,
            block_size,
            seed: None,
            elapsed_secs: elapsed.as_secs_f64(),
            reads,
            bytes,
            iops: rate(reads as f64, elapsed),
            mib_per_sec: rate(bytes as f64 / MIB, elapsed),
            pool_blocks,
            stopped_by,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== uring-randread summary ===")?;
        writeln!(f, "queue depth:  {}", self.queue_depth)?;
        writeln!(f, "block size:   {} bytes", self.block_size)?;
        if let Some(seed) = self.seed {
            writeln!(f, "seed:         {seed}")?;
        }
        writeln!(f, "elapsed:      {:.2} s", self.elapsed_secs)?;
        writeln!(f, "reads:        {}", self.reads)?;
        writeln!(f, "IOPS:         {:.2}K", self.iops / 1000.0)?;
        writeln!(f, "bandwidth:    {:.2} MiB/s", self.mib_per_sec)?;
        writeln!(f, "pool blocks:  {}", self.pool_blocks)?;
        write!(f, "stopped by:   {:?}", self.stopped_by)
    }
}

fn rate(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        amount / secs
    } else {
        0.0
    }
}
