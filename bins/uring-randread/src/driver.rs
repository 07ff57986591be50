//! Steady-state driver loop
//!
//! Keeps the ring at its target occupancy: reap whatever has completed,
//! release the buffers, top submissions back up, and report throughput once
//! per interval. On stop, in-flight reads are waited for (there is no
//! cancellation) so every buffer is back in the pool before the summary.

use crate::stats::{IntervalReport, RunSummary, StopReason, ThroughputMeter};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uring_bench_core::{Engine, Kernel, OffsetPolicy, ReadTarget, ReapMode};

/// Driver loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Target number of reads in flight; clamped to the ring capacity
    pub queue_depth: u32,
    /// Stop after this long
    pub duration: Option<Duration>,
    /// Stop after this many completed reads
    pub max_reads: Option<u64>,
    /// Reporting period
    pub interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            duration: None,
            max_reads: None,
            interval: Duration::from_secs(1),
        }
    }
}

impl DriverConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            bail!("queue depth must be at least 1");
        }
        if self.interval.is_zero() {
            bail!("report interval must be non-zero");
        }
        if self.max_reads == Some(0) {
            bail!("read limit must be at least 1");
        }
        Ok(())
    }
}

/// Run the benchmark until stopped, a time limit passes, or a read limit is hit.
///
/// `on_report` receives one report per elapsed interval.
pub fn run<K, P, F>(
    engine: &mut Engine<K>,
    target: &ReadTarget,
    config: &DriverConfig,
    policy: &mut P,
    stop: &AtomicBool,
    mut on_report: F,
) -> Result<RunSummary>
where
    K: Kernel,
    P: OffsetPolicy + ?Sized,
    F: FnMut(&IntervalReport),
{
    config.validate()?;
    let depth = config.queue_depth.min(engine.capacity());
    let mut meter = ThroughputMeter::new(engine.block_size(), config.interval);
    let blocks = target.blocks(engine.block_size());
    info!(depth, blocks, "driver started");

    let stopped_by = loop {
        let now = Instant::now();
        if stop.load(Ordering::Relaxed) {
            break StopReason::Signal;
        }
        let elapsed = meter.elapsed(now);
        if config.duration.is_some_and(|limit| elapsed >= limit) {
            break StopReason::Duration;
        }
        let reads = meter.total_reads();
        if config.max_reads.is_some_and(|limit| reads >= limit) {
            break StopReason::ReadLimit;
        }

        reap_ready(engine, &mut meter, ReapMode::Blocking)?;

        let mut want = depth - engine.in_flight();
        if let Some(limit) = config.max_reads {
            let outstanding = meter.total_reads() + u64::from(engine.in_flight());
            let remaining = limit.saturating_sub(outstanding);
            want = want.min(u32::try_from(remaining).unwrap_or(u32::MAX));
        }
        if want > 0 {
            engine
                .submit_reads(target, want, &mut *policy)
                .context("submitting reads")?;
        }

        if let Some(report) = meter.tick(Instant::now(), engine.in_flight()) {
            debug!(
                reads = report.reads,
                in_flight = report.in_flight,
                "interval closed"
            );
            on_report(&report);
        }
    };

    info!(
        ?stopped_by,
        in_flight = engine.in_flight(),
        "driver stopping"
    );
    while engine.in_flight() > 0 {
        reap_ready(engine, &mut meter, ReapMode::Blocking)?;
    }

    let elapsed = meter.elapsed(Instant::now());
    Ok(RunSummary::new(
        depth,
        engine.block_size(),
        meter.total_reads(),
        elapsed,
        engine.pool().len(),
        stopped_by,
    ))
}

fn reap_ready<K: Kernel>(
    engine: &mut Engine<K>,
    meter: &mut ThroughputMeter,
    mode: ReapMode,
) -> Result<()> {
    for done in engine.drain(mode).context("reaping completions")? {
        meter.record();
        engine.release(done.buffer).context("releasing buffer")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uring_bench_core::sim::SimKernel;
    use uring_bench_core::{PoolConfig, Sequential};

    fn engine(kernel: SimKernel, capacity: u32) -> Engine<SimKernel> {
        Engine::with_kernel(kernel, capacity, PoolConfig::default()).unwrap()
    }

    fn run_seq(
        engine: &mut Engine<SimKernel>,
        target: &ReadTarget,
        config: &DriverConfig,
    ) -> Result<RunSummary> {
        let stop = AtomicBool::new(false);
        let mut policy = Sequential::default();
        run(engine, target, config, &mut policy, &stop, |_| {})
    }

    #[test]
    fn test_config_validation() {
        assert!(DriverConfig::default().validate().is_ok());
        let no_depth = DriverConfig {
            queue_depth: 0,
            ..Default::default()
        };
        let no_interval = DriverConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        let no_reads = DriverConfig {
            max_reads: Some(0),
            ..Default::default()
        };
        assert!(no_depth.validate().is_err());
        assert!(no_interval.validate().is_err());
        assert!(no_reads.validate().is_err());
    }

    #[test]
    fn test_read_limit_is_exact() {
        let kernel = SimKernel::new(SimKernel::patterned_file(64, 4096));
        let target = kernel.target().unwrap();
        let mut engine = engine(kernel, 8);
        let config = DriverConfig {
            queue_depth: 8,
            max_reads: Some(100),
            ..Default::default()
        };

        let summary = run_seq(&mut engine, &target, &config).unwrap();

        assert_eq!(summary.reads, 100);
        assert_eq!(summary.bytes, 100 * 4096);
        assert_eq!(summary.stopped_by, StopReason::ReadLimit);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.pool().free_len(), engine.pool().len());
        assert_eq!(engine.ring().kernel().stats().submitted, 100);
    }

    #[test]
    fn test_pool_bounded_by_depth() {
        let kernel = SimKernel::new(SimKernel::patterned_file(64, 4096)).reversed();
        let target = kernel.target().unwrap();
        let mut engine = engine(kernel, 16);
        let config = DriverConfig {
            queue_depth: 4,
            max_reads: Some(1000),
            ..Default::default()
        };

        let summary = run_seq(&mut engine, &target, &config).unwrap();

        assert_eq!(summary.queue_depth, 4);
        assert_eq!(summary.pool_blocks, 4);
        assert_eq!(engine.pool().stats().peak_in_use, 4);
    }

    #[test]
    fn test_stop_flag_drains_in_flight() {
        let kernel = SimKernel::new(SimKernel::patterned_file(16, 4096)).deferred();
        let target = kernel.target().unwrap();
        let mut engine = engine(kernel, 4);
        let config = DriverConfig {
            queue_depth: 4,
            ..Default::default()
        };

        let stop = AtomicBool::new(false);
        let mut calls = 0u32;
        // Raise the stop flag from inside the policy after the first batch
        let mut policy = |blocks: u64| {
            calls += 1;
            if calls == 4 {
                stop.store(true, Ordering::Relaxed);
            }
            u64::from(calls) % blocks
        };
        let summary = run(&mut engine, &target, &config, &mut policy, &stop, |_| {}).unwrap();

        assert_eq!(summary.stopped_by, StopReason::Signal);
        assert_eq!(summary.reads, 4);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.pool().free_len(), 4);
    }

    #[test]
    fn test_duration_limit() {
        let kernel = SimKernel::new(SimKernel::patterned_file(16, 4096));
        let target = kernel.target().unwrap();
        let mut engine = engine(kernel, 2);
        let config = DriverConfig {
            queue_depth: 2,
            duration: Some(Duration::from_millis(20)),
            interval: Duration::from_millis(5),
            ..Default::default()
        };

        let stop = AtomicBool::new(false);
        let mut policy = Sequential::default();
        let mut reports = Vec::new();
        let summary = run(&mut engine, &target, &config, &mut policy, &stop, |r| {
            reports.push(r.clone())
        })
        .unwrap();

        assert_eq!(summary.stopped_by, StopReason::Duration);
        assert!(summary.elapsed_secs >= 0.02);
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.in_flight <= 2));
    }

    #[test]
    fn test_failed_read_aborts_run() {
        let kernel = SimKernel::new(SimKernel::patterned_file(16, 4096));
        kernel.inject_result(-5);
        let target = kernel.target().unwrap();
        let mut engine = engine(kernel, 2);

        let config = DriverConfig {
            queue_depth: 2,
            max_reads: Some(10),
            ..Default::default()
        };
        let err = run_seq(&mut engine, &target, &config).unwrap_err();

        assert!(format!("{err:#}").contains("reaping completions"));
        match err.downcast_ref::<uring_bench_core::Error>() {
            Some(uring_bench_core::Error::CompletionFailed { errno, .. }) => {
                assert_eq!(*errno, 5);
            }
            other => panic!("expected CompletionFailed, got {other:?}"),
        }
    }
}
