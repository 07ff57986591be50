//! Command-line interface for uring-randread

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use uring_bench_core::{Engine, PoolConfig, ReadTarget, SysKernel};
use uring_randread::{driver, signal, DriverConfig, IntervalReport, RandomBlocks};

/// uring-randread - random read benchmark over raw io_uring
#[derive(Parser, Debug)]
#[command(name = "uring-randread")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Submission queue depth (reads kept in flight)
    #[arg(value_parser = clap::value_parser!(u32).range(1..=32768))]
    pub sq_size: u32,

    /// File or block device to read (opened with O_DIRECT)
    pub file: PathBuf,

    /// Bytes per read; a multiple of 512
    #[arg(short, long, default_value = "4096")]
    pub block_size: usize,

    /// Stop after this many seconds
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// Stop after this many completed reads
    #[arg(short = 'n', long)]
    pub reads: Option<u64>,

    /// Report interval in milliseconds
    #[arg(short, long, default_value = "1000")]
    pub interval: u64,

    /// Seed for block selection (random if omitted)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Summary output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Summary output format
#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable report lines and summary
    #[default]
    Text,
    /// Final summary as JSON; interval reports go to the log
    Json,
}

impl Cli {
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            queue_depth: self.sq_size,
            duration: self.duration.map(Duration::from_secs),
            max_reads: self.reads,
            interval: Duration::from_millis(self.interval),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::with_block_size(self.block_size)
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let config = cli.driver_config();
    config.validate()?;
    let pool = cli.pool_config();
    pool.validate().context("invalid --block-size")?;

    let target = ReadTarget::open(&cli.file)
        .with_context(|| format!("opening {}", cli.file.display()))?;
    let mut engine = Engine::with_kernel(SysKernel, cli.sq_size, pool)
        .context("initializing io_uring")?;

    let text = cli.format == OutputFormat::Text;
    if text {
        println!("init_ring: sq_size={}", cli.sq_size);
        println!("SQ: {} entries", engine.ring().sq_entries());
        println!("CQ: {} entries", engine.ring().cq_entries());
    }
    info!(
        file = %cli.file.display(),
        size = target.size(),
        block_size = cli.block_size,
        "read target opened"
    );

    let mut policy = match cli.seed {
        Some(seed) => RandomBlocks::seeded(seed),
        None => RandomBlocks::from_entropy(),
    };
    let seed = policy.seed();
    let stop = signal::install_stop_flag()?;

    let on_report = |report: &IntervalReport| {
        if text {
            println!("{report}");
        } else {
            info!(
                in_flight = report.in_flight,
                reads_per_sec = report.reads_per_sec(),
                mib_per_sec = report.mib_per_sec(),
                "interval"
            );
        }
    };
    let summary = driver::run(&mut engine, &target, &config, &mut policy, &stop, on_report)?;
    let summary = summary.with_seed(Some(seed));

    match cli.format {
        OutputFormat::Text => println!("{summary}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}

/// The engine error at the root of a failed run, if any.
pub fn engine_error(err: &anyhow::Error) -> Option<&uring_bench_core::Error> {
    err.chain().find_map(|cause| cause.downcast_ref())
}

/// Process exit status for a failed run.
///
/// Engine errors exit with their errno; anything else exits with 1.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    engine_error(err)
        .and_then(|cause| u8::try_from(-cause.to_errno()).ok())
        .filter(|&code| code != 0)
        .unwrap_or(1)
}
