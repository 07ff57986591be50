//! uring-randread - random read benchmark over raw io_uring
//!
//! Keeps `SQ_SIZE` block reads in flight against a file opened with
//! `O_DIRECT` and prints the completion rate once per interval.
//!
//! # Usage
//!
//! ```bash
//! # 32 reads in flight against a device, report every second
//! uring-randread 32 /dev/nvme0n1
//!
//! # Ten-second reproducible run with a JSON summary
//! uring-randread --duration 10 --seed 7 --format json 64 /data/big.img
//! ```

mod cli;

use clap::Parser;
use cli::Cli;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(cause) = cli::engine_error(&err) {
                error!(
                    class = ?cause.class(),
                    errno = cause.to_errno(),
                    "benchmark aborted"
                );
            }
            eprintln!("Error: {err:?}");
            ExitCode::from(cli::exit_code(&err))
        }
    }
}
