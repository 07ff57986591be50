//! Graceful shutdown on SIGINT/SIGTERM
//!
//! The first signal sets the stop flag; the driver finishes its iteration,
//! waits for in-flight reads and prints the summary. A second signal exits
//! immediately.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Install the SIGINT/SIGTERM handler and return the flag it sets.
pub fn install_stop_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();

    ctrlc::set_handler(move || {
        if stop_clone.load(Ordering::Relaxed) {
            warn!("Received second interrupt, forcing exit");
            std::process::exit(1);
        }
        info!("Received shutdown signal, draining in-flight reads");
        stop_clone.store(true, Ordering::Relaxed);
    })
    .context("failed to install signal handler")?;

    Ok(stop)
}
