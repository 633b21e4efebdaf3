//! chatd server binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chatd::config::Config;
use chatd::runtime;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        threads = config.threads,
        runtime = ?config.runtime,
        "starting chatd"
    );

    let shutdown = install_signal_handler();
    runtime::run(&config, shutdown)?;

    info!("server shutdown complete");
    Ok(())
}

/// Install a SIGINT/SIGTERM handler that flips the shutdown flag. A
/// second signal forces immediate exit.
fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("second signal, forcing exit");
            std::process::exit(1);
        }
        tracing::info!("shutdown signal received");
    })
    .expect("failed to install signal handler");

    shutdown
}
