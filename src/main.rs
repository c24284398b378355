//! redirectd: an HTTP-to-HTTPS redirect server
//!
//! Accepts plain HTTP connections, parses just enough of the request (the
//! GET request line and the Host header) to build a `301 Moved Permanently`
//! pointing at the same URL with the HTTPS scheme, then closes the
//! connection. Built for very high connection churn with bounded memory:
//! a fixed connection pool, a single scratch buffer per worker, and no
//! per-connection allocation.

mod config;
mod http;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        max_connections = config.max_connections,
        grace_ms = config.grace_ms,
        "Starting redirectd"
    );

    runtime::run(config)?;

    Ok(())
}
