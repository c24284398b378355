//! Readiness-driven runtime.
//!
//! One event loop per worker thread, each owning a private connection pool,
//! scratch buffer, and SO_REUSEPORT listener; the kernel spreads incoming
//! connections across workers. There is no shared mutable state between
//! them, so scaling out is just more loops.

mod event_loop;
pub(crate) mod pool;

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use std::thread;
use tracing::{error, info};

/// Spawn the worker threads and run until they exit.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(workers = config.workers, addr = %addr, "Starting runtime");

    let mut handles = Vec::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        let config = config.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = event_loop::worker_loop(worker_id, addr, &config) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}
