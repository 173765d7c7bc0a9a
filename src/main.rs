//! compute-server: a thread-pool connection server
//!
//! Clients connect over a Unix or TCP socket and send newline-terminated
//! requests such as `100 + 2 102`; each request gets one reply line.
//!
//! Features:
//! - Fixed worker pool draining a FIFO connection queue
//! - Bounded admission of connections waiting for a worker
//! - Orderly shutdown on SIGINT/SIGTERM that drains in-flight sessions
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;
mod server;

use config::Config;
use runtime::{Acceptor, Listener};
use server::Server;
use tracing::{info, warn};
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
        max_pending = config.max_pending,
        stack_size = config.stack_size,
        "Starting compute-server"
    );

    let listener = Listener::bind(&config.listen)?;
    let mut acceptor = Acceptor::new(listener)?;
    let server = Server::start(&config.pool())?;

    // Handle SIGINT/SIGTERM by requesting shutdown and waking the acceptor
    let shutdown = server.shutdown_handle();
    let waker = acceptor.waker();
    ctrlc::set_handler(move || {
        shutdown.request();
        if let Err(e) = waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }
    })?;

    let result = acceptor.run(&server);
    server.destroy();
    result?;

    info!("Server stopped");
    Ok(())
}
