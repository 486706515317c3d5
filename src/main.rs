//! filedepot: a TCP file-transfer server.
//!
//! Clients send a text command header terminated by `\r\n\r\n`:
//! - `UPLOAD <name> <size>` followed by `size` bytes of base64 payload
//! - `GET <name>` for the raw file bytes
//! - `LIST` and `DELETE <name>` for namespace maintenance
//!
//! Features:
//! - Streaming base64 upload decoding with O(chunk) memory
//! - Flat on-disk storage namespace with basename sanitation
//! - Three dispatch strategies: single, thread pool, process pool
//! - Configuration via CLI arguments or TOML file

mod config;
mod dispatch;
mod handler;
mod protocol;
mod storage;

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
        host = %config.host,
        port = config.port,
        mode = ?config.mode,
        workers = config.workers,
        storage = %config.storage_root.display(),
        timeout_secs = config.timeout_secs,
        "Starting filedepot server"
    );

    dispatch::run(config)?;
    Ok(())
}
