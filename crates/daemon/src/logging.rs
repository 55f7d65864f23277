//! Tracing initialization for the daemon.

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use sockpool_config::LoggingConfig;

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies.
/// With a log file configured, output goes there in append mode
/// without ANSI colors.
pub fn init(config: &LoggingConfig) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_target(true)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}
