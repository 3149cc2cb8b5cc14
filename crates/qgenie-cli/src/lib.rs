//! qgenie CLI - pack, unpack, inspect and resolve model bundles.

pub mod cli;
pub mod commands;

use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the stderr log subscriber.
///
/// `RUST_LOG` wins when set; otherwise `debug` selects DEBUG over INFO.
pub fn init_logging(debug: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.with_max_level(log_level).init(),
    }
}
