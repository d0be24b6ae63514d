//! Tracing subscriber setup for the `shardkit` binary.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init(logging: &LoggingSection, verbose: bool) -> Result<()> {
    let filter = build_filter(&logging.level, verbose)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match logging.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

/// `-v` raises the floor to `debug` for this crate, whatever the configured level.
fn build_filter(level: &str, verbose: bool) -> Result<EnvFilter> {
    let directive = if verbose {
        format!("{},shardkit=debug", level)
    } else {
        level.to_string()
    };
    EnvFilter::try_new(&directive).map_err(|e| anyhow!("Invalid log level '{}': {}", level, e))
}
