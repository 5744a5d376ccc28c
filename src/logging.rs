//! Tracing subscriber setup.
//!
//! Logs go to stderr so stdout stays clean for command output. The filter
//! comes from `RAGI_LOG` when set, otherwise from `[logging].level`.

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "RAGI_LOG";

pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .with_context(|| format!("invalid {}: {}", LOG_ENV, directives))?,
        _ => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid logging.level: {}", config.level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("initializing logging: {}", e))
}
