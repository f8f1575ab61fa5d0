//! `tracing` subscriber setup.
//!
//! Diagnostics go to stderr so that command output on stdout stays
//! parseable. `RUST_LOG` takes precedence over the configured level.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

fn parse_level(level: &str) -> Result<Level> {
    level
        .parse::<Level>()
        .with_context(|| format!("invalid log level: '{}'", level))
}

/// Install the global subscriber. Calling it twice is harmless: the
/// second installation attempt is ignored.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}
