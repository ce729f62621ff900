//! # Logging Setup
//!
//! Two `tracing` sinks share one filter: human-readable output on stdout and a
//! plain-text append-only file at `<logging.dir>/<logging.file_name>.log`.
//!
//! `RUST_LOG`, when set, replaces the filter derived from `logging.level`.

use crate::config::AppConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Fails if the log file cannot be opened or a
/// subscriber is already installed.
pub fn init(config: &AppConfig) -> Result<()> {
    let path = config.log_file();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives(config))),
        )
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn default_directives(config: &AppConfig) -> String {
    format!(
        "warn,asr_gateway={level},actix_web=info,actix_server=info",
        level = config.logging.level
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_default_directives_follow_level() {
        let mut config = AppConfig::default();
        config.logging.level = LogLevel::Debug;
        let directives = default_directives(&config);
        assert!(directives.contains("asr_gateway=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_unwritable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.logging.dir = dir.path().join("missing").join("nested");
        assert!(init(&config).is_err());
    }
}
