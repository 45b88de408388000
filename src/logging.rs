//! Tracing subscriber setup for the daemon.
//!
//! Logs always go to stderr; stdout carries the control channel. An optional
//! second sink appends plain-text lines to `<root>/logs/sessionpool.log`.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "sessionpool.log";

/// Builds the filter: `RUST_LOG` when set and valid, otherwise `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Returns the log file path inside `logs_dir`.
pub fn log_file_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(LOG_FILE_NAME)
}

/// Installs the global subscriber.
///
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init(level: &str, logs_dir: Option<&Path>) -> Result<()> {
    let file_layer = match logs_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let path = log_file_path(dir);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_falls_back_to_level() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(env_filter("debug").to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_level() {
        std::env::set_var("RUST_LOG", "sessionpool=trace");
        let filter = env_filter("warn");
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "sessionpool=trace");
    }

    #[test]
    fn test_log_file_lives_in_logs_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            log_file_path(dir.path()),
            dir.path().join("sessionpool.log")
        );
    }
}
