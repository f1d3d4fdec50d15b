//! Configuration for the microvm operator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::runner::ControllerConfig;

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding Microvm resources and secrets.
    pub db_path: PathBuf,

    /// Number of concurrent reconcile workers.
    pub workers: usize,

    /// Full resync interval in seconds.
    pub resync_interval_secs: u64,

    /// Per-pass timeout in seconds.
    pub pass_timeout_secs: u64,

    /// HTTP request timeout for the lifecycle client, in seconds.
    pub request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Use the in-memory lifecycle service instead of HTTP.
    pub mock_remote: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration using `lookup` to read variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = lookup("MVM_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/microvm-operator/state.db"));

        let workers = parse_or(&lookup, "MVM_WORKERS", 4)?;
        anyhow::ensure!(workers > 0, "MVM_WORKERS must be at least 1");

        let resync_interval_secs: u64 = parse_or(&lookup, "MVM_RESYNC_INTERVAL", 600)?;
        anyhow::ensure!(resync_interval_secs > 0, "MVM_RESYNC_INTERVAL must be at least 1");

        let pass_timeout_secs: u64 = parse_or(&lookup, "MVM_PASS_TIMEOUT", 120)?;
        anyhow::ensure!(pass_timeout_secs > 0, "MVM_PASS_TIMEOUT must be at least 1");

        let log_level = lookup("MVM_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let mock_remote = match lookup("MVM_MOCK_REMOTE").as_deref() {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => anyhow::bail!("invalid MVM_MOCK_REMOTE value: {other}"),
        };

        Ok(Self {
            db_path,
            workers,
            resync_interval_secs,
            pass_timeout_secs,
            request_timeout_secs: parse_or(&lookup, "MVM_REQUEST_TIMEOUT", 30)?,
            log_level,
            mock_remote,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Runner settings derived from this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            ..ControllerConfig::default()
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {name} value: {value:?}")),
        None => Ok(default),
    }
}
