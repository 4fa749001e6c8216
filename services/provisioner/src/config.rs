//! Configuration for the provisioner.

use std::time::Duration;

use anyhow::{Context, Result};
use cloudself_reconcile::{DEFAULT_ERROR_BACKOFF, DEFAULT_POLL_INTERVAL, DEFAULT_REQUEUE_DELAY};

use crate::backend::DEFAULT_TIMEOUT;

/// Provisioner configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend API base URL (example: http://localhost:3000).
    pub backend_url: String,

    /// Namespace holding Websites and their child objects.
    pub namespace: String,

    /// Minimum spacing between backend polls.
    pub poll_interval: Duration,

    /// Delay before re-checking a website that is still starting.
    pub requeue_delay: Duration,

    /// Backoff after a failed reconciliation pass.
    pub error_backoff: Duration,

    /// Timeout for each backend request.
    pub backend_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_url = lookup("CLOUDSELF_BACKEND_URL")
            .unwrap_or_else(|| "http://localhost:3000".to_string());

        let namespace = lookup("CLOUDSELF_NAMESPACE").unwrap_or_else(|| "default".to_string());

        let poll_interval = secs(&lookup, "CLOUDSELF_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL)?;
        let requeue_delay = secs(&lookup, "CLOUDSELF_REQUEUE_SECS", DEFAULT_REQUEUE_DELAY)?;
        let error_backoff = secs(&lookup, "CLOUDSELF_ERROR_BACKOFF_SECS", DEFAULT_ERROR_BACKOFF)?;
        let backend_timeout = secs(&lookup, "CLOUDSELF_BACKEND_TIMEOUT_SECS", DEFAULT_TIMEOUT)?;

        let log_level = lookup("CLOUDSELF_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            backend_url,
            namespace,
            poll_interval,
            requeue_delay,
            error_backoff,
            backend_timeout,
            log_level,
        })
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let value: Option<u64> = lookup(key)
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("{key} must be an integer (seconds)."))?;

    Ok(value
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or(default))
}
