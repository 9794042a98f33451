//! Monitoring configuration.
//!
//! A single [`MonitorConfig`] is passed explicitly into the registry,
//! aggregator and API client. It replaces process-wide address
//! constants.

use std::str::FromStr;
use std::time::Duration;

use callcoach_core::types::JobId;

use crate::reconnect::ReconnectPolicy;

/// Default backend address for local development.
pub const DEFAULT_BASE_ADDRESS: &str = "http://localhost:8000";

/// Reconnect attempts allowed before a channel is abandoned.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay of the linear reconnect backoff, in milliseconds.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Interval between status polls once a channel has been abandoned.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;

/// HTTP request timeout for REST calls.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the progress monitoring subsystem.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// HTTP base address of the backend, e.g. `http://host:8000`.
    pub base_address: String,
    /// Reconnect attempts allowed after a channel drops.
    pub max_reconnect_attempts: u32,
    /// Delay unit of the linear backoff (`delay = base * attempt`).
    pub reconnect_base_delay: Duration,
    /// Interval between polls of the status endpoint.
    pub poll_interval: Duration,
    /// Timeout applied to every REST request.
    pub request_timeout: Duration,
}

impl MonitorConfig {
    /// Create a configuration for `base_address` with default tuning.
    pub fn new(base_address: impl Into<String>) -> Self {
        let base_address = base_address.into().trim_end_matches('/').to_string();
        Self {
            base_address,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                 |
    /// |-----------------------------|-------------------------|
    /// | `CALLCOACH_API_URL`         | `http://localhost:8000` |
    /// | `RECONNECT_MAX_ATTEMPTS`    | `5`                     |
    /// | `RECONNECT_BASE_DELAY_MS`   | `1000`                  |
    /// | `STATUS_POLL_INTERVAL_SECS` | `3`                     |
    /// | `REQUEST_TIMEOUT_SECS`      | `30`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_address =
            lookup("CALLCOACH_API_URL").unwrap_or_else(|| DEFAULT_BASE_ADDRESS.to_string());
        if !(base_address.starts_with("http://") || base_address.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "CALLCOACH_API_URL",
                value: base_address,
                reason: "must start with http:// or https://".into(),
            });
        }

        let max_reconnect_attempts = parse_or(
            &lookup,
            "RECONNECT_MAX_ATTEMPTS",
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
        )?;
        let base_delay_ms = parse_or(
            &lookup,
            "RECONNECT_BASE_DELAY_MS",
            DEFAULT_RECONNECT_BASE_DELAY_MS,
        )?;
        let poll_secs = parse_or(
            &lookup,
            "STATUS_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
        )?;
        if poll_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "STATUS_POLL_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least one second".into(),
            });
        }
        let timeout_secs = parse_or(&lookup, "REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?;

        Ok(Self {
            max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(base_delay_ms),
            poll_interval: Duration::from_secs(poll_secs),
            request_timeout: Duration::from_secs(timeout_secs),
            ..Self::new(base_address)
        })
    }

    /// Push-channel base address derived from the HTTP base address.
    pub fn ws_address(&self) -> String {
        if let Some(rest) = self.base_address.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_address.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_address.clone()
        }
    }

    /// Push-channel endpoint for a single job.
    pub fn channel_url(&self, job_id: JobId) -> String {
        format!("{}/ws/analyze/{job_id}", self.ws_address())
    }

    /// A fresh reconnect policy for one channel.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.max_reconnect_attempts, self.reconnect_base_delay)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_ADDRESS)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
