//! Client configuration.
//!
//! Tuning for the stream client, loadable from a JSON file whose keys are
//! camelCase:
//! - heartbeat watchdog timeout
//! - backoff base, cap and jitter window
//! - reconnect budget
//! - retention of finished jobs

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::stream::BackoffPolicy;

/// Stream client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Silence allowed before the connection is declared dead.
    pub heartbeat_timeout_ms: u64,
    /// First reconnect delay.
    pub backoff_base_ms: u64,
    /// Upper bound for the exponential part of the delay.
    pub backoff_max_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Width of the uniform jitter added to each delay.
    pub jitter_ms: u64,
    /// How long completed and failed jobs are kept. `None` keeps them forever.
    pub terminal_job_ttl_ms: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_reconnect_attempts: 10,
            jitter_ms: 1_000,
            terminal_job_ttl_ms: Some(600_000),
        }
    }
}

impl StreamConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StreamError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, StreamError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| StreamError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string_pretty(self).map_err(|e| StreamError::Config(e.to_string()))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.heartbeat_timeout_ms < 1_000 {
            return Err(StreamError::Config(
                "heartbeatTimeoutMs must be at least 1000".to_string(),
            ));
        }

        if self.backoff_base_ms == 0 {
            return Err(StreamError::Config(
                "backoffBaseMs must be greater than 0".to_string(),
            ));
        }

        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(StreamError::Config(
                "backoffMaxMs must not be smaller than backoffBaseMs".to_string(),
            ));
        }

        if self.max_reconnect_attempts == 0 {
            return Err(StreamError::Config(
                "maxReconnectAttempts must be greater than 0".to_string(),
            ));
        }

        if self.terminal_job_ttl_ms == Some(0) {
            return Err(StreamError::Config(
                "terminalJobTtlMs must be greater than 0 or null".to_string(),
            ));
        }

        Ok(())
    }

    /// Watchdog timeout.
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Retention for finished jobs.
    #[must_use]
    pub fn terminal_job_ttl(&self) -> Option<Duration> {
        self.terminal_job_ttl_ms.map(Duration::from_millis)
    }

    /// Backoff policy built from the backoff settings.
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            Duration::from_millis(self.jitter_ms),
        )
    }
}
