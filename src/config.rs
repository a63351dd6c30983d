//! Session configuration
//!
//! All fields have defaults, so an empty JSON object is a valid config.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables shared by client and server sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Sleep between iterations of the server run loop, in milliseconds
    ///
    /// Trades latency for CPU usage: a stop request or a new message is
    /// noticed at most one tick late.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Maximum messages drained per connection per receive step
    #[serde(default = "default_receive_batch_size")]
    pub receive_batch_size: usize,

    /// Maximum accepted connections on a server (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Close reason sent to every client when the server stops
    #[serde(default = "default_shutdown_reason")]
    pub shutdown_reason: String,

    /// Close reason sent when a client disconnects
    #[serde(default = "default_disconnect_reason")]
    pub disconnect_reason: String,

    /// Close reason sent to an incoming connection the server declines
    #[serde(default = "default_reject_reason")]
    pub reject_reason: String,
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_receive_batch_size() -> usize {
    16
}

fn default_shutdown_reason() -> String {
    "Server shutting down".to_string()
}

fn default_disconnect_reason() -> String {
    "Client disconnecting".to_string()
}

fn default_reject_reason() -> String {
    "Failed to accept (server busy?)".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            receive_batch_size: default_receive_batch_size(),
            max_connections: None,
            shutdown_reason: default_shutdown_reason(),
            disconnect_reason: default_disconnect_reason(),
            reject_reason: default_reject_reason(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json).map_err(|e| {
            SessionError::Config(format!("Failed to load {}: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), "Session config loaded");
        Ok(config)
    }

    /// Reject values the run loop and receive path cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(SessionError::Config(
                "tickIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.receive_batch_size == 0 {
            return Err(SessionError::Config(
                "receiveBatchSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Reset fields that fail validation to their defaults, keeping the rest
    pub fn repaired(mut self) -> Self {
        if self.tick_interval_ms == 0 {
            tracing::warn!(
                default = default_tick_interval_ms(),
                "Invalid tickIntervalMs, using default"
            );
            self.tick_interval_ms = default_tick_interval_ms();
        }
        if self.receive_batch_size == 0 {
            tracing::warn!(
                default = default_receive_batch_size(),
                "Invalid receiveBatchSize, using default"
            );
            self.receive_batch_size = default_receive_batch_size();
        }
        self
    }

    /// Run loop tick as a `Duration`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    pub fn with_receive_batch_size(mut self, size: usize) -> Self {
        self.receive_batch_size = size;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_shutdown_reason(mut self, reason: impl Into<String>) -> Self {
        self.shutdown_reason = reason.into();
        self
    }
}
