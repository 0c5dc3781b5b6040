//! Session configuration.
//!
//! Handles reading the session configuration from a JSON file. Every field
//! has a default, so an empty object (or no file at all) is a valid
//! configuration. The endpoint can be overridden with `CHANNEL_SESSION_URL`.

// Rust guideline compliant 2026-01

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::transport::Params;

/// Environment variable that overrides [`SessionConfig::endpoint`].
pub const ENDPOINT_ENV_VAR: &str = "CHANNEL_SESSION_URL";

/// What `leave()` does when the alias is not in the channel map.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownChannelPolicy {
    /// Return `SessionError::UnknownChannel`.
    #[default]
    Report,
    /// Log a warning and succeed without changing state.
    Ignore,
}

/// Backoff settings for connection handshakes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubling delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Total handshake attempts per `connect()`. `0` means unbounded.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Doubles from `initial_backoff_ms`, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Configuration for a [`SessionManager`](crate::session::SessionManager).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Socket endpoint, e.g. `ws://localhost:4000/socket`.
    pub endpoint: String,
    /// Parameters sent with every connection.
    pub params: Params,
    /// Handshake retry policy.
    pub reconnect: ReconnectPolicy,
    /// How long to wait for a join acknowledgment, in milliseconds.
    pub join_timeout_ms: u64,
    /// How long to wait for the previous socket to close on reconnect.
    pub teardown_timeout_ms: u64,
    /// Heartbeat period for transports that need one.
    pub heartbeat_interval_ms: u64,
    /// Behavior of `leave()` on an unknown alias.
    pub unknown_channel: UnknownChannelPolicy,
    /// Reconnect automatically when an established socket drops.
    pub reconnect_on_close: bool,
    /// Re-join every channel in the map after a reconnect.
    pub rejoin_on_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:4000/socket".to_string(),
            params: Params::new(),
            reconnect: ReconnectPolicy::default(),
            join_timeout_ms: 10_000,
            teardown_timeout_ms: 2_000,
            heartbeat_interval_ms: 30_000,
            unknown_channel: UnknownChannelPolicy::default(),
            reconnect_on_close: true,
            rejoin_on_reconnect: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV_VAR) {
            if !endpoint.is_empty() {
                log::debug!("[Config] Endpoint overridden by {}", ENDPOINT_ENV_VAR);
                self.endpoint = endpoint;
            }
        }
    }

    /// Join acknowledgment timeout.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Old-socket teardown timeout.
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_allows_retry_respects_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));

        let unbounded = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(unbounded.allows_retry(1_000));
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "endpoint": "ws://example.test/socket",
                "unknown_channel": "ignore",
                "reconnect": {{"max_attempts": 2}}
            }}"#
        )
        .unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.unknown_channel, UnknownChannelPolicy::Ignore);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.initial_backoff_ms, 1_000);
        assert_eq!(config.join_timeout_ms, 10_000);
        assert!(config.params.is_empty());
    }

    #[test]
    fn test_load_invalid_json_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = SessionConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let result = SessionConfig::load(Path::new("/nonexistent/channel-session.json"));
        assert!(result.is_err());
    }
}
