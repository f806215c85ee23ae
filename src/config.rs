//! Bus configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding [`BusConfig::request_timeout`] (milliseconds).
pub const REQUEST_TIMEOUT_ENV: &str = "CQRS_REQUEST_TIMEOUT_MS";
/// Environment variable overriding [`BusConfig::handler_timeout`] (milliseconds).
pub const HANDLER_TIMEOUT_ENV: &str = "CQRS_HANDLER_TIMEOUT_MS";
/// Environment variable overriding [`BusConfig::shutdown_grace`] (milliseconds).
pub const SHUTDOWN_GRACE_ENV: &str = "CQRS_SHUTDOWN_GRACE_MS";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 50_000;
const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 50_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Errors raised while reading configuration overrides.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An override was present but not a valid millisecond count.
    #[error("invalid value {value:?} for {key}: expected milliseconds")]
    InvalidDuration {
        /// The offending key.
        key: String,
        /// The raw value.
        value: String,
    },
}

/// Timeouts governing synchronous calls and handler invocations.
///
/// Serializes with millisecond fields so it can be embedded in any
/// application config file:
///
/// ```
/// use sourced_cqrs::BusConfig;
///
/// let config: BusConfig = serde_json::from_str(r#"{"request_timeout_ms": 200}"#).unwrap();
/// assert_eq!(config.request_timeout.as_millis(), 200);
/// assert_eq!(config.handler_timeout.as_secs(), 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Ceiling for a synchronous `request` before it fails with a timeout.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    /// Deadline given to each handler invocation on the subscribe side.
    #[serde(rename = "handler_timeout_ms", with = "millis")]
    pub handler_timeout: Duration,
    /// How long a cancelled subscription waits for its in-flight handler.
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            handler_timeout: Duration::from_millis(DEFAULT_HANDLER_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl BusConfig {
    /// Defaults with overrides applied from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(timeout) = parse_millis(REQUEST_TIMEOUT_ENV, lookup(REQUEST_TIMEOUT_ENV))? {
            self.request_timeout = timeout;
        }
        if let Some(timeout) = parse_millis(HANDLER_TIMEOUT_ENV, lookup(HANDLER_TIMEOUT_ENV))? {
            self.handler_timeout = timeout;
        }
        if let Some(grace) = parse_millis(SHUTDOWN_GRACE_ENV, lookup(SHUTDOWN_GRACE_ENV))? {
            self.shutdown_grace = grace;
        }
        Ok(self)
    }

    /// Set the synchronous request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-invocation handler timeout.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set how long shutdown waits for in-flight handlers.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

fn parse_millis(key: &str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::InvalidDuration {
            key: key.to_string(),
            value: raw,
        })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
