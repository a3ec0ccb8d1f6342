//! Configuration module for the telemetry batcher.
//!
//! This module provides environment-based configuration: the delivery
//! endpoint, batch size, flush thresholds and transport timeouts.

use std::env;
use std::time::Duration;

use crate::policy::{ThresholdPolicy, DEFAULT_COUNT_THRESHOLD, DEFAULT_STALENESS};

/// Default endpoint receiving event batches
const DEFAULT_ENDPOINT: &str = "http://localhost:8000/api/v1/events";

/// Default number of events per transport batch
const DEFAULT_BATCH_SIZE: usize = 50;

/// Maximum allowed batch size to keep request bodies bounded
const MAX_BATCH_SIZE: usize = 1_000;

/// Maximum staleness threshold (one day)
const MAX_STALENESS_SECS: u64 = 86_400;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default number of retries inside a single send
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default period of the background staleness check in seconds
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;

/// Configuration for the telemetry batcher.
///
/// All settings can be configured via environment variables:
/// - `TELEMETRY_BATCHER_ENDPOINT`: batch ingestion URL
/// - `TELEMETRY_BATCHER_BATCH_SIZE`: events per transport batch (default: 50)
/// - `TELEMETRY_BATCHER_FLUSH_COUNT`: queued events that trigger a flush (default: 10)
/// - `TELEMETRY_BATCHER_STALENESS_SECS`: max age of the oldest event (default: 300)
/// - `TELEMETRY_BATCHER_REQUEST_TIMEOUT_SECS`: HTTP timeout (default: 30)
/// - `TELEMETRY_BATCHER_MAX_RETRIES`: retries inside one send (default: 2)
/// - `TELEMETRY_BATCHER_CHECK_INTERVAL_SECS`: staleness check period (default: 30)
#[derive(Debug, Clone)]
pub struct Config {
    /// URL that receives event batches
    pub endpoint: String,

    /// Number of events handed to the transport per send
    pub batch_size: usize,

    /// Queue length that triggers a flush
    pub flush_count: usize,

    /// Maximum age of the oldest queued event before a flush is forced
    pub staleness: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Maximum number of retry attempts inside one send
    pub max_retries: u32,

    /// How often the background task re-evaluates the flush policy
    pub check_interval: Duration,
}

/// Error type for configuration failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but is not a valid number
    /// or lies outside its allowed range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_batcher::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Endpoint: {}", config.endpoint);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = env::var("TELEMETRY_BATCHER_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();

        let batch_size = parse_bounded(
            "TELEMETRY_BATCHER_BATCH_SIZE",
            DEFAULT_BATCH_SIZE,
            1,
            MAX_BATCH_SIZE,
        )?;

        let flush_count = parse_bounded(
            "TELEMETRY_BATCHER_FLUSH_COUNT",
            DEFAULT_COUNT_THRESHOLD,
            1,
            usize::MAX,
        )?;

        let staleness_secs = parse_bounded(
            "TELEMETRY_BATCHER_STALENESS_SECS",
            DEFAULT_STALENESS.as_secs(),
            1,
            MAX_STALENESS_SECS,
        )?;

        let request_timeout_secs = parse_bounded(
            "TELEMETRY_BATCHER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            600,
        )?;

        let max_retries = parse_bounded(
            "TELEMETRY_BATCHER_MAX_RETRIES",
            DEFAULT_MAX_RETRIES,
            0,
            10,
        )?;

        let check_interval_secs = parse_bounded(
            "TELEMETRY_BATCHER_CHECK_INTERVAL_SECS",
            DEFAULT_CHECK_INTERVAL_SECS,
            1,
            MAX_STALENESS_SECS,
        )?;

        Ok(Self {
            endpoint,
            batch_size,
            flush_count,
            staleness: Duration::from_secs(staleness_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_retries,
            check_interval: Duration::from_secs(check_interval_secs),
        })
    }

    /// Flush policy described by this configuration.
    pub fn flush_policy(&self) -> Result<ThresholdPolicy, ConfigError> {
        ThresholdPolicy::new(self.flush_count, self.staleness)
    }
}

/// Parse a numeric environment variable, falling back to `default` when it
/// is unset and rejecting values outside `min..=max`.
fn parse_bounded<T>(env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let value = match env::var(env_var) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };

    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value)))?;

    if parsed < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("value {} is below minimum ({})", parsed, min),
        ));
    }

    if parsed > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("value {} exceeds maximum ({})", parsed, max),
        ));
    }

    Ok(parsed)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_count: DEFAULT_COUNT_THRESHOLD,
            staleness: DEFAULT_STALENESS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
        }
    }
}
