//! Job queue configuration types
//!
//! Shared between the services that enqueue jobs and the worker that
//! leases them, so both sides agree on queue limits and lease timing.

use crate::{parse_env, ConfigError, ConfigResult};

/// Durable job queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of `queued` jobs before enqueue reports backpressure
    pub max_length: i64,

    /// Upper bound on jobs a single worker process runs at once
    pub max_inflight: usize,

    /// Lease length in seconds
    pub lease_duration_secs: i64,

    /// Sleep between lease attempts when no work is available, in milliseconds
    pub poll_interval_ms: u64,

    /// Cap on the exponential retry delay, in seconds
    pub backoff_cap_secs: i64,

    /// Default retry ceiling for jobs enqueued without an explicit one
    pub default_max_attempts: i32,
}

impl QueueConfig {
    /// Load queue configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let config = Self {
            max_length: parse_env("QUEUE_MAX_LENGTH", 10_000)?,
            max_inflight: parse_env("QUEUE_MAX_INFLIGHT", 16)?,
            lease_duration_secs: parse_env("QUEUE_LEASE_DURATION_SECS", 60)?,
            poll_interval_ms: parse_env("QUEUE_POLL_INTERVAL_MS", 1_000)?,
            backoff_cap_secs: parse_env("QUEUE_BACKOFF_CAP_SECS", 300)?,
            default_max_attempts: parse_env("QUEUE_DEFAULT_MAX_ATTEMPTS", 3)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable the queue
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_length < 1 {
            return Err(ConfigError::ValidationError(
                "QUEUE_MAX_LENGTH must be at least 1".to_string(),
            ));
        }
        if self.max_inflight < 1 {
            return Err(ConfigError::ValidationError(
                "QUEUE_MAX_INFLIGHT must be at least 1".to_string(),
            ));
        }
        // Heartbeats tick in whole seconds and must land inside the lease
        if self.lease_duration_secs < 2 {
            return Err(ConfigError::ValidationError(
                "QUEUE_LEASE_DURATION_SECS must be at least 2".to_string(),
            ));
        }
        if self.default_max_attempts < 1 {
            return Err(ConfigError::ValidationError(
                "QUEUE_DEFAULT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.backoff_cap_secs < 0 {
            return Err(ConfigError::ValidationError(
                "QUEUE_BACKOFF_CAP_SECS must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Heartbeat period: a third of the lease, never below one second
    pub fn heartbeat_interval_secs(&self) -> u64 {
        (self.lease_duration_secs / 3).max(1) as u64
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_length: 10_000,
            max_inflight: 16,
            lease_duration_secs: 60,
            poll_interval_ms: 1_000,
            backoff_cap_secs: 300,
            default_max_attempts: 3,
        }
    }
}
