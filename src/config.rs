//! # Engine Configuration
//!
//! Explicit typed configuration for the orchestration engine. Built from
//! defaults or environment variables and passed by reference through the
//! engine; there is no global configuration state.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, ServiceError};

/// Retry policy applied to retryable failures (execution, timeout,
/// infrastructure). Validation and dependency failures are never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based), exponential and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay_ms as f64);

        let with_jitter = if self.jitter {
            // Spread between 50% and 100% of the capped delay.
            capped * (0.5 + fastrand::f64() / 2.0)
        } else {
            capped
        };

        Duration::from_millis(with_jitter as u64)
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the bounded worker pool
    pub worker_count: usize,
    /// Interval for the suspended-record readiness re-scan fallback
    pub poll_interval_ms: u64,
    /// Timeout applied to external executions when the record carries none
    pub default_timeout_ms: u64,
    /// Capacity of the transition event broadcast channel
    pub event_channel_capacity: usize,
    /// Number of captured output lines included in execution error excerpts
    pub output_excerpt_lines: usize,
    pub retry: RetryPolicy,
    pub custom_settings: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 500,
            default_timeout_ms: 3_600_000,
            event_channel_capacity: 1024,
            output_excerpt_lines: 20,
            retry: RetryPolicy::default(),
            custom_settings: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `PIPELINE_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(workers) = std::env::var("PIPELINE_WORKER_COUNT") {
            config.worker_count = parse_var("PIPELINE_WORKER_COUNT", &workers)?;
        }

        if let Ok(interval) = std::env::var("PIPELINE_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_var("PIPELINE_POLL_INTERVAL_MS", &interval)?;
        }

        if let Ok(timeout) = std::env::var("PIPELINE_DEFAULT_TIMEOUT_MS") {
            config.default_timeout_ms = parse_var("PIPELINE_DEFAULT_TIMEOUT_MS", &timeout)?;
        }

        if let Ok(attempts) = std::env::var("PIPELINE_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_var("PIPELINE_RETRY_MAX_ATTEMPTS", &attempts)?;
        }

        if let Ok(base) = std::env::var("PIPELINE_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay_ms = parse_var("PIPELINE_RETRY_BASE_DELAY_MS", &base)?;
        }

        Ok(config)
    }

    /// Effective timeout for a record-level timeout override
    pub fn effective_timeout(&self, record_timeout: Option<Duration>) -> Duration {
        record_timeout.unwrap_or(Duration::from_millis(self.default_timeout_ms))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ServiceError::Validation {
        message: format!("invalid {name}: {e}"),
    })
}
