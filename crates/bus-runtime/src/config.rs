//! Client configuration for the messaging runtime.

use crate::error::AmqpError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Top-level configuration for a messaging factory and the links it creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote host the factory connects to
    pub host: String,

    /// Budget for every user-visible operation (send, request, token put)
    pub operation_timeout: Duration,

    /// Retry tuning shared by all links created from this factory
    pub retry: RetryConfig,

    /// Bound on control-link creation attempts before waiters are failed
    pub control_link_max_attempts: u32,

    /// Validity window for system-generated security tokens
    pub token_validity: Duration,

    /// Fraction of the validity window after which renewal is scheduled
    pub token_renewal_fraction: f64,

    /// Ceiling on encoded message payloads
    pub max_message_size: usize,

    /// Budget for factory/link close before teardown is force-abandoned
    pub close_timeout: Duration,

    /// Watchdog bound on a single in-flight link reconnect attempt
    pub reconnect_watchdog: Duration,
}

impl ClientConfig {
    /// Create a configuration for the given host with defaults
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.host.is_empty() {
            return Err(AmqpError::InvalidArgument {
                field: "host".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(AmqpError::InvalidArgument {
                field: "operation_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.control_link_max_attempts == 0 {
            return Err(AmqpError::InvalidArgument {
                field: "control_link_max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.token_renewal_fraction) {
            return Err(AmqpError::InvalidArgument {
                field: "token_renewal_fraction".to_string(),
                message: "must be within 0.0..=1.0".to_string(),
            });
        }
        self.retry.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            operation_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            control_link_max_attempts: 3,
            token_validity: Duration::from_secs(20 * 60),
            token_renewal_fraction: 0.8,
            max_message_size: 256 * 1024,
            close_timeout: Duration::from_secs(60),
            reconnect_watchdog: Duration::from_secs(5 * 60),
        }
    }
}

/// Exponential backoff tuning for the retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Smallest delay between attempts
    pub min_backoff: Duration,

    /// Largest delay between attempts
    pub max_backoff: Duration,

    /// Per-attempt increment doubled on each consecutive failure
    pub delta_backoff: Duration,

    /// Consecutive failures after which the policy gives up
    pub max_retry_count: u32,
}

impl RetryConfig {
    /// Validate retry tuning values
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.min_backoff > self.max_backoff {
            return Err(AmqpError::InvalidArgument {
                field: "retry.min_backoff".to_string(),
                message: "must not exceed max_backoff".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(30),
            delta_backoff: Duration::from_secs(3),
            max_retry_count: 10,
        }
    }
}
