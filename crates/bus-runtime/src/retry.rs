//! Retry policy with per-client failure tracking.
//!
//! The policy is a pure decision function over (consecutive-failure count,
//! error class, remaining time): it never observes success or failure itself.
//! Callers invoke [`RetryPolicy::reset_retry_count`] after a successful
//! operation and [`RetryPolicy::increment_retry_count`] after a failed one.

use crate::config::RetryConfig;
use crate::error::AmqpError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Exponential-backoff retry policy with per-client-identity counters
pub struct RetryPolicy {
    config: RetryConfig,
    counters: Mutex<HashMap<String, u32>>,
}

impl RetryPolicy {
    /// Create a policy with the given tuning
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Decide the delay before the next attempt for `client_id`.
    ///
    /// Returns `None` ("give up") when the error is non-transient, when the
    /// per-client consecutive-failure count has exceeded the configured
    /// bound, or when the computed delay would not fit in `remaining`.
    pub fn next_interval(
        &self,
        client_id: &str,
        error: &AmqpError,
        remaining: Duration,
    ) -> Option<Duration> {
        if !error.is_transient() {
            return None;
        }

        let count = self.retry_count(client_id);
        if count >= self.config.max_retry_count {
            debug!(client_id, count, "retry budget exhausted");
            return None;
        }

        let backoff = self
            .config
            .delta_backoff
            .saturating_mul(1u32 << count.min(16));
        let mut delay = self
            .config
            .min_backoff
            .saturating_add(backoff)
            .min(self.config.max_backoff);

        // Server-driven backpressure may ask for more than the computed delay
        if let Some(server_delay) = error.retry_after() {
            delay = delay.max(server_delay).min(self.config.max_backoff);
        }

        if delay >= remaining {
            debug!(client_id, ?delay, ?remaining, "no time left for a retry");
            return None;
        }

        Some(delay)
    }

    /// Record a failed attempt for `client_id`
    pub fn increment_retry_count(&self, client_id: &str) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(client_id.to_string()).or_insert(0) += 1;
    }

    /// Record a successful attempt for `client_id`, clearing its counter
    pub fn reset_retry_count(&self, client_id: &str) {
        let mut counters = self.counters.lock().unwrap();
        counters.remove(client_id);
    }

    /// Current consecutive-failure count for `client_id`
    pub fn retry_count(&self, client_id: &str) -> u32 {
        let counters = self.counters.lock().unwrap();
        counters.get(client_id).copied().unwrap_or(0)
    }
}
