//! Retry backoff policy
//!
//! Controls how long `on_error` sleeps before the next attempt. Conflicts and
//! unknown commit results back off exponentially with jitter; stale or future
//! read versions use a short fixed delay, since a fresh read version fixes them
//! immediately.

use std::time::Duration;

use rand::Rng;
use rywdb_core::Error;
use serde::{Deserialize, Serialize};

/// Configuration for retry backoff
///
/// # Example
/// ```
/// use rywdb_concurrency::RetryPolicy;
///
/// let policy = RetryPolicy::new()
///     .with_base_delay_ms(5)
///     .with_max_delay_ms(200)
///     .without_jitter();
/// assert_eq!(policy.calculate_delay(0, None).as_millis(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds (doubles per attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Fixed delay after a too-old or future-version error
    pub version_error_delay_ms: u64,
    /// Randomize each delay within `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 10,
            max_delay_ms: 1000,
            version_error_delay_ms: 10,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a RetryPolicy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Set the fixed delay used for version errors
    pub fn with_version_error_delay_ms(mut self, delay_ms: u64) -> Self {
        self.version_error_delay_ms = delay_ms;
        self
    }

    /// Disable jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    ///
    /// `max_delay` overrides the policy cap when the transaction sets one.
    pub fn calculate_delay(&self, attempt: u32, max_delay: Option<Duration>) -> Duration {
        // Cap the shift to prevent overflow
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let cap = max_delay
            .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
            .unwrap_or(self.max_delay_ms);
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(cap);

        if self.jitter && delay_ms > 1 {
            let jittered = rand::thread_rng().gen_range(delay_ms / 2..=delay_ms);
            Duration::from_millis(jittered)
        } else {
            Duration::from_millis(delay_ms)
        }
    }

    /// Delay before retrying after `error`
    pub fn delay_for(&self, error: &Error, attempt: u32, max_delay: Option<Duration>) -> Duration {
        if error.is_version_error() {
            let fixed = Duration::from_millis(self.version_error_delay_ms);
            return max_delay.map_or(fixed, |cap| fixed.min(cap));
        }
        self.calculate_delay(attempt, max_delay)
    }
}
