//! Retry/backoff policy for redelivery after a transient failure (spec §4.7).
//!
//! Grounded on the teacher crate's `utils::retry::RetryConfig`: a
//! base/max delay pair, a bounded attempt count, and deterministic
//! hash-based jitter rather than `rand` (keeps the crate's dependency
//! surface small and retry delays reproducible in tests).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::Deserialize;

/// How a retry policy's delay grows with attempt number (spec §4.7 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `baseDelayMs * 2^(attempt-1)`, capped at `maxDelayMs`.
    Exponential,
    /// `baseDelayMs * attempt`, capped at `maxDelayMs`.
    Linear,
}

/// Per-saga (or bus-default) retry policy. Mirrors the `worker.retryPolicy`/
/// `worker.sagas[name].retryPolicy` shape from spec.md §6, so a host
/// application can embed it directly in its own `Deserialize`d configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffKind,
}

impl Default for RetryPolicy {
    /// Matches the bus-level default (spec §4.7, §6): three attempts,
    /// exponential backoff from one second up to thirty.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff: BackoffKind::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64, backoff: BackoffKind) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            backoff,
        }
    }

    /// Whether a message currently on `attempt` may be redelivered again,
    /// i.e. has not yet exhausted `maxAttempts`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, with up to 20% jitter applied
    /// deterministically from `(attempt, jitter_key)` so identical inputs
    /// always produce the same delay (useful in tests; a real redelivery
    /// scheduler should key jitter on the envelope ID for variance across
    /// messages retried at the same attempt number).
    pub fn delay_for_attempt(&self, attempt: u32, jitter_key: &str) -> Duration {
        let unjittered = match self.backoff {
            BackoffKind::Exponential => {
                let exp = attempt.saturating_sub(1).min(32);
                self.base_delay_ms.saturating_mul(1u64 << exp)
            }
            BackoffKind::Linear => self.base_delay_ms.saturating_mul(attempt.max(1) as u64),
        }
        .min(self.max_delay_ms);

        let jitter_fraction = jitter_fraction(attempt, jitter_key);
        let jittered = (unjittered as f64 * (1.0 + jitter_fraction)).round() as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }
}

/// Stable pseudo-random fraction in `[-0.1, 0.1]`, derived from a hash of
/// `(attempt, key)` rather than `rand`, so retries stay reproducible.
fn jitter_fraction(attempt: u32, key: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    attempt.hash(&mut hasher);
    key.hash(&mut hasher);
    let hashed = hasher.finish();
    let unit = (hashed % 2001) as f64 / 10000.0; // in [0, 0.2]
    unit - 0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, 1_000, 60_000, BackoffKind::Exponential);
        let d1 = policy.delay_for_attempt(1, "k").as_millis();
        let d2 = policy.delay_for_attempt(2, "k").as_millis();
        let d3 = policy.delay_for_attempt(3, "k").as_millis();
        // allow for +/-10% jitter while still asserting roughly doubling
        assert!(d2 as f64 > d1 as f64 * 1.5);
        assert!(d3 as f64 > d2 as f64 * 1.5);
    }

    #[test]
    fn delay_is_capped_at_max_delay_ms() {
        let policy = RetryPolicy::new(10, 1_000, 5_000, BackoffKind::Exponential);
        let delay = policy.delay_for_attempt(10, "k");
        assert!(delay.as_millis() as u64 <= 5_000);
    }

    #[test]
    fn linear_backoff_scales_by_attempt() {
        let policy = RetryPolicy::new(5, 1_000, 60_000, BackoffKind::Linear);
        let d1 = policy.delay_for_attempt(1, "k").as_millis() as f64;
        let d4 = policy.delay_for_attempt(4, "k").as_millis() as f64;
        assert!(d4 > d1 * 3.0);
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3, 1_000, 30_000, BackoffKind::Exponential);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn jitter_is_deterministic_for_same_inputs() {
        let policy = RetryPolicy::default();
        let a = policy.delay_for_attempt(2, "order:o1");
        let b = policy.delay_for_attempt(2, "order:o1");
        assert_eq!(a, b);
    }
}
