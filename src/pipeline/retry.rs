use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy for transient publish failures.
///
/// Delays grow geometrically from `initial_backoff_ms` by `multiplier` and
/// are capped at `max_backoff_ms`. Without `max_attempts` a transient failure
/// is retried until it succeeds or the pipeline is cancelled.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt may follow `attempts_made` failed ones
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            max_attempts: None,
        };
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn attempt_limit() {
        let unlimited = RetryPolicy::default();
        assert!(unlimited.allows_retry(1_000_000));

        let limited = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        };
        assert!(limited.allows_retry(2));
        assert!(!limited.allows_retry(3));
    }
}
