use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a multiplier and a hard cap, shared by the TODO
/// Scheduler's retry path and the Session Store's transient-failure retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            multiplier: 2.0,
            cap_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// `attempt` is 1-based: the delay before the *next* try after `attempt` failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = scaled.min(self.cap_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let policy = BackoffPolicy {
            base_ms: 100,
            multiplier: 2.0,
            cap_ms: 300,
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1).as_millis(), 100);
        assert_eq!(policy.delay_for(2).as_millis(), 200);
        assert_eq!(policy.delay_for(3).as_millis(), 300);
        assert_eq!(policy.delay_for(10).as_millis(), 300);
    }

    #[test]
    fn attempts_exhausted_respects_max() {
        let policy = BackoffPolicy {
            max_attempts: 2,
            ..BackoffPolicy::default()
        };
        assert!(!policy.attempts_exhausted(1));
        assert!(policy.attempts_exhausted(2));
    }
}
