//! Transport-level retry schedule for HTTP collaborators.
//!
//! Distinct from the task-level `retry_count`: this only covers repeated
//! attempts of one request (connection errors, 429, 5xx).

use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base`, `2·base`, `4·base`, … plus up to 25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let jitter_ms = exp.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// 429 and 5xx are worth another attempt; other statuses are final.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_with_bounded_jitter() {
        let backoff = Backoff::new(3);
        for (attempt, secs) in [(1, 1u64), (2, 2), (3, 4)] {
            let d = backoff.delay(attempt);
            let floor = Duration::from_secs(secs);
            assert!(d >= floor && d <= floor + floor / 4, "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn test_attempt_budget() {
        let backoff = Backoff::new(3);
        assert!(backoff.should_retry(1));
        assert!(backoff.should_retry(2));
        assert!(!backoff.should_retry(3));
        assert!(!Backoff::new(0).should_retry(1));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(200));
    }
}
