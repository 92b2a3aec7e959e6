//! Reconnect Backoff
//!
//! Bounded exponential backoff with jitter for the upstream link. The
//! policy is owned by the single connection task, so at most one
//! reconnect attempt is ever pending.

use std::time::Duration;

use rand::Rng;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum attempts before giving up; 0 means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Stateful backoff policy.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Creates a policy with zero attempts recorded.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config, attempts: 0 }
    }

    /// Returns the delay before the next attempt, or `None` when the
    /// attempt budget is exhausted.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }

        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let base_ms = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.config.max_delay.as_millis() as f64);

        self.attempts += 1;

        let jitter_span = capped_ms * self.config.jitter_factor;
        let jittered_ms = if jitter_span > 0.0 {
            let offset = rand::rng().random_range(-jitter_span..=jitter_span);
            (capped_ms + offset).max(0.0)
        } else {
            capped_ms
        };

        Some(Duration::from_millis(jittered_ms as u64))
    }

    /// Resets the attempt counter after a successful connection.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts recorded since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn delays_grow_exponentially_up_to_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(400)));
        // Capped from here on.
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut policy = ReconnectPolicy::new(no_jitter(2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt_count(), 2);
    }

    #[test]
    fn zero_max_attempts_retries_forever() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        for _ in 0..50 {
            assert!(policy.next_delay().is_some());
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        };
        let mut policy = ReconnectPolicy::new(config);
        for _ in 0..100 {
            let delay = policy.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }
}
