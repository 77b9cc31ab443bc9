//! Retry policy with exponential backoff and jitter

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy applied to retryable node failures
///
/// Attempt `n` (1-based) sleeps `initial_interval * backoff_factor^(n-1)`
/// before retrying, capped at `max_interval`, with optional ±25% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Multiplier applied per retry
    pub backoff_factor: f64,
    /// Ceiling for any single delay
    pub max_interval: Duration,
    /// Randomize each delay by ±25%
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy with `max_attempts` and the default backoff curve
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts, ..Self::default() }
    }

    /// Disable retries entirely
    pub fn none() -> Self {
        Self::new(1)
    }

    /// Set the initial retry delay
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the delay ceiling
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether attempt `attempt` (1-based, already failed) may be retried
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to sleep before retrying after failed attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_interval.as_secs_f64() * self.backoff_factor.powi(exp as i32);
        let capped = base.min(self.max_interval.as_secs_f64());
        let jittered = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget_is_three_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let policy = RetryPolicy::new(4).with_jitter(false);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_respects_ceiling() {
        let policy = RetryPolicy::new(10)
            .with_jitter(false)
            .with_max_interval(Duration::from_secs(5));
        assert_eq!(policy.delay_for(9), Duration::from_secs(5));
    }
}
