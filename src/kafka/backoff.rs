use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff used between handler retries.
///
/// The delay before retry `n` (0-based) is `initial_delay * multiplier^n`,
/// capped at `max_elapsed`. Retrying stops once `max_attempts` failures have
/// been seen or the total time spent waiting would exceed `max_elapsed`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_elapsed: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_elapsed.as_millis() as f64 {
            return self.max_elapsed;
        }
        Duration::from_millis(millis.round() as u64)
    }

    pub fn start(&self) -> BackoffState {
        BackoffState {
            policy: self.clone(),
            failures: 0,
            waited: Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Retry bookkeeping for one record (or one batch).
#[derive(Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    failures: u32,
    waited: Duration,
}

impl BackoffState {
    /// Records a failure and returns how long to wait before the next
    /// attempt, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.failures - 1);
        if self.waited + delay > self.policy.max_elapsed {
            return None;
        }
        self.waited += delay;
        Some(delay)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_elapsed: Duration::from_millis(1000),
            max_attempts,
        }
    }

    #[test]
    fn test_delays_grow_exponentially() {
        let policy = policy(10);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempt_budget_ends_retries() {
        let policy = policy(3);
        let mut state = policy.start();
        assert_eq!(state.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(state.next_delay(), None);
        assert_eq!(state.failures(), 3);
    }

    #[test]
    fn test_elapsed_budget_ends_retries() {
        let policy = policy(100);
        let mut state = policy.start();
        // 100 + 200 + 400 = 700; the next 800 would exceed 1000
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert_eq!(state.next_delay(), None);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let policy = policy(1);
        assert_eq!(policy.start().next_delay(), None);
    }
}
