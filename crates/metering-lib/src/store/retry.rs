//! Bounded backoff for optimistic-concurrency retries

use std::time::Duration;

/// How often and how patiently a read-modify-write is retried on conflict
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub steps: u32,
    /// Delay before the first retry
    pub duration: Duration,
    /// Multiplier applied to the delay after every retry
    pub factor: f64,
    /// Maximum extra delay as a fraction of the current delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            duration: Duration::from_millis(10),
            factor: 1.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, used by tests
    pub fn immediate(steps: u32) -> Self {
        Self {
            steps,
            duration: Duration::ZERO,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            remaining: self.steps.saturating_sub(1),
            current: self.duration,
            factor: self.factor,
            jitter: self.jitter,
        }
    }
}

/// Yields the delay before each retry until the budget is spent
#[derive(Debug, Clone)]
pub struct Backoff {
    remaining: u32,
    current: Duration,
    factor: f64,
    jitter: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.current;
        let extra_ms = rand_jitter((base.as_millis() as f64 * self.jitter) as u64);
        self.current = base.mul_f64(self.factor.max(1.0));
        Some(base + Duration::from_millis(extra_ms))
    }
}

/// Pseudo-random jitter in `[0, max_ms)` derived from the clock
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    now % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.steps, 5);
        // First attempt is not a retry
        assert_eq!(policy.backoff().count(), 4);
    }

    #[test]
    fn test_backoff_growth_and_jitter() {
        let policy = RetryPolicy {
            steps: 4,
            duration: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
        };
        let delays: Vec<_> = policy.backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        let jittered = RetryPolicy {
            jitter: 0.5,
            ..policy
        };
        let first = jittered.backoff().next().unwrap();
        assert!(first >= Duration::from_millis(100));
        assert!(first < Duration::from_millis(150));
    }

    #[test]
    fn test_rand_jitter() {
        assert!(rand_jitter(1000) < 1000);
        assert_eq!(rand_jitter(0), 0);
    }
}
