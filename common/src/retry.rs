// Backoff policy for transient store failures. The interval is fixed (the
// configured db_retry_interval) with a small jitter so cluster peers do not
// hammer a recovering database in lockstep.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DbRetryPolicy {
    interval: Duration,
    jitter_factor: f64,
}

impl DbRetryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jitter_factor: 0.1,
        }
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// The delay before the next retry attempt.
    pub fn next_delay(&self) -> Duration {
        let base = self.interval.as_millis() as f64;
        let jitter = base * self.jitter_factor * rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_stays_within_jitter_band() {
        let policy = DbRetryPolicy::new(Duration::from_millis(1_000));
        for _ in 0..100 {
            let delay = policy.next_delay().as_millis();
            assert!((900..=1100).contains(&delay));
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = DbRetryPolicy::new(Duration::from_millis(500)).with_jitter_factor(0.0);
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
    }
}
