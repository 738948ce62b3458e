//! Poll backoff with exponential growth and jitter.
//!
//! Agents consult this policy when releasing a claimed row: the computed
//! delay becomes the row's new `next_poll_at`, which is the durable form of
//! the backoff. Failed ticks pass the row's retry count to grow the delay.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay applied on a clean tick (retries = 0).
    pub initial_delay: Duration,
    /// Maximum delay between polls.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub multiplier: f64,
    /// Add random jitter to prevent thundering herd (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(180),
            max_delay: Duration::from_secs(1800),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Load a backoff policy from environment variables with a prefix.
    pub fn from_env_with_prefix(prefix: &str) -> Self {
        let defaults = Self::default();

        let initial_delay_secs = std::env::var(format!("{}_INITIAL_DELAY_SECS", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.initial_delay.as_secs());

        let max_delay_secs = std::env::var(format!("{}_MAX_DELAY_SECS", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_delay.as_secs());

        let multiplier = std::env::var(format!("{}_MULTIPLIER", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.multiplier);

        let jitter_factor = std::env::var(format!("{}_JITTER_FACTOR", prefix))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.jitter_factor);

        Self {
            initial_delay: Duration::from_secs(initial_delay_secs),
            max_delay: Duration::from_secs(max_delay_secs),
            multiplier,
            jitter_factor,
        }
    }

    /// Calculate the poll delay for a row with the given retry count.
    pub fn delay(&self, retries: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(retries as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        // Add jitter
        let jitter = if self.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            (rand::random::<f64>() - 0.5) * 2.0 * jitter_range
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).max(0.0);
        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = policy_without_jitter();
        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(120));
        assert_eq!(policy.delay(2), Duration::from_secs(240));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy_without_jitter();
        assert_eq!(policy.delay(10), Duration::from_secs(600));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            jitter_factor: 0.1,
            ..policy_without_jitter()
        };
        for _ in 0..50 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_secs(54));
            assert!(delay <= Duration::from_secs(66));
        }
    }
}
