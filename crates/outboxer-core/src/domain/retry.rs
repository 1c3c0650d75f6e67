//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for failed events.
///
/// `delay = base_delay * factor^(attempts - 1)`, capped at `max_delay`,
/// optionally spread by up to `jitter` (a fraction of the delay).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Growth factor per attempt. Must be >= 1.0.
    pub factor: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,

    /// Random spread in `[0.0, 1.0]`. 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60 * 60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, factor: f64) -> Self {
        Self {
            base_delay,
            factor,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt.
    ///
    /// # Arguments
    /// * `attempts` - attempts made so far, including the one that just failed (1-indexed).
    ///
    /// Example with base_delay=1s, factor=2.0:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        // powi overflows to inf for large exponents
        let capped = if raw.is_finite() { raw.min(max) } else { max };

        let secs = if self.jitter > 0.0 {
            let spread = capped * self.jitter.min(1.0);
            capped - rand::thread_rng().gen_range(0.0..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}
