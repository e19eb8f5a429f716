//! [`BackoffPolicy`] – the single retry schedule used by service starts and
//! registry reconnects alike.
//!
//! The delay before retry `k` (0-indexed) is `base_delay × backoff_factor^k`,
//! clamped to `max_delay`. Non-finite or negative intermediate values clamp to
//! `max_delay` as well.
//!
//! ```
//! use std::time::Duration;
//! use warden_types::BackoffPolicy;
//!
//! let policy = BackoffPolicy {
//!     max_retries: 3,
//!     base_delay: Duration::from_secs(1),
//!     backoff_factor: 2.0,
//!     max_delay: Duration::from_secs(3),
//! };
//! assert_eq!(policy.delay(0), Duration::from_secs(1));
//! assert_eq!(policy.delay(1), Duration::from_secs(2));
//! assert_eq!(policy.delay(2), Duration::from_secs(3));
//! assert_eq!(policy.max_attempts(), 4);
//! ```

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplicative growth factor (`>= 1.0` in practice).
    pub backoff_factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt `retry` before starting the next one.
    pub fn delay(&self, retry: u32) -> Duration {
        let max_secs = self.max_delay.as_secs_f64();
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Total number of attempts including the initial one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// A policy that never waits, for tests and one-shot probes.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }
}
