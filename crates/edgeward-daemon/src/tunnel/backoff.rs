//! Exponential backoff with full jitter.
//!
//! A [`BackoffHandler`] is owned by exactly one loop and mutated only from
//! there, so it carries no locking.

use std::time::Duration;

use rand::RngExt;

/// Largest shift applied to the base delay.
const MAX_EXPONENT: u32 = 31;

/// Retry policy for one subsystem.
#[derive(Debug, Clone)]
pub struct BackoffHandler {
    /// Retries allowed before [`next_delay`](Self::next_delay) gives up.
    /// With `retry_forever` this only caps the exponent.
    max_retries: u32,
    base_time: Duration,
    retry_forever: bool,
    retries: u32,
}

impl BackoffHandler {
    pub const fn new(max_retries: u32, base_time: Duration, retry_forever: bool) -> Self {
        Self {
            max_retries,
            base_time,
            retry_forever,
            retries: 0,
        }
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    ///
    /// The delay is drawn uniformly from `[0, max_backoff_duration()]`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            if !self.retry_forever {
                return None;
            }
        } else {
            self.retries += 1;
        }
        Some(jitter(self.max_backoff_duration()))
    }

    /// Upper bound of the delay for the current retry count.
    pub fn max_backoff_duration(&self) -> Duration {
        self.base_time
            .saturating_mul(1u32 << self.retries.min(MAX_EXPONENT))
    }

    /// Forget past failures. The next delay starts from the base again.
    pub const fn set_grace_period(&mut self) {
        self.retries = 0;
    }

    /// Number of retries counted since the last grace period.
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    pub const fn reached_max_retries(&self) -> bool {
        self.retries >= self.max_retries
    }
}

fn jitter(max: Duration) -> Duration {
    let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::rng().random_range(0..=nanos))
}
