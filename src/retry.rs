//! Retry schedule for transient model errors.
//!
//! Classification lives on [`ModelError`]: only transient errors are
//! worth another attempt, and only while attempts remain. The delay for
//! attempt `k` (0-based) is `base × 2^k × (1 + jitter)` capped at
//! `max_backoff`, with `jitter` drawn from `[0, 0.25]`. A server that
//! answered 429 with a `Retry-After` hint larger than the computed
//! delay gets its wish.

use std::time::Duration;

use crate::gateway::ModelError;

/// Base delay before the first retry.
const BASE_DELAY: Duration = Duration::from_millis(500);

/// Default cap on total calls per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Maximum jitter ratio added to each computed delay.
const JITTER_RATIO: f64 = 0.25;

/// The retry schedule for one run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    max_backoff: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Policy with the standard base delay and attempt count.
    pub fn new(max_backoff_secs: f64) -> Self {
        Self {
            base: BASE_DELAY,
            max_backoff: Duration::from_secs_f64(max_backoff_secs.max(0.0)),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Decide whether to retry after attempt `k` (0-based) failed with
    /// `error`. `Some(delay)` means sleep then retry; `None` means
    /// surface the error.
    pub fn next_delay(&self, attempt: u32, error: &ModelError) -> Option<Duration> {
        if !error.is_transient() || attempt + 1 >= self.max_attempts {
            return None;
        }
        let jitter = rand::random::<f64>() * JITTER_RATIO;
        let delay = self.delay_with_jitter(attempt, jitter);
        match error.retry_after() {
            Some(hint) if hint > delay => Some(hint),
            _ => Some(delay),
        }
    }

    /// The deterministic part of the schedule.
    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponential = self.base.as_secs_f64() * f64::powi(2.0, attempt as i32);
        let delayed = Duration::from_secs_f64(exponential * (1.0 + jitter));
        delayed.min(self.max_backoff)
    }
}
