//! Admission control for outbound model calls.
//!
//! A token bucket with capacity 1: at `rate_limit_rps` requests per
//! second, one token drips in every `1/rps` seconds, so calls cannot
//! burst past the configured rate. When no rate is configured the gate
//! is a no-op.

use std::time::Duration;

use leaky_bucket::RateLimiter;
use tokio_util::sync::CancellationToken;

use crate::gateway::ModelError;

/// Gate in front of the model client.
pub struct RequestGate {
    limiter: Option<RateLimiter>,
}

impl RequestGate {
    /// Create a gate. `None` (or a non-positive rate) disables limiting.
    pub fn new(rate_limit_rps: Option<f64>) -> Self {
        let limiter = rate_limit_rps.filter(|rps| *rps > 0.0).map(|rps| {
            RateLimiter::builder()
                .initial(1)
                .refill(1)
                .max(1)
                .interval(Duration::from_secs_f64(1.0 / rps))
                .build()
        });
        Self { limiter }
    }

    /// Obtain a permit, sleeping until the bucket refills. Returns
    /// [`ModelError::Cancelled`] promptly if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ModelError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        tokio::select! {
            _ = limiter.acquire_one() => Ok(()),
            _ = cancel.cancelled() => Err(ModelError::Cancelled),
        }
    }
}
