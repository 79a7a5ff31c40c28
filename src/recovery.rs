//! Retry policy for transient failures
//!
//! The multipart engine itself never retries; callers wrap whole attempts
//! with [`with_retry`] instead. Only errors classified as retryable by
//! [`NimbusError::is_retryable`] are attempted again, with configurable
//! backoff and a jitter factor to avoid thundering herds.

use crate::error::{NimbusError, NimbusResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff growth between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Same delay every attempt
    Fixed,

    /// Delay grows linearly with the attempt number
    Linear,

    /// Delay multiplied by a factor each attempt
    Exponential { multiplier: f64 },
}

/// Retry policy for an operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Ceiling on any single delay
    pub max_delay: Duration,

    /// How delays grow between attempts
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Exponential { multiplier: 2.0 },
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with a given attempt count and the default backoff
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), jittered by ±20%
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let raw = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential { multiplier } => {
                base * multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };
        let jittered = raw * rand::rng().random_range(0.8..1.2);
        Duration::from_millis(jittered as u64).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> NimbusResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NimbusResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if attempt > 1 {
                    debug!(attempt, "giving up after retries");
                }
                return Err(err);
            }
        }
    }
}
