//! Bounded exponential backoff for store operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; zero is treated as one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn no_wait(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_async<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(target = "retry", label, attempt, max_attempts, "succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let backoff = policy.backoff(attempt);
                let jitter_ms = if backoff.is_zero() {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=backoff.as_millis().min(1_000) as u64 / 4)
                };
                let wait = backoff + Duration::from_millis(jitter_ms);
                warn!(
                    target = "retry",
                    label,
                    attempt,
                    max_attempts,
                    backoff_ms = wait.as_millis() as u64,
                    error = %err,
                    "attempt failed; retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
