use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::warn;

/// Bounded exponential backoff: `retries` extra attempts, the delay doubling after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts made after the first one fails.
    pub retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Policy allowing `retries` retries starting at `initial_delay`.
    pub const fn new(retries: u32, initial_delay: Duration) -> Self {
        Self {
            retries,
            initial_delay,
        }
    }

    /// Delay slept before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Run `operation` until it succeeds or the policy is exhausted, returning the last error.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if retry < policy.retries => {
                let delay = policy.delay_for(retry);
                warn!(operation = what, attempt = retry + 1, ?delay, error = %err, "attempt failed; backing off");
                sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
