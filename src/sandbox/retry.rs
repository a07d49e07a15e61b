//! Bounded retry combinator
//!
//! The policy (how often, how long to wait) is kept apart from the decision of
//! which outcomes are worth retrying. Errors from the operation are never
//! retried; they propagate immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Fixed pause between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }
}

/// Run `op` until `is_retryable` rejects its value or the attempts run out.
///
/// `op` receives the 1-based attempt number. When every attempt is retryable
/// the value of the last one is returned.
pub async fn retry<T, E, F, Fut, P>(policy: RetryPolicy, mut op: F, is_retryable: P) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let value = op(attempt).await?;
        if !is_retryable(&value) {
            return Ok(value);
        }
        if attempt >= attempts {
            warn!("Giving up after {} attempts", attempts);
            return Ok(value);
        }

        warn!("Transient failure, retrying ({}/{})", attempt, attempts);
        tokio::time::sleep(policy.backoff).await;
        attempt += 1;
    }
}
