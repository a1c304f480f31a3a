//! Retry decorator for operations against a pooled resource.
//!
//! Only failures the policy deems retryable are retried. Between attempts
//! the caller-supplied reconnect hook runs so the next attempt sees a fresh
//! handle. Backoff is exponential: `initial_delay * 2^attempt`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::DatabaseError;

/// Errors that know whether another attempt could succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for DatabaseError {
    fn is_retryable(&self) -> bool {
        self.is_connection()
    }
}

/// Attempts and backoff for [`with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    /// Delay before the attempt following `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Run `op`, retrying failures for which [`RetryableError::is_retryable`] holds.
pub async fn with_retry<T, E, Op, Fut, Rc, RcFut>(
    policy: &RetryPolicy,
    op: Op,
    reconnect: Rc,
) -> Result<T, E>
where
    E: RetryableError + Display,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Rc: FnMut() -> RcFut,
    RcFut: Future<Output = ()>,
{
    with_retry_if(policy, E::is_retryable, op, reconnect).await
}

/// Run `op`, retrying failures for which `retryable` returns true.
///
/// On a retryable failure at attempt `i`, if `i < max_attempts - 1` the
/// wrapper sleeps `policy.backoff(i)`, runs `reconnect`, and tries again.
/// Otherwise the failure is returned as is.
pub async fn with_retry_if<T, E, P, Op, Fut, Rc, RcFut>(
    policy: &RetryPolicy,
    retryable: P,
    mut op: Op,
    mut reconnect: Rc,
) -> Result<T, E>
where
    E: Display,
    P: Fn(&E) -> bool,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Rc: FnMut() -> RcFut,
    RcFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if retryable(&err) && attempt + 1 < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Connection-class failure, reconnecting before retry"
                );
                tokio::time::sleep(delay).await;
                reconnect().await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
