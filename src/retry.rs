//! Retry with exponential backoff.
//!
//! Wraps a single upstream operation (an API call, a metric transmit)
//! with a classifier-driven retry loop. Transient failures back off
//! exponentially; fatal failures propagate after one attempt; observing
//! the cancellation token abandons retries immediately with a
//! distinguished outcome that callers must not log as an error.
//!
//! Per-attempt failure logging beyond a debug trace is the caller's
//! responsibility; collectors know what an attempt means in their domain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::emit;
use crate::metrics::events::RetryAttempted;

/// Classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying: network timeout, 5xx, rate limit.
    Transient,
    /// Not worth retrying: 4xx, malformed request, bad credentials.
    Fatal,
}

/// Retry policy: attempt budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after each further
    /// failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff before the next attempt, after `attempt` failures
    /// (1-based): `base_delay * 2^(attempt - 1)`.
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// Outcome of an exhausted, fatal, or cancelled retry loop.
///
/// `Cancelled` is the distinguished cancellation outcome: it carries no
/// upstream error and must never be logged as a failure.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Cancellation was observed before or between attempts.
    Cancelled,
    /// Every attempt failed transiently; carries the last error.
    Exhausted { attempts: u32, source: E },
    /// The classifier declared the failure not retryable.
    Fatal { source: E },
}

impl<E> RetryError<E> {
    /// Check if this is the distinguished cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// The underlying upstream error, if there is one.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source } => Some(source),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "Cancelled"),
            RetryError::Exhausted { attempts, source } => {
                write!(f, "Failed after {} attempts: {}", attempts, source)
            }
            RetryError::Fatal { source } => write!(f, "Fatal failure: {}", source),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source } => Some(source),
        }
    }
}

/// Invoke `op` until it succeeds, a failure is classified fatal, the
/// attempt budget is exhausted, or cancellation is observed.
///
/// The token is checked before each attempt and raced against each
/// backoff sleep, so cancellation never waits out a backoff.
pub async fn call_with_retry<T, E, Op, Fut, C>(
    policy: RetryPolicy,
    token: &CancellationToken,
    classify: C,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureClass,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if classify(&err) == FailureClass::Fatal {
            return Err(RetryError::Fatal { source: err });
        }
        if attempt >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.backoff(attempt);
        debug!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_secs = delay.as_secs(),
            "Attempt failed, backing off: {}",
            err
        );
        emit!(RetryAttempted);

        tokio::select! {
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
