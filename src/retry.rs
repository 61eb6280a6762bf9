//! Shared retry policy for token-endpoint and resource calls
//!
//! One policy drives every retry loop in the crate:
//!
//! - the operation runs at most `max_attempts` times
//! - `rate_limit_exceeded` with a `Retry-After` hint waits exactly that long
//!   (hints above `max_retry_after` are not waited out; the error is returned)
//! - other errors accepted by the `retryable` predicate back off
//!   exponentially: `base_delay`, `2 * base_delay`, `4 * base_delay`, ...
//!   capped at `max_delay`; waits taken for a `Retry-After` hint do not
//!   advance this sequence
//! - everything else fails immediately
//!
//! The loop checks a [`CancellationToken`] between attempts so ending a
//! session stops pending retries without aborting in-flight requests.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::error::{OAuthError, OAuthErrorKind, Result};
use crate::runtime::Scheduler;

fn recoverable(error: &OAuthError) -> bool {
    error.is_recoverable()
}

fn rate_limit_hint(error: &OAuthError) -> Option<Duration> {
    match error.kind() {
        OAuthErrorKind::RateLimitExceeded => error.retry_after(),
        _ => None,
    }
}

/// Retry configuration
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[builder(default = 3)]
    pub max_attempts: u32,
    /// First back-off delay
    #[builder(default = Duration::from_secs(1))]
    pub base_delay: Duration,
    /// Upper bound on a single back-off delay
    #[builder(default = Duration::from_secs(30))]
    pub max_delay: Duration,
    /// Longest `Retry-After` hint that is waited out
    #[builder(default = Duration::from_secs(60))]
    pub max_retry_after: Duration,
    /// Predicate deciding whether an error may be retried
    #[builder(default = recoverable)]
    pub retryable: fn(&OAuthError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Exponential back-off before retry number `retry` (1-based)
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retrying after `error`, or `None` if it must not be retried
    ///
    /// `retry` is the 1-based position in the back-off sequence; it is
    /// ignored when the error carries a `Retry-After` hint.
    #[must_use]
    pub fn delay_for(&self, error: &OAuthError, retry: u32) -> Option<Duration> {
        if !(self.retryable)(error) {
            return None;
        }
        match rate_limit_hint(error) {
            Some(wait) if wait > self.max_retry_after => None,
            Some(wait) => Some(wait),
            None => Some(self.backoff_delay(retry)),
        }
    }

    /// Run `operation` under this policy
    ///
    /// The closure receives the 1-based attempt number. The last classified
    /// error is returned when attempts run out, the error is not retryable,
    /// or `cancel` fires between attempts.
    ///
    /// # Errors
    /// Returns the error of the final attempt.
    pub async fn run<T, F, Fut>(
        &self,
        scheduler: &dyn Scheduler,
        cancel: &CancellationToken,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        let mut backoffs = 0;
        loop {
            let error = match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= self.max_attempts {
                tracing::warn!(
                    operation,
                    attempt,
                    kind = %error.kind(),
                    "Retries exhausted"
                );
                return Err(error);
            }

            let Some(delay) = self.delay_for(&error, backoffs + 1) else {
                tracing::debug!(operation, attempt, kind = %error.kind(), "Not retrying");
                return Err(error);
            };

            if cancel.is_cancelled() {
                tracing::debug!(operation, attempt, "Retry loop cancelled");
                return Err(error);
            }

            tracing::warn!(
                operation,
                attempt,
                kind = %error.kind(),
                delay_ms = delay.as_millis() as u64,
                "Retrying after failure"
            );
            if rate_limit_hint(&error).is_none() {
                backoffs += 1;
            }
            scheduler.sleep(delay).await;

            if cancel.is_cancelled() {
                tracing::debug!(operation, attempt, "Retry loop cancelled");
                return Err(error);
            }
            attempt += 1;
        }
    }
}
