//! Retry with exponential backoff for backend HTTP calls

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Retry policy for backend calls
///
/// Controls how many times a transient failure is retried and how long to
/// wait between attempts using exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out
    ///
    /// Backoff sleeps race `cancel`, so a cancelled caller never waits out a
    /// delay.
    ///
    /// # Errors
    ///
    /// Returns the last error from `call`, or [`Error::Cancelled`]
    pub async fn run<T, F, Fut>(
        &self,
        label: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_retries || !err.is_transient() {
                return Err(err);
            }

            let delay = delay_for_attempt(self, attempt);
            tracing::warn!(label, attempt, ?delay, error = %err, "transient failure, retrying");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Compute the delay before the next retry attempt.
///
/// Follows exponential backoff: `min(base_delay * 2^attempt + jitter, max_delay)`.
/// Jitter is 0-25% of the computed delay, derived from `SystemTime` to avoid
/// pulling in a full random number generator.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let jitter = base.mul_f64(f64::from(jitter_nanos % 250) / 1000.0);

    (base + jitter).min(policy.max_delay)
}

/// Turn a non-success response into [`Error::Upstream`]
///
/// # Errors
///
/// Returns [`Error::Upstream`] carrying the status and body text
pub async fn ensure_success(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(service, status = %status, body = %body, "backend error");
    Err(Error::Upstream {
        service,
        status: status.as_u16(),
        body,
    })
}
