//! Retry with exponential backoff for transient provider failures.
//!
//! The delay law is `initial_delay * 2^k` for the zero-indexed retry `k`,
//! with at most [`RetryPolicy::max_retries`] retries beyond the initial
//! attempt. No jitter: the schedule is part of the observable contract
//! (clients surface it as retry telemetry through the observer callback).
//!
//! Only errors classified retryable by [`Error::is_retryable`] are
//! retried; everything else returns immediately. The sleep function is a
//! parameter so tests run without real delays.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Observer invoked before each backoff sleep with the 1-based number of
/// the attempt that just failed, the error, and the upcoming delay.
pub type RetryObserver = Arc<dyn Fn(u32, &Error, Duration) + Send + Sync>;

/// Retry schedule configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries beyond the initial attempt.
    pub max_retries: u32,

    /// Delay before the first retry; doubles each retry after that.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            initial_delay: crate::config::DEFAULT_RETRY_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Delay before retry `k` (zero-indexed): `initial_delay * 2^k`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay * 2u32.saturating_pow(attempt)
    }
}

/// Runs `operation`, retrying transient failures per `policy`.
///
/// `sleep` performs the backoff wait; pass `tokio::time::sleep` in
/// production and a recording closure in tests. The observer, when
/// present, fires before every sleep. After the final permitted attempt
/// the last error returns without a further sleep.
pub async fn retry_with_backoff<T, F, Fut, S, SFut>(
    policy: RetryPolicy,
    observer: Option<&RetryObserver>,
    sleep: S,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    S: Fn(Duration) -> SFut,
    SFut: Future<Output = ()>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                attempt += 1;
                log::warn!(
                    "retryable provider error on attempt {attempt}: {err}; \
                     sleeping {delay:?} before retry"
                );
                if let Some(observer) = observer {
                    observer(attempt, &err, delay);
                }
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
