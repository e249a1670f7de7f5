//! Generic retry-with-backoff, ported from the fetch-retry helper this
//! workspace already uses for segment/key downloads, generalized over
//! [`StreamingError`] instead of a fetch-specific error type.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StreamingError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts, not counting the initial one. `None` means
    /// retry forever (used for live-stream network errors per
    /// `infiniteRetriesForLiveStreams`).
    pub max_retries: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn infinite(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: None,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self.base_delay.checked_mul(multiplier).unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms = u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Result of a single attempt; the caller decides whether the outcome is
/// final or retryable.
pub enum RetryAction<T> {
    Success(T),
    Retry(StreamingError),
    Fail(StreamingError),
}

/// Run `operation` with exponential backoff, respecting cancellation via
/// `token` and `policy.max_retries` (or forever, if `None`).
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, StreamingError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(StreamingError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if let Some(max) = policy.max_retries {
                    if attempt >= max {
                        return Err(StreamingError::RetriesExhausted {
                            attempts: attempt + 1,
                            reason: err.to_string(),
                        });
                    }
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient error");
                tokio::select! {
                    _ = token.cancelled() => return Err(StreamingError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_respects_max_cap() {
        let policy = RetryPolicy {
            max_retries: Some(10),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert!(policy.delay_for_attempt(10) <= Duration::from_secs(5));
    }

    #[test]
    fn delay_without_jitter_is_deterministic() {
        let policy = RetryPolicy {
            max_retries: Some(3),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();
        let result = retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fails_immediately_on_non_retryable() {
        let policy = RetryPolicy {
            max_retries: Some(3),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        };
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Fail(StreamingError::network("404", false)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_then_fails() {
        let policy = RetryPolicy {
            max_retries: Some(2),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(StreamingError::network("timeout", true)) }
        })
        .await;
        assert!(matches!(result, Err(StreamingError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn infinite_policy_keeps_retrying() {
        let policy = RetryPolicy::infinite(Duration::from_millis(1), Duration::from_millis(5));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(&policy, &token, |attempt| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < 5 {
                    RetryAction::Retry(StreamingError::network("flaky", true))
                } else {
                    RetryAction::Success(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn respects_cancellation() {
        let policy = RetryPolicy {
            max_retries: Some(10),
            base_delay: Duration::from_secs(100),
            max_delay: Duration::from_secs(100),
            jitter: false,
        };
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, _> =
            retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(1) }).await;
        assert!(matches!(result, Err(StreamingError::Cancelled)));
    }
}
