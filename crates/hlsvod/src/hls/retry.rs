// Retry-with-backoff shared by segment and key fetching.
//
// Fixed or exponential delays (optionally jittered), observing cancellation between attempts.

use crate::error::TransferError;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long to wait between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// The same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base * 2^attempt`, capped at `max`, plus up to `base/2` of jitter.
    Exponential {
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter: bool,
    },
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.backoff {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential {
                base_delay_ms,
                max_delay_ms,
                jitter,
            } => {
                let base_delay = Duration::from_millis(*base_delay_ms);
                let max_delay = Duration::from_millis(*max_delay_ms);
                // Checked shift so attempts >= 32 saturate instead of overflowing.
                let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                let capped = base_delay
                    .checked_mul(multiplier)
                    .unwrap_or(max_delay)
                    .min(max_delay);

                if !jitter {
                    return capped;
                }

                // Jitter never pushes the delay past `max_delay`.
                let jitter_range_ms = base_delay_ms / 2;
                let remaining_ms =
                    u64::try_from(max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
                let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
                if jitter_limit_ms == 0 {
                    return capped;
                }

                let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
                (capped + Duration::from_millis(jitter_ms)).min(max_delay)
            }
        }
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error (network, 429, 5xx, timeout).
    Retry(TransferError),
    /// Operation failed with a non-retryable error (4xx, bad payload).
    Fail(TransferError),
}

/// A value (or error) together with the number of retries spent producing it.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub retries: u32,
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed) and
/// returns a [`RetryAction`]. Cancellation is observed before every attempt and
/// during every backoff sleep, yielding [`TransferError::Cancelled`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<Attempted<T>, Attempted<TransferError>>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(Attempted {
                value: TransferError::Cancelled,
                retries: attempt,
            });
        }

        match operation(attempt).await {
            RetryAction::Success(value) => {
                return Ok(Attempted {
                    value,
                    retries: attempt,
                });
            }
            RetryAction::Fail(err) => {
                return Err(Attempted {
                    value: err,
                    retries: attempt,
                });
            }
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(Attempted {
                        value: err,
                        retries: attempt,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(Attempted {
                            value: TransferError::Cancelled,
                            retries: attempt,
                        });
                    }
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

    fn transient() -> TransferError {
        TransferError::TransientFetch {
            url: "https://cdn.example.com/a.ts".to_string(),
            reason: "HTTP 503".to_string(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, BackoffPolicy::Fixed { delay_ms: 1 })
    }

    #[test]
    fn delay_respects_max_cap() {
        let policy = RetryPolicy::new(
            10,
            BackoffPolicy::Exponential {
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                jitter: false,
            },
        );
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn exponential_without_jitter_is_deterministic() {
        let policy = RetryPolicy::new(
            3,
            BackoffPolicy::Exponential {
                base_delay_ms: 100,
                max_delay_ms: 10_000,
                jitter: false,
            },
        );
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_half_base() {
        let policy = RetryPolicy::new(
            3,
            BackoffPolicy::Exponential {
                base_delay_ms: 100,
                max_delay_ms: 10_000,
                jitter: true,
            },
        );
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn fixed_delay_ignores_attempt() {
        let policy = RetryPolicy::new(5, BackoffPolicy::Fixed { delay_ms: 1_000 });
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn success_on_first_attempt_reports_zero_retries() {
        let token = CancellationToken::new();
        let result =
            retry_with_backoff(&fast_policy(3), &token, |_| async { RetryAction::Success(42u32) })
                .await
                .unwrap();
        assert_eq!(result.value, 42);
        assert_eq!(result.retries, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<Attempted<u32>, _> = retry_with_backoff(&fast_policy(3), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Fail(TransferError::PermanentFetch {
                    url: "u".to_string(),
                    reason: "HTTP 404".to_string(),
                })
            }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.retries, 0);
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_then_fails_with_last_error() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<Attempted<u32>, _> = retry_with_backoff(&fast_policy(2), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(transient()) }
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err.value, TransferError::TransientFetch { .. }));
        assert_eq!(err.retries, 2);
        // Initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn succeeds_after_k_transient_failures() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&fast_policy(3), &token, |attempt| async move {
            if attempt < 2 {
                RetryAction::Retry(transient())
            } else {
                RetryAction::Success(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(result.value, 2);
        assert_eq!(result.retries, 2);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<Attempted<u32>, _> =
            retry_with_backoff(&fast_policy(10), &token, |_| async { RetryAction::Success(1u32) })
                .await;
        assert!(matches!(
            result.unwrap_err().value,
            TransferError::Cancelled
        ));
    }

    #[tokio::test]
    async fn cancel_during_backoff_cuts_the_loop_short() {
        let policy = RetryPolicy::new(10, BackoffPolicy::Fixed { delay_ms: 60_000 });
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let attempts = AtomicU32::new(0);
        let result: Result<Attempted<u32>, _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(transient()) }
        })
        .await;
        assert!(matches!(
            result.unwrap_err().value,
            TransferError::Cancelled
        ));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }
}
