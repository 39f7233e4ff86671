//! Retry with exponential backoff for remote operations.

use std::sync::Once;
use std::time::Duration;

use tracing::warn;

use crate::client::ClientError;

static UNBOUNDED_NOTICE: Once = Once::new();

/// Retry configuration for remote operations.
///
/// `max_attempts == 0` means retry forever; this mode is announced once
/// per process when first used.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, 0 for unbounded.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Build a policy with the given attempt ceiling and the default
    /// backoff curve.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-indexed):
    /// `min(initial_delay * backoff_factor^(attempt-1), max_delay)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX).min(64);
        let raw = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        if raw >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    fn is_unbounded(&self) -> bool {
        self.max_attempts == 0
    }
}

/// Classification hook consulted by [`with_retry`].
///
/// Only plausibly transient failures are retried; everything else is
/// surfaced unchanged on the first attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ClientError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Execute an async operation with retry and exponential backoff.
///
/// The operation is invoked until it succeeds, returns a non-retryable
/// error, or the attempt ceiling is reached. The last error is returned
/// unchanged so callers see the original cause.
///
/// Only wrap the remote-call boundary in this: argument validation and
/// other local failures should never be retried.
///
/// # Errors
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error immediately.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut f: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    if policy.is_unbounded() {
        UNBOUNDED_NOTICE.call_once(|| {
            warn!("Retry ceiling set to 0: failed operations will be retried forever");
        });
    }

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if !policy.is_unbounded() && attempt >= policy.max_attempts {
                    warn!(
                        "{op_name} failed on final attempt {attempt}/{}: {e}",
                        policy.max_attempts
                    );
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                if policy.is_unbounded() {
                    warn!("{op_name} failed (attempt {attempt}/unbounded): {e}. Retrying in {delay:?}");
                } else {
                    warn!(
                        "{op_name} failed (attempt {attempt}/{}): {e}. Retrying in {delay:?}",
                        policy.max_attempts
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FlakyError {
        retryable: bool,
        tag: u32,
    }

    impl std::fmt::Display for FlakyError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky error #{}", self.tag)
        }
    }

    impl Retryable for FlakyError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(80),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_invoked_exactly_n_times() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FlakyError> = with_retry(&fast_policy(4), "doomed", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Err(FlakyError {
                    retryable: true,
                    tag: n,
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // The final error is the last attempt's, unchanged.
        assert_eq!(result.unwrap_err().tag, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_returns_after_k_failures() {
        let calls = AtomicU32::new(0);
        let k: u32 = 23;
        let result: Result<u32, FlakyError> = with_retry(&fast_policy(0), "persistent", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= k {
                    Err(FlakyError {
                        retryable: true,
                        tag: n,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), k + 1);
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FlakyError> = with_retry(&fast_policy(5), "rejected", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(FlakyError {
                    retryable: false,
                    tag: 1,
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_sequence_monotone_and_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        };

        let delays: Vec<Duration> = (1..=10).map(|n| policy.delay_for(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must be non-decreasing");
        }
        for d in &delays {
            assert!(*d <= policy.max_delay);
        }
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[9], Duration::from_secs(60));
    }
}
