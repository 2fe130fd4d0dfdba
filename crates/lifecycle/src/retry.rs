//! Exponential backoff retrier.
//!
//! Operations are retried only while they fail with transient errors; a
//! permanent error stops the loop immediately so a deterministic failure
//! never burns the whole retry budget.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Classify, ErrorClass};

/// Retry configuration for controller calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (values below 1 are treated as 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) attempt failed.
    ///
    /// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1).min(32)).unwrap_or(32);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// A successful retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Value returned by the final attempt.
    pub value: T,
    /// Number of invocations, including the successful one.
    pub attempts: u32,
}

/// Why a retried call gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The operation failed with a permanent error.
    #[error("{error} (permanent, after {attempts} attempt(s))")]
    Permanent { attempts: u32, error: E },

    /// Every attempt failed transiently.
    #[error("{error} (gave up after {attempts} attempts)")]
    Exhausted { attempts: u32, error: E },

    /// Cancellation was requested while waiting between attempts.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Number of invocations made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// The last error returned by the operation, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } => Some(error),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempt budget is spent.
///
/// Each attempt and each backoff wait is logged with the attempt count.
///
/// # Errors
///
/// Returns [`RetryError::Permanent`] on the first permanent error,
/// [`RetryError::Exhausted`] with the last error once attempts run out, and
/// [`RetryError::Cancelled`] if `cancel` fires during a backoff wait.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.attempt_budget();
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            operation = %operation_name,
            attempt,
            max_attempts,
            "Invoking operation"
        );

        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = %operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(e) => e,
        };

        match error.class() {
            ErrorClass::Permanent => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %error,
                    "Permanent failure, not retrying"
                );
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error,
                });
            }
            ErrorClass::Transient if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %error,
                    "Operation failed after max retries"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }
            ErrorClass::Transient => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    max_attempts,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Transient failure, retrying"
                );

                tokio::select! {
                    () = cancel.cancelled() => {
                        warn!(operation = %operation_name, attempt, "Retry cancelled");
                        return Err(RetryError::Cancelled { attempts: attempt });
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::ControllerError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(40));
        // Capped at max_delay
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_policy_deserializes_millis_with_defaults() {
        let policy: RetryPolicy =
            serde_yaml::from_str("max_attempts: 3\ninitial_delay_ms: 250\n").unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry(&fast_policy(5), "create", &CancellationToken::new(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ControllerError::RateLimited("throttled".into()))
                } else {
                    Ok("handle-1")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, "handle-1");
        assert_eq!(result.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_after_one_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<Retried<()>, _> =
            retry(&fast_policy(10), "create", &CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ControllerError::Config("unsupported engine".into()))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Permanent { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<Retried<()>, _> =
            retry(&fast_policy(3), "delete", &CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ControllerError::Network("connection reset".into()))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert!(err.last_error().unwrap().to_string().contains("connection reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_still_invokes_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<Retried<()>, _> =
            retry(&fast_policy(0), "create", &CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ControllerError::Timeout(30))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(600),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(600),
        };

        let result: Result<Retried<()>, _> = retry(&policy, "create", &cancel, || {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Err(ControllerError::NotReady("vpc".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }
}
