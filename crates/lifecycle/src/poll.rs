//! Readiness poller.
//!
//! Replaces per-call-site "sleep and check" loops with one parameterised
//! wait. A failing probe (network blip talking to the provider) is tracked
//! separately from a resource reporting a failed state.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::ResourceStatus;
use crate::error::{Classify, ErrorClass};

/// What to wait for and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSpec {
    /// Status that ends the wait successfully.
    pub target: ResourceStatus,
    /// Statuses that end the wait immediately as a failure.
    pub failure_states: Vec<ResourceStatus>,
    /// Overall budget.
    pub timeout: Duration,
    /// Delay between probes.
    pub interval: Duration,
    /// Consecutive transient probe errors tolerated before giving up.
    pub probe_failure_tolerance: u32,
}

impl PollSpec {
    /// Wait for a new resource to become ready.
    #[must_use]
    pub fn ready(timeout: Duration, interval: Duration, probe_failure_tolerance: u32) -> Self {
        Self {
            target: ResourceStatus::Ready,
            failure_states: vec![ResourceStatus::Failed],
            timeout,
            interval,
            probe_failure_tolerance,
        }
    }

    /// Wait for a deleted resource to disappear.
    #[must_use]
    pub fn absent(timeout: Duration, interval: Duration, probe_failure_tolerance: u32) -> Self {
        Self {
            target: ResourceStatus::Absent,
            failure_states: vec![ResourceStatus::Failed],
            timeout,
            interval,
            probe_failure_tolerance,
        }
    }
}

/// Result of [`await_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The target status was observed.
    Reached { elapsed: Duration, polls: u32 },
    /// A terminal failure status was observed.
    Failed {
        status: ResourceStatus,
        elapsed: Duration,
        polls: u32,
    },
    /// The budget ran out before the target was observed.
    TimedOut {
        last_status: Option<ResourceStatus>,
        elapsed: Duration,
        polls: u32,
    },
    /// The probe itself failed permanently or too many times in a row.
    ProbeFailed {
        error: String,
        class: ErrorClass,
        elapsed: Duration,
        polls: u32,
    },
    /// Cancellation was requested while waiting.
    Cancelled { elapsed: Duration, polls: u32 },
}

impl PollOutcome {
    /// Time spent waiting.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Reached { elapsed, .. }
            | Self::Failed { elapsed, .. }
            | Self::TimedOut { elapsed, .. }
            | Self::ProbeFailed { elapsed, .. }
            | Self::Cancelled { elapsed, .. } => *elapsed,
        }
    }

    /// Number of probes made.
    #[must_use]
    pub fn polls(&self) -> u32 {
        match self {
            Self::Reached { polls, .. }
            | Self::Failed { polls, .. }
            | Self::TimedOut { polls, .. }
            | Self::ProbeFailed { polls, .. }
            | Self::Cancelled { polls, .. } => *polls,
        }
    }
}

/// Probe `resource_id` until it reaches `spec.target`.
///
/// The last probe happens no later than the deadline: the final sleep is
/// shortened to the remaining budget.
pub async fn await_state<F, Fut, E>(
    resource_id: &str,
    spec: &PollSpec,
    cancel: &CancellationToken,
    mut probe: F,
) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ResourceStatus, E>>,
    E: Classify + Display,
{
    info!(
        resource = %resource_id,
        target = %spec.target,
        timeout_secs = spec.timeout.as_secs(),
        "Waiting for resource status"
    );

    let start = Instant::now();
    let mut polls = 0;
    let mut consecutive_probe_failures = 0;
    let mut last_status = None;

    loop {
        polls += 1;
        match probe().await {
            Ok(status) => {
                consecutive_probe_failures = 0;
                last_status = Some(status);
                debug!(
                    resource = %resource_id,
                    status = %status,
                    poll = polls,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Polled resource status"
                );

                if status == spec.target {
                    info!(resource = %resource_id, status = %status, polls, "Resource reached target status");
                    return PollOutcome::Reached {
                        elapsed: start.elapsed(),
                        polls,
                    };
                }

                if spec.failure_states.contains(&status) {
                    warn!(resource = %resource_id, status = %status, "Resource entered failure status");
                    return PollOutcome::Failed {
                        status,
                        elapsed: start.elapsed(),
                        polls,
                    };
                }
            }
            Err(e) => {
                consecutive_probe_failures += 1;
                let class = e.class();
                if class == ErrorClass::Permanent
                    || consecutive_probe_failures > spec.probe_failure_tolerance
                {
                    error!(
                        resource = %resource_id,
                        error = %e,
                        consecutive_failures = consecutive_probe_failures,
                        "Status probe failed"
                    );
                    return PollOutcome::ProbeFailed {
                        error: e.to_string(),
                        class,
                        elapsed: start.elapsed(),
                        polls,
                    };
                }
                warn!(
                    resource = %resource_id,
                    error = %e,
                    consecutive_failures = consecutive_probe_failures,
                    tolerance = spec.probe_failure_tolerance,
                    "Status probe failed, will retry"
                );
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= spec.timeout {
            warn!(
                resource = %resource_id,
                target = %spec.target,
                elapsed_secs = elapsed.as_secs(),
                "Timed out waiting for resource status"
            );
            return PollOutcome::TimedOut {
                last_status,
                elapsed,
                polls,
            };
        }

        let pause = spec.interval.min(spec.timeout - elapsed);
        tokio::select! {
            () = cancel.cancelled() => {
                warn!(resource = %resource_id, "Wait cancelled");
                return PollOutcome::Cancelled { elapsed: start.elapsed(), polls };
            }
            () = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::ControllerError;

    type Script = Arc<Mutex<VecDeque<Result<ResourceStatus, ControllerError>>>>;

    fn script(steps: Vec<Result<ResourceStatus, ControllerError>>) -> Script {
        Arc::new(Mutex::new(steps.into_iter().collect()))
    }

    /// Replays scripted probe results, repeating `Pending` once exhausted.
    async fn replay(script: Script) -> Result<ResourceStatus, ControllerError> {
        script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ResourceStatus::Pending))
    }

    fn spec(timeout_secs: u64) -> PollSpec {
        PollSpec::ready(Duration::from_secs(timeout_secs), Duration::from_secs(10), 2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_target() {
        let steps = script(vec![
            Ok(ResourceStatus::Pending),
            Ok(ResourceStatus::Pending),
            Ok(ResourceStatus::Ready),
        ]);

        let outcome = await_state("cluster", &spec(300), &CancellationToken::new(), || {
            replay(steps.clone())
        })
        .await;

        assert_eq!(
            outcome,
            PollOutcome::Reached {
                elapsed: Duration::from_secs(20),
                polls: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_state_returns_immediately() {
        let steps = script(vec![Ok(ResourceStatus::Pending), Ok(ResourceStatus::Failed)]);

        let outcome = await_state("database", &spec(3600), &CancellationToken::new(), || {
            replay(steps.clone())
        })
        .await;

        assert!(matches!(
            outcome,
            PollOutcome::Failed {
                status: ResourceStatus::Failed,
                polls: 2,
                ..
            }
        ));
        assert_eq!(outcome.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_last_status() {
        let steps = script(vec![]);

        let outcome = await_state("cluster", &spec(35), &CancellationToken::new(), || {
            replay(steps.clone())
        })
        .await;

        // Probes at 0s, 10s, 20s, 30s, and a final one at the 35s deadline.
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                last_status: Some(ResourceStatus::Pending),
                elapsed: Duration::from_secs(35),
                polls: 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_probe_errors_are_not_resource_failures() {
        let steps = script(vec![
            Err(ControllerError::Network("connection reset".into())),
            Err(ControllerError::Network("connection reset".into())),
            Ok(ResourceStatus::Pending),
            Err(ControllerError::RateLimited("throttled".into())),
            Ok(ResourceStatus::Ready),
        ]);

        let outcome = await_state("cluster", &spec(300), &CancellationToken::new(), || {
            replay(steps.clone())
        })
        .await;

        assert!(matches!(outcome, PollOutcome::Reached { polls: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_consecutive_probe_errors() {
        let steps = script(vec![
            Err(ControllerError::Network("down".into())),
            Err(ControllerError::Network("down".into())),
            Err(ControllerError::Network("down".into())),
        ]);

        let outcome = await_state("cluster", &spec(300), &CancellationToken::new(), || {
            replay(steps.clone())
        })
        .await;

        match outcome {
            PollOutcome::ProbeFailed { class, polls, .. } => {
                assert_eq!(class, ErrorClass::Transient);
                assert_eq!(polls, 3);
            }
            other => panic!("expected probe failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_probe_error_stops_at_once() {
        let steps = script(vec![Err(ControllerError::Auth("expired token".into()))]);

        let outcome = await_state("cluster", &spec(300), &CancellationToken::new(), || {
            replay(steps.clone())
        })
        .await;

        assert!(matches!(
            outcome,
            PollOutcome::ProbeFailed {
                class: ErrorClass::Permanent,
                polls: 1,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_target_for_deletion() {
        let steps = script(vec![Ok(ResourceStatus::Pending), Ok(ResourceStatus::Absent)]);
        let spec = PollSpec::absent(Duration::from_secs(60), Duration::from_secs(5), 0);

        let outcome =
            await_state("subnet-group", &spec, &CancellationToken::new(), || replay(steps.clone()))
                .await;

        assert!(matches!(outcome, PollOutcome::Reached { polls: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let steps = script(vec![]);

        let outcome = await_state("cluster", &spec(3600), &cancel, || {
            trigger.cancel();
            replay(steps.clone())
        })
        .await;

        assert!(matches!(outcome, PollOutcome::Cancelled { polls: 1, .. }));
    }
}
