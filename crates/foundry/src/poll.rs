//! State polling for asynchronous remote operations.
//!
//! Commissioning, deployment and release all complete out-of-band; the
//! only way to observe them is to poll the machine state. The poller
//! tolerates a bounded number of consecutive read failures (a momentary
//! network blip must not abort a multi-minute wait) but still fails fast
//! once that bound is reached.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::ClientError;
use crate::machine::MachineState;

/// What to wait for and for how long.
#[derive(Debug, Clone)]
pub struct PollSpec {
    /// States that complete the wait successfully (any one suffices).
    pub target_states: Vec<MachineState>,
    /// States that fail the wait immediately.
    pub error_states: Vec<MachineState>,
    /// Overall budget for the wait.
    pub timeout: Duration,
    /// Sleep between state reads.
    pub poll_interval: Duration,
    /// Consecutive read failures tolerated before giving up.
    pub max_consecutive_check_failures: u32,
}

impl PollSpec {
    /// Build a spec with the default failure tolerance.
    ///
    /// Target and error state sets must be disjoint.
    #[must_use]
    pub fn new(
        target_states: Vec<MachineState>,
        error_states: Vec<MachineState>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        debug_assert!(
            target_states.iter().all(|s| !error_states.contains(s)),
            "target and error state sets must be disjoint"
        );
        Self {
            target_states,
            error_states,
            timeout,
            poll_interval,
            max_consecutive_check_failures: 3,
        }
    }
}

/// Terminal poll failures. A successful wait returns the reached state.
#[derive(Debug, Error)]
pub enum PollError {
    /// The machine reported a failure state.
    #[error("machine entered error state {state}")]
    ErrorState { state: MachineState },

    /// State reads failed too many times in a row.
    #[error("state check failed {attempts} consecutive times: {source}")]
    CheckFailed { attempts: u32, source: ClientError },

    /// The budget elapsed without a terminal state.
    #[error("timed out after {timeout:?} waiting for {targets:?}; last state: {last}")]
    TimedOut {
        timeout: Duration,
        targets: Vec<MachineState>,
        last: String,
    },

    /// The workflow was interrupted by the operator.
    #[error("interrupted while waiting for {targets:?}")]
    Interrupted { targets: Vec<MachineState> },
}

/// Poll `check` until a target state, an error state, the timeout, or an
/// operator interrupt.
///
/// State is logged only when it changes, so hour-long waits do not flood
/// the log. A successful read resets the consecutive-failure counter.
///
/// # Errors
/// See [`PollError`] for the terminal failure cases.
pub async fn wait_for_state<F, Fut>(
    spec: &PollSpec,
    mut shutdown: watch::Receiver<bool>,
    mut check: F,
) -> Result<MachineState, PollError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<MachineState, ClientError>>,
{
    let deadline = Instant::now() + spec.timeout;
    let mut last_state: Option<MachineState> = None;
    let mut consecutive_failures: u32 = 0;

    loop {
        match check().await {
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    attempt = consecutive_failures,
                    limit = spec.max_consecutive_check_failures,
                    "State check failed: {e}"
                );
                if consecutive_failures >= spec.max_consecutive_check_failures {
                    return Err(PollError::CheckFailed {
                        attempts: consecutive_failures,
                        source: e,
                    });
                }
            }
            Ok(state) => {
                consecutive_failures = 0;

                if last_state != Some(state) {
                    info!(state = %state, "State changed");
                    last_state = Some(state);
                } else {
                    debug!(state = %state, "State unchanged");
                }

                if spec.error_states.contains(&state) {
                    return Err(PollError::ErrorState { state });
                }
                if spec.target_states.contains(&state) {
                    return Ok(state);
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(PollError::TimedOut {
                timeout: spec.timeout,
                targets: spec.target_states.clone(),
                last: last_state.map_or_else(|| "never read".to_string(), |s| s.to_string()),
            });
        }

        // Sleep one interval, but wake immediately on operator interrupt.
        tokio::select! {
            () = tokio::time::sleep(spec.poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Err(PollError::Interrupted {
                        targets: spec.target_states.clone(),
                    });
                }
            }
        }
    }
}
