//! State-machine waiter for asynchronous upstream operations.
//!
//! [`WaitFor`] repeatedly calls a refresh function returning `(value, state)`
//! until the state lands in the target set, lands in the failure set, or the
//! deadline passes. Poll runs are independent; nothing is shared between them.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;

/// State reported when a refresh failed transiently and the real state is unknown.
pub const INDETERMINATE: &str = "indeterminate";

/// Why a wait ended without reaching the target.
#[derive(Debug, Error)]
pub enum PollError {
    /// The deadline passed.
    #[error("timeout after {elapsed:?} waiting for {target:?} (last state: {last_state})")]
    Timeout {
        /// Time spent waiting.
        elapsed: Duration,
        /// Target states.
        target: Vec<String>,
        /// Last state observed.
        last_state: String,
    },
    /// The operation reached a failure state.
    #[error("operation reached failure state {0}")]
    FailureState(String),
    /// The refresh reported a state outside every configured set.
    #[error("unexpected state {0}")]
    UnexpectedState(String),
    /// The refresh failed permanently.
    #[error(transparent)]
    Refresh(ProviderError),
    /// The caller cancelled the wait.
    #[error("wait cancelled")]
    Cancelled,
}

impl From<PollError> for ProviderError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout { .. } => ProviderError::DeadlineExceeded(err.to_string()),
            PollError::Refresh(inner) => inner,
            PollError::Cancelled => ProviderError::Cancelled,
            other => ProviderError::FailedPrecondition(other.to_string()),
        }
    }
}

/// Configuration of one wait.
#[derive(Debug, Clone)]
pub struct WaitFor {
    pending: Vec<String>,
    target: Vec<String>,
    failure: Vec<String>,
    poll_interval: Duration,
    min_interval: Duration,
    delay: Duration,
    timeout: Duration,
}

fn owned(states: &[&str]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

impl WaitFor {
    /// Wait while in `pending` until `target` is reached.
    pub fn new(pending: &[&str], target: &[&str]) -> Self {
        Self {
            pending: owned(pending),
            target: owned(target),
            failure: Vec::new(),
            poll_interval: Duration::from_secs(10),
            min_interval: Duration::from_millis(10),
            delay: Duration::ZERO,
            timeout: Duration::from_secs(20 * 60),
        }
    }

    /// States that end the wait with an error.
    pub fn failure(mut self, states: &[&str]) -> Self {
        self.failure = owned(states);
        self
    }

    /// Time between polls (never below the minimum interval).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lower bound for the poll interval.
    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Time to wait before the first poll.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Overall deadline, measured from the start of the wait.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn interval(&self) -> Duration {
        self.poll_interval.max(self.min_interval)
    }

    /// Poll `refresh` until a terminal state. Returns the value from the
    /// refresh that reported the target state.
    ///
    /// A transient refresh error counts as [`INDETERMINATE`] and polling
    /// continues; any other error ends the wait.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut refresh: F,
    ) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, String), ProviderError>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut last_state = String::from("none");

        let timeout_err = |last_state: String| PollError::Timeout {
            elapsed: start.elapsed(),
            target: self.target.clone(),
            last_state,
        };

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(timeout_err(last_state)),
                _ = tokio::time::sleep(self.delay) => {},
            }
        }

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(timeout_err(last_state)),
                outcome = refresh() => outcome,
            };

            match outcome {
                Ok((value, state)) => {
                    debug!(%state, elapsed = ?start.elapsed(), "poll observed state");
                    if self.target.contains(&state) {
                        return Ok(value);
                    }
                    if self.failure.contains(&state) {
                        return Err(PollError::FailureState(state));
                    }
                    if !self.pending.contains(&state) {
                        return Err(PollError::UnexpectedState(state));
                    }
                    last_state = state;
                },
                Err(err) if err.is_transient() => {
                    debug!(error = %err, "transient refresh error while polling");
                    last_state = INDETERMINATE.to_string();
                },
                Err(err) => return Err(PollError::Refresh(err)),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(timeout_err(last_state)),
                _ = tokio::time::sleep(self.interval()) => {},
            }
        }
    }
}
