//! Idempotent HTTP call executor.
//!
//! [`Retrier::run`] is the only place HTTP retries happen. Each attempt's
//! result is classified into an [`Outcome`]; transient statuses back off
//! exponentially with jitter, 401/403 trigger a single token refresh, and
//! everything else returns immediately.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::ApiError;
use crate::error::ProviderError;

/// Statuses retried when the caller supplies no set of its own.
pub const DEFAULT_RETRYABLE: [u16; 5] = [429, 500, 502, 503, 504];

/// Default retry bound.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Upper bound of the random jitter, as a fraction of the delay.
    pub max_jitter: f64,
    /// Per-attempt cap, applied after jitter.
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 1.5,
            max_jitter: 0.5,
            cap: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Backoff with a custom initial interval; used by tests to keep runs short.
    pub fn with_initial(initial: Duration) -> Self {
        Self {
            initial,
            ..Default::default()
        }
    }

    /// Delay before retry `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(64) as i32);
        let secs = (self.initial.as_secs_f64() * factor).min(self.cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Delay before retry `retry` including jitter, never above the cap.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = if self.max_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.max_jitter)
        } else {
            0.0
        };
        base.mul_f64(1.0 + jitter).min(self.cap)
    }
}

/// What the executor does with one attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Return the value.
    Success,
    /// Sleep and try again.
    Retry,
    /// Refresh the bearer token, then try again.
    RefreshAuth,
    /// Return the error.
    Permanent,
}

/// Classify one attempt.
///
/// `refreshed` is true once the chain has already refreshed its token; a
/// further 401/403 is then permanent.
pub fn classify<T>(result: &Result<T, ApiError>, retryable: &[u16], refreshed: bool) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(err) => match err.status() {
            Some(401) | Some(403) if !refreshed => Outcome::RefreshAuth,
            Some(status) if retryable.contains(&status) => Outcome::Retry,
            _ => Outcome::Permanent,
        },
    }
}

/// Bookkeeping for a single attempt, emitted to the debug log.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    /// 0-based attempt index.
    pub index: u32,
    /// Status of the last response, if any.
    pub status: Option<u16>,
    /// Last error message.
    pub error: Option<String>,
    /// Delay before the next attempt.
    pub next_delay: Option<Duration>,
}

/// Hook used to refresh credentials after a 401/403.
#[async_trait]
pub trait AuthRefresh: Send + Sync {
    /// Refresh the credential. Concurrent calls may be coalesced.
    async fn refresh(&self) -> Result<(), ProviderError>;
}

/// Bounded retry loop.
#[derive(Debug, Clone)]
pub struct Retrier {
    max_retries: u32,
    retryable: Vec<u16>,
    backoff: Backoff,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl Retrier {
    /// Executor with the default retryable set.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retryable: DEFAULT_RETRYABLE.to_vec(),
            backoff: Backoff::default(),
        }
    }

    /// Replace the retryable status set.
    pub fn with_retryable(mut self, codes: &[u16]) -> Self {
        self.retryable = codes.to_vec();
        self
    }

    /// Add statuses to the retryable set (e.g. 404 for eventually consistent endpoints).
    pub fn also_retry(mut self, codes: &[u16]) -> Self {
        for code in codes {
            if !self.retryable.contains(code) {
                self.retryable.push(*code);
            }
        }
        self
    }

    /// Replace the backoff parameters.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Configured retry bound.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Configured retryable statuses.
    pub fn retryable(&self) -> &[u16] {
        &self.retryable
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// At most `max_retries + 1` attempts are charged to the budget. An auth
    /// refresh adds one uncharged attempt and happens at most once per call.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        auth: Option<&dyn AuthRefresh>,
        mut op: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut retries = 0u32;
        let mut refreshed = false;
        let mut index = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }

            let result = op().await;
            let outcome = classify(&result, &self.retryable, refreshed || auth.is_none());
            let mut attempt = RetryAttempt {
                index,
                status: result.as_ref().err().and_then(ApiError::status),
                error: result.as_ref().err().map(ToString::to_string),
                next_delay: None,
            };
            index += 1;

            match outcome {
                Outcome::Success => return result,
                Outcome::Permanent => {
                    debug!(?attempt, "permanent failure");
                    return result;
                },
                Outcome::RefreshAuth => {
                    refreshed = true;
                    debug!(?attempt, "refreshing token before retry");
                    if let Some(auth) = auth {
                        auth.refresh().await.map_err(ApiError::Auth)?;
                    }
                },
                Outcome::Retry => {
                    if retries >= self.max_retries {
                        warn!(
                            attempts = index,
                            status = ?attempt.status,
                            "retry budget exhausted"
                        );
                        return result;
                    }
                    let delay = self.backoff.delay(retries);
                    retries += 1;
                    attempt.next_delay = Some(delay);
                    debug!(?attempt, "transient failure, backing off");

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max: u32) -> Retrier {
        Retrier::new(max).with_backoff(Backoff::with_initial(Duration::from_millis(1)))
    }

    fn status(code: u16) -> ApiError {
        ApiError::Status {
            status: code,
            body: String::new(),
        }
    }

    struct CountingRefresh(AtomicU32);

    #[async_trait]
    impl AuthRefresh for CountingRefresh {
        async fn refresh(&self) -> Result<(), ProviderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_delay(0), Duration::from_millis(500));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(750));
        assert_eq!(backoff.base_delay(40), Duration::from_secs(60));
        for retry in 0..20 {
            let d = backoff.delay(retry);
            assert!(d >= backoff.base_delay(retry));
            assert!(d <= Duration::from_secs(60));
            assert!(d <= backoff.base_delay(retry).mul_f64(1.5));
        }
    }

    #[test]
    fn test_classify() {
        let ok: Result<(), ApiError> = Ok(());
        assert_eq!(classify(&ok, &DEFAULT_RETRYABLE, false), Outcome::Success);
        assert_eq!(
            classify::<()>(&Err(status(503)), &DEFAULT_RETRYABLE, false),
            Outcome::Retry
        );
        assert_eq!(
            classify::<()>(&Err(status(401)), &DEFAULT_RETRYABLE, false),
            Outcome::RefreshAuth
        );
        assert_eq!(
            classify::<()>(&Err(status(403)), &DEFAULT_RETRYABLE, true),
            Outcome::Permanent
        );
        assert_eq!(
            classify::<()>(&Err(status(404)), &DEFAULT_RETRYABLE, false),
            Outcome::Permanent
        );
        assert_eq!(
            classify::<()>(&Err(status(404)), &[404], false),
            Outcome::Retry
        );
        assert_eq!(
            classify::<()>(&Err(ApiError::Transport("reset".into())), &DEFAULT_RETRYABLE, false),
            Outcome::Permanent
        );
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run(&CancellationToken::new(), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ApiError>(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = fast(3)
            .run(&CancellationToken::new(), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status(503))
            })
            .await;
        assert_eq!(result.unwrap_err().status(), Some(503));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_recovers_after_transient() {
        let calls = AtomicU32::new(0);
        let result = fast(5)
            .run(&CancellationToken::new(), None, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(status(429))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = fast(5)
            .run(&CancellationToken::new(), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status(422))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_refresh_once() {
        let refresher = CountingRefresh(AtomicU32::new(0));
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = fast(5)
            .run(&CancellationToken::new(), Some(&refresher), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status(401))
            })
            .await;
        assert_eq!(result.unwrap_err().status(), Some(401));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_refresh_then_success() {
        let refresher = CountingRefresh(AtomicU32::new(0));
        let calls = AtomicU32::new(0);
        let result = fast(0)
            .run(&CancellationToken::new(), Some(&refresher), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(status(401))
                } else {
                    Ok(201u16)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 201);
        assert_eq!(refresher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_without_refresher_is_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = fast(5)
            .run(&CancellationToken::new(), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status(403))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let cancel = CancellationToken::new();
        let retrier = Retrier::new(10).with_backoff(Backoff::with_initial(Duration::from_secs(30)));
        let calls = Arc::new(AtomicU32::new(0));

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let counter = Arc::clone(&calls);
        let result: Result<(), ApiError> = tokio::time::timeout(
            Duration::from_secs(5),
            retrier.run(&cancel, None, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(status(502))
                }
            }),
        )
        .await
        .expect("cancellation should interrupt the sleep");

        assert!(matches!(result, Err(ApiError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_also_retry_extends_set() {
        let r = Retrier::new(3).also_retry(&[404, 503]);
        assert!(r.retryable().contains(&404));
        assert_eq!(r.retryable().iter().filter(|c| **c == 503).count(), 1);
    }
}
