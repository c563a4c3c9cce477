//! Attempt/backoff retry harness used by every RPC in the submission and
//! result-fetch pipelines.
//!
//! Grounded on `hook-common::retry::RetryPolicy`'s geometric backoff math,
//! generalized from "retry this job later" to "retry this RPC call now,
//! bounded by an attempt budget."

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::GridError;

/// Governs how many times, and how long between attempts, a fallible RPC
/// call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    /// Discriminant names accepted as retriable; empty means "retry any
    /// transient-shaped error."
    pub whitelist: Vec<&'static str>,
    /// Whether an aggregated error's primary cause is re-examined against
    /// the whitelist when the aggregate variant itself isn't listed.
    pub derived_ok: bool,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            whitelist: Vec::new(),
            derived_ok: true,
        }
    }

    pub fn with_whitelist(mut self, whitelist: Vec<&'static str>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_derived_ok(mut self, derived_ok: bool) -> Self {
        self.derived_ok = derived_ok;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}

/// Runs `op` up to `policy.attempts` times, sleeping `policy.base_delay`
/// between attempts, stopping as soon as `op` succeeds or returns an error
/// [`GridError::is_retriable`] rejects.
///
/// `stage` names the call site for [`GridError::SubmissionExhausted`].
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, stage: &'static str, mut op: F) -> Result<T, GridError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GridError>>,
{
    let mut last_err: Option<GridError> = None;
    for attempt in 0..policy.attempts.max(1) {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retriable = err.is_retriable(&policy.whitelist, policy.derived_ok);
                if !retriable {
                    return Err(err);
                }
                warn!(
                    stage,
                    attempt,
                    attempts = policy.attempts,
                    error = %DisplayErr(&err),
                    "retriable error, backing off"
                );
                metrics::counter!(crate::metrics_consts::RETRY_ATTEMPTS_TOTAL, "stage" => stage).increment(1);
                last_err = Some(err);
                if attempt + 1 < policy.attempts {
                    tokio::time::sleep(policy.base_delay).await;
                }
            }
        }
    }
    debug!(stage, attempts = policy.attempts, "retry budget exhausted");
    metrics::counter!(crate::metrics_consts::RETRY_EXHAUSTED_TOTAL, "stage" => stage).increment(1);
    Err(GridError::SubmissionExhausted {
        stage,
        message: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string()),
    })
}

struct DisplayErr<'a>(&'a GridError);

impl fmt::Display for DisplayErr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, GridError> = retry(&policy, "test", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, GridError> = retry(&policy, "test", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GridError::TransportTransient {
                    rpc: "Test",
                    message: "boom".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(GridError::SubmissionExhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_fatal_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, GridError> = retry(&policy, "test", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GridError::TransportFatal {
                    rpc: "Test",
                    message: "nope".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(GridError::TransportFatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<u32, GridError> = retry(&policy, "test", |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GridError::TransportTransient {
                        rpc: "Test",
                        message: "boom".to_string(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
