//! Bounded retry of conflicting transaction attempts

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use super::classify::ConflictClassifier;
use crate::constants::{DEFAULT_BACKOFF_UNIT, DEFAULT_MAX_ATTEMPTS};
use crate::services::context::Context;
use crate::services::error::{Error, ErrorKind, Result};

/// How often, and how patiently, a conflicting transaction is retried.
///
/// Backoff is linear in the attempt ordinal: after attempt `n` fails the driver
/// waits `n * backoff_unit` before starting attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_unit: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::misconfigured("retry policy needs at least one attempt"));
        }
        Ok(Self {
            max_attempts,
            backoff_unit,
        })
    }

    /// One attempt, no retry.
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            backoff_unit: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_unit(&self) -> Duration {
        self.backoff_unit
    }

    /// Delay after the failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }
}

/// Run `attempt_fn` until it succeeds, fails with an error `classifier` does not
/// retry, or `policy.max_attempts()` attempts have failed.
///
/// The attempt ordinal (starting at 1) is passed to `attempt_fn`. Once attempts
/// are exhausted the last error is returned as it was produced. If `ctx` is done
/// the loop stops and reports a `Canceled` error, even when the failed attempt
/// reported something else.
pub async fn with_retry<F, Fut, T>(
    ctx: &Context,
    policy: &RetryPolicy,
    classifier: &dyn ConflictClassifier,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        if let Some(reason) = ctx.err() {
            return Err(Error::canceled(reason));
        }

        let err = match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let Some(reason) = ctx.err() {
            if err.kind() == ErrorKind::Canceled {
                return Err(err);
            }
            return Err(Error::canceled_during(reason, err));
        }

        if !classifier.is_retryable(&err) {
            return Err(err);
        }

        if attempt >= policy.max_attempts() {
            warn!(
                "giving up after {} conflicting attempts: {}",
                attempt, err
            );
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        debug!(
            "attempt {} conflicted, retrying in {:?}: {}",
            attempt, delay, err
        );

        tokio::select! {
            reason = ctx.done() => return Err(Error::canceled_during(reason, err)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sqlx::error::DatabaseError;
    use tokio::time::Instant;

    use super::*;

    /// Retries anything tagged `Conflict`.
    struct ByKind;

    impl ConflictClassifier for ByKind {
        fn is_conflict(&self, _err: &(dyn DatabaseError + 'static)) -> bool {
            false
        }

        fn is_retryable(&self, err: &Error) -> bool {
            err.kind() == ErrorKind::Conflict
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn test_policy_rejects_zero_attempts() {
        let err = RetryPolicy::new(0, Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Misconfigured);
    }

    #[test]
    fn test_backoff_is_linear() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(RetryPolicy::default().max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_on_every_attempt_runs_max_attempts() {
        let ctx = Context::background();
        let attempts = Mutex::new(Vec::new());
        let started = Instant::now();

        let err = with_retry(&ctx, &policy(), &ByKind, |attempt| {
            attempts.lock().unwrap().push(attempt);
            async move { Err::<(), _>(Error::conflict(format!("deadlock #{attempt}"))) }
        })
        .await
        .unwrap_err();

        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.message(), "deadlock #4");
        // 100 + 200 + 300 ms of backoff between the four attempts
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_runs_once() {
        let ctx = Context::background();
        let mut calls = 0;

        let err = with_retry(&ctx, &policy(), &ByKind, |_| {
            calls += 1;
            async { Err::<(), _>(Error::not_found("user 7")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "user 7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_conflicts() {
        let ctx = Context::background();
        let value = with_retry(&ctx, &policy(), &ByKind, |attempt| async move {
            if attempt < 3 {
                Err(Error::conflict("serialization failure"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt_surfaces_canceled() {
        let (ctx, cancel) = Context::background().with_cancel();
        let mut calls = 0;

        let err = with_retry(&ctx, &policy(), &ByKind, |_| {
            calls += 1;
            cancel.cancel();
            async { Err::<(), _>(Error::conflict("deadlock")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert!(err.is(ErrorKind::Conflict));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_backoff_stops_retrying() {
        // Expires during the 100ms sleep after the first attempt.
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let mut calls = 0;

        let err = with_retry(&ctx, &policy(), &ByKind, |_| {
            calls += 1;
            async { Err::<(), _>(Error::conflict("lock timeout")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_canceled_context_runs_nothing() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let mut calls = 0;

        let err = with_retry(&ctx, &policy(), &ByKind, |_| {
            calls += 1;
            async { Ok(()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 0);
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }
}
