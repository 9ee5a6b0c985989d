//! Poll-until-or-timeout primitive
//!
//! Every wait in the workflow (pool steady, node idle, task completion) is
//! the same loop: check a remote condition, sleep a fixed interval, give up
//! after a wall-clock deadline. This module is that loop, written once.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Poll `check` at a fixed interval until it yields a value or `timeout`
/// expires.
///
/// `check` returns `Ok(Some(value))` when the awaited condition holds,
/// `Ok(None)` to keep waiting, or `Err` to abort the wait immediately.
/// Elapsed time is wall-clock from entry, so slow checks count against the
/// deadline. The cancellation token is observed at every iteration boundary,
/// including during the sleep.
///
/// `waiting_for` names the condition in the resulting `Timeout`/`Canceled`
/// error.
pub async fn poll_until<F, Fut, T>(
    interval: Duration,
    timeout: Duration,
    waiting_for: &str,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::canceled(waiting_for));
        }

        if let Some(value) = check().await? {
            debug!(waiting_for, elapsed = ?start.elapsed(), "condition met");
            return Ok(value);
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(waiting_for, start.elapsed()));
        }

        debug!(waiting_for, elapsed = ?start.elapsed(), "condition not met, waiting");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                return Err(Error::canceled(waiting_for));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ==========================================================================
    // Story: Condition Already True
    // ==========================================================================

    /// A condition that holds on the first check returns without sleeping
    #[tokio::test]
    async fn when_condition_holds_immediately_no_wait_occurs() {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let value = poll_until(
            Duration::from_secs(60),
            Duration::from_secs(120),
            "test condition",
            &cancel,
            || async { Ok(Some(42)) },
        )
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    // ==========================================================================
    // Story: Condition Becomes True After Several Polls
    // ==========================================================================

    #[tokio::test]
    async fn when_condition_holds_on_third_poll_value_is_returned() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let value = poll_until(
            Duration::from_millis(5),
            Duration::from_secs(5),
            "third time lucky",
            &cancel,
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n >= 3 { Some(n) } else { None })
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    // ==========================================================================
    // Story: Deadline Expiry
    // ==========================================================================

    /// The timeout error names the awaited condition and is classified as
    /// a timeout
    #[tokio::test]
    async fn when_deadline_expires_timeout_error_names_condition() {
        let cancel = CancellationToken::new();

        let result: Result<()> = poll_until(
            Duration::from_millis(5),
            Duration::from_millis(20),
            "pool steady state",
            &cancel,
            || async { Ok(None) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("pool steady state"));
    }

    // ==========================================================================
    // Story: Cancellation
    // ==========================================================================

    /// A token canceled before entry aborts without running the check
    #[tokio::test]
    async fn when_already_canceled_check_never_runs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = poll_until(
            Duration::from_millis(5),
            Duration::from_secs(5),
            "anything",
            &cancel,
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Canceled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Cancellation during the sleep interrupts the wait promptly
    #[tokio::test]
    async fn when_canceled_mid_sleep_wait_aborts_promptly() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let start = Instant::now();
        let result: Result<()> = poll_until(
            Duration::from_secs(60),
            Duration::from_secs(120),
            "tasks to complete",
            &cancel,
            || async { Ok(None) },
        )
        .await;

        assert!(matches!(result, Err(Error::Canceled { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    // ==========================================================================
    // Story: Check Errors Abort Immediately
    // ==========================================================================

    #[tokio::test]
    async fn when_check_fails_error_propagates_without_retry() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = poll_until(
            Duration::from_millis(5),
            Duration::from_secs(5),
            "anything",
            &cancel,
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::config("backend gone"))
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
