//! Task completion watcher
//!
//! Polls the job's task list, projected down to id and state so repeated
//! listings stay cheap, until every task reaches its terminal state or the
//! deadline expires. Exit codes are not inspected here; a task that failed
//! has still completed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::poll::poll_until;
use crate::provider::{TaskDetail, TaskExecution, TaskState};
use crate::Result;

/// Wait until all tasks in the job have completed.
///
/// The returned error is a timeout (`Error::is_timeout`) when the deadline
/// expires with stragglers remaining, so callers can decide whether the
/// completed subset is still worth collecting.
pub async fn await_completion(
    exec: &dyn TaskExecution,
    job_id: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(job = %job_id, ?timeout, "waiting for tasks to complete");
    poll_until(interval, timeout, "all tasks to complete", cancel, || async move {
        let tasks = exec.list_tasks(job_id, TaskDetail::IdAndState).await?;
        let remaining = tasks
            .iter()
            .filter(|t| t.state != TaskState::Completed)
            .count();
        debug!(job = %job_id, total = tasks.len(), remaining, "task poll");
        Ok((remaining == 0).then_some(()))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockTaskExecution, TaskStatus};
    use crate::Error;
    use mockall::predicate::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn statuses(states: &[(&str, TaskState)]) -> Vec<TaskStatus> {
        states
            .iter()
            .map(|(id, state)| TaskStatus {
                id: id.to_string(),
                state: *state,
                execution: None,
            })
            .collect()
    }

    // ==========================================================================
    // Story: All Tasks Complete
    // ==========================================================================

    /// A job whose tasks are all terminal satisfies the wait on the first
    /// poll, using only the id+state projection
    #[tokio::test]
    async fn when_all_tasks_are_complete_wait_returns_on_first_poll() {
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks()
            .with(eq("job-1"), eq(TaskDetail::IdAndState))
            .times(1)
            .returning(|_, _| {
                Ok(statuses(&[
                    ("task-0", TaskState::Completed),
                    ("task-1", TaskState::Completed),
                ]))
            });

        await_completion(
            &exec,
            "job-1",
            Duration::from_millis(5),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    /// Tasks completing over successive polls eventually satisfy the wait
    #[tokio::test]
    async fn when_tasks_finish_gradually_wait_returns_once_all_are_terminal() {
        let polls = Arc::new(AtomicU32::new(0));
        let polls_clone = polls.clone();
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks().returning(move |_, _| {
            let n = polls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(statuses(&[
                ("task-0", TaskState::Completed),
                (
                    "task-1",
                    if n >= 2 { TaskState::Completed } else { TaskState::Running },
                ),
            ]))
        });

        await_completion(
            &exec,
            "job-1",
            Duration::from_millis(5),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    // ==========================================================================
    // Story: Stragglers Hit The Deadline
    // ==========================================================================

    /// One straggler is enough to time the whole job out, and the error is
    /// distinguishable as a timeout
    #[tokio::test]
    async fn when_one_task_never_completes_wait_times_out() {
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks().returning(|_, _| {
            Ok(statuses(&[
                ("task-0", TaskState::Completed),
                ("task-1", TaskState::Active),
            ]))
        });

        let err = await_completion(
            &exec,
            "job-1",
            Duration::from_millis(5),
            Duration::from_millis(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    // ==========================================================================
    // Story: Listing Failures Abort The Wait
    // ==========================================================================

    #[tokio::test]
    async fn when_listing_fails_the_wait_aborts_with_provider_error() {
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks().times(1).returning(|_, _| {
            Err(crate::error::ProviderError::new("JobNotFound", "no job job-1"))
        });

        let err = await_completion(
            &exec,
            "job-1",
            Duration::from_millis(5),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
