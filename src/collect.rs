//! Result collection
//!
//! Fetches one output stream per completed task: `stdout.txt` when the task
//! exited zero, `stderr.txt` otherwise. Collection is best-effort per task;
//! a task whose output cannot be fetched, or that completed without
//! execution info, contributes a warning instead of failing the run.

use tracing::warn;

use crate::error::Warning;
use crate::provider::{TaskDetail, TaskExecution, TaskState};
use crate::Result;

/// Name of the output stream to fetch for a given exit code
pub fn output_file_name(exit_code: i32) -> &'static str {
    if exit_code == 0 {
        "stdout.txt"
    } else {
        "stderr.txt"
    }
}

/// One task's collected output
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Task identifier
    pub task_id: String,
    /// Which stream was fetched
    pub output_name: String,
    /// The task's exit code
    pub exit_code: i32,
    /// Stream content, lossily decoded
    pub content: String,
}

/// Everything collection produced
#[derive(Debug, Default)]
pub struct CollectReport {
    /// Per-task outputs, in listing order
    pub results: Vec<TaskResult>,
    /// Non-fatal problems observed along the way
    pub warnings: Vec<Warning>,
}

/// Fetch the relevant output stream of every task in the job.
///
/// Task failure is data here, not an error: a nonzero exit contributes its
/// `stderr.txt` as a result plus a warning carrying the provider's failure
/// description. Only a failure to list the job at all is fatal.
pub async fn collect(exec: &dyn TaskExecution, job_id: &str) -> Result<CollectReport> {
    let tasks = exec.list_tasks(job_id, TaskDetail::Full).await?;
    let mut report = CollectReport::default();

    for task in &tasks {
        if task.state != TaskState::Completed {
            report.warnings.push(Warning::new(
                &task.id,
                format!("not completed (state {:?}), skipping output", task.state),
            ));
            continue;
        }

        let Some(execution) = &task.execution else {
            report.warnings.push(Warning::new(
                &task.id,
                "completed without execution info, skipping output",
            ));
            continue;
        };

        if let Some(failure) = &execution.failure {
            warn!(task = %task.id, exit_code = execution.exit_code, %failure, "task failed");
            report
                .warnings
                .push(Warning::new(&task.id, failure.clone()));
        }

        let output_name = output_file_name(execution.exit_code);
        match exec.task_output(job_id, &task.id, output_name).await {
            Ok(bytes) => report.results.push(TaskResult {
                task_id: task.id.clone(),
                output_name: output_name.to_string(),
                exit_code: execution.exit_code,
                content: String::from_utf8_lossy(&bytes).into_owned(),
            }),
            Err(e) => {
                warn!(task = %task.id, error = %e, "cannot fetch output");
                report.warnings.push(Warning::new(
                    &task.id,
                    format!("cannot fetch {}: {}", output_name, e),
                ));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{ExecutionInfo, MockTaskExecution, TaskStatus};
    use mockall::predicate::*;

    fn completed(id: &str, exit_code: i32, failure: Option<&str>) -> TaskStatus {
        TaskStatus {
            id: id.to_string(),
            state: TaskState::Completed,
            execution: Some(ExecutionInfo {
                exit_code,
                failure: failure.map(str::to_string),
            }),
        }
    }

    // ==========================================================================
    // Story: Stream Selection By Exit Code
    // ==========================================================================

    #[test]
    fn zero_exit_reads_stdout_nonzero_reads_stderr() {
        assert_eq!(output_file_name(0), "stdout.txt");
        assert_eq!(output_file_name(1), "stderr.txt");
        assert_eq!(output_file_name(-1), "stderr.txt");
    }

    /// A mixed job fetches stdout for successes and stderr for failures,
    /// with one warning per failed task
    #[tokio::test]
    async fn when_tasks_mix_success_and_failure_each_gets_the_right_stream() {
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks()
            .with(eq("job-1"), eq(TaskDetail::Full))
            .returning(|_, _| {
                Ok(vec![
                    completed("task-0", 0, None),
                    completed("task-1", 2, Some("command exited with code 2")),
                ])
            });
        exec.expect_task_output()
            .with(eq("job-1"), eq("task-0"), eq("stdout.txt"))
            .times(1)
            .returning(|_, _, _| Ok(b"hello".to_vec()));
        exec.expect_task_output()
            .with(eq("job-1"), eq("task-1"), eq("stderr.txt"))
            .times(1)
            .returning(|_, _, _| Ok(b"boom".to_vec()));

        let report = collect(&exec, "job-1").await.unwrap();

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].output_name, "stdout.txt");
        assert_eq!(report.results[0].content, "hello");
        assert_eq!(report.results[1].output_name, "stderr.txt");
        assert_eq!(report.results[1].exit_code, 2);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].target, "task-1");
    }

    // ==========================================================================
    // Story: Per-Task Problems Never Fail The Run
    // ==========================================================================

    /// Missing execution info yields a warning, and the remaining tasks are
    /// still collected
    #[tokio::test]
    async fn when_execution_info_is_absent_task_is_skipped_with_warning() {
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks().returning(|_, _| {
            Ok(vec![
                TaskStatus {
                    id: "task-0".to_string(),
                    state: TaskState::Completed,
                    execution: None,
                },
                completed("task-1", 0, None),
            ])
        });
        exec.expect_task_output()
            .with(eq("job-1"), eq("task-1"), eq("stdout.txt"))
            .times(1)
            .returning(|_, _, _| Ok(b"ok".to_vec()));

        let report = collect(&exec, "job-1").await.unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].target, "task-0");
    }

    /// A fetch failure is a warning for that task only
    #[tokio::test]
    async fn when_one_fetch_fails_other_results_survive() {
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks().returning(|_, _| {
            Ok(vec![completed("task-0", 0, None), completed("task-1", 0, None)])
        });
        exec.expect_task_output()
            .with(eq("job-1"), eq("task-0"), eq("stdout.txt"))
            .returning(|_, _, _| Err(ProviderError::new("FileNotFound", "stdout.txt gone")));
        exec.expect_task_output()
            .with(eq("job-1"), eq("task-1"), eq("stdout.txt"))
            .returning(|_, _, _| Ok(b"fine".to_vec()));

        let report = collect(&exec, "job-1").await.unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].task_id, "task-1");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].message.contains("stdout.txt"));
    }

    /// Listing the job is the only fatal path
    #[tokio::test]
    async fn when_listing_fails_collection_is_fatal() {
        let mut exec = MockTaskExecution::new();
        exec.expect_list_tasks()
            .returning(|_, _| Err(ProviderError::new("JobNotFound", "no job job-1")));

        assert!(collect(&exec, "job-1").await.is_err());
    }
}
