//! The orchestrator
//!
//! Sequences the workflow phases: staging, pool readiness, submission, the
//! completion wait, and collection, then always runs teardown, whatever
//! happened before it. One `Orchestrator` value is one configured run;
//! every collaborator arrives through the constructor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::collect::{collect, CollectReport, TaskResult};
use crate::config::RunConfig;
use crate::error::Warning;
use crate::job::{build_tasks, submit, unique_job_id};
use crate::pool::ensure_ready;
use crate::provider::{Clock, ProviderSet};
use crate::staging::{stage, stage_output_rule};
use crate::teardown::teardown;
use crate::watch::await_completion;
use crate::Result;

/// What a completed run produced
#[derive(Debug)]
pub struct RunReport {
    /// The timestamped job id this run used
    pub job_id: String,
    /// The pool the job ran on
    pub pool_id: String,
    /// Per-task outputs, in task order
    pub results: Vec<TaskResult>,
    /// Non-fatal problems from collection and teardown
    pub warnings: Vec<Warning>,
    /// Wall-clock duration of the whole run, teardown included
    pub elapsed: Duration,
}

/// Drives one batch run end to end
pub struct Orchestrator {
    providers: ProviderSet,
    clock: Arc<dyn Clock>,
    config: RunConfig,
}

impl Orchestrator {
    /// Build an orchestrator, rejecting unusable configuration up front
    pub fn new(
        providers: ProviderSet,
        clock: Arc<dyn Clock>,
        config: RunConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            providers,
            clock,
            config,
        })
    }

    /// Run the workflow.
    ///
    /// Teardown runs exactly once, whether the phases succeeded, failed, or
    /// were canceled; its warnings join the report on success and are logged
    /// on failure. The fatal error, if any, is the phase error, never a
    /// teardown problem.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let start = Instant::now();
        let job_id = unique_job_id(&self.config.job_prefix, &self.clock);
        info!(job = %job_id, pool = %self.config.pool_id, "starting run");

        let outcome = self.execute(&job_id, cancel).await;

        println!("[Phase 6/6] Cleaning up");
        let teardown_warnings = teardown(
            self.providers.exec.as_ref(),
            self.providers.compute.as_ref(),
            self.providers.storage.as_ref(),
            &job_id,
            &self.config.pool_id,
            &self.config.container,
            &self.config.cleanup,
        )
        .await;

        match outcome {
            Ok(report) => {
                let mut warnings = report.warnings;
                warnings.extend(teardown_warnings);
                info!(job = %job_id, elapsed = ?start.elapsed(), "run complete");
                Ok(RunReport {
                    job_id,
                    pool_id: self.config.pool_id.clone(),
                    results: report.results,
                    warnings,
                    elapsed: start.elapsed(),
                })
            }
            Err(e) => {
                error!(job = %job_id, error = %e, "run failed, resources cleaned up");
                for warning in &teardown_warnings {
                    error!(%warning, "cleanup incomplete");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, job_id: &str, cancel: &CancellationToken) -> Result<CollectReport> {
        let config = &self.config;
        let storage = self.providers.storage.as_ref();

        println!(
            "[Phase 1/6] Staging {} to container {}",
            config.input_file.display(),
            config.container
        );
        let staged = stage(
            storage,
            &self.clock,
            &config.container,
            &config.input_file,
            &config.node_resource_dir,
        )
        .await?;
        let output_rule = match &config.output_pattern {
            Some(pattern) => {
                Some(stage_output_rule(storage, &self.clock, &config.container, pattern).await?)
            }
            None => None,
        };

        println!(
            "[Phase 2/6] Ensuring pool {} is ready ({} node(s))",
            config.pool_id, config.target_node_count
        );
        ensure_ready(self.providers.compute.as_ref(), config, cancel).await?;

        println!(
            "[Phase 3/6] Submitting job {} with {} task(s)",
            job_id, config.task_count
        );
        let tasks = build_tasks(config, &staged, output_rule.as_ref());
        submit(
            self.providers.exec.as_ref(),
            &config.pool_id,
            job_id,
            &tasks,
        )
        .await?;

        println!("[Phase 4/6] Waiting for tasks to complete");
        await_completion(
            self.providers.exec.as_ref(),
            job_id,
            config.timeouts.poll_interval,
            config.timeouts.task_completion,
            cancel,
        )
        .await?;

        println!("[Phase 5/6] Collecting task output");
        collect(self.providers.exec.as_ref(), job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{
        MockComputePool, MockObjectStorage, MockTaskExecution, SystemClock,
    };
    use crate::Error;

    fn fast_config(input_file: std::path::PathBuf) -> RunConfig {
        RunConfig {
            pool_id: "alice-pooltest".to_string(),
            input_file,
            timeouts: crate::config::Timeouts {
                poll_interval: Duration::from_millis(5),
                pool_steady: Duration::from_millis(50),
                node_ready: Duration::from_millis(50),
                task_completion: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn providers(
        compute: MockComputePool,
        storage: MockObjectStorage,
        exec: MockTaskExecution,
    ) -> ProviderSet {
        ProviderSet {
            compute: Arc::new(compute),
            storage: Arc::new(storage),
            exec: Arc::new(exec),
        }
    }

    // ==========================================================================
    // Story: Teardown Always Runs
    //
    // Whatever phase fails, all three deletions are still attempted.
    // ==========================================================================

    /// A pool readiness failure still tears down job, pool, and container
    #[tokio::test]
    async fn when_pool_readiness_fails_teardown_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("test.txt");
        std::fs::write(&input, b"hello").unwrap();

        let mut storage = MockObjectStorage::new();
        storage
            .expect_create_container_if_absent()
            .returning(|_| Ok(()));
        storage.expect_upload_blob().returning(|_, _, _| Ok(()));
        storage.expect_signed_url().returning(|_, _, _, _| {
            Ok("local://c/test.txt?sp=r&se=2099-01-01T00:00:00+00:00".to_string())
        });
        storage
            .expect_delete_container()
            .times(1)
            .returning(|_| Ok(()));

        let mut compute = MockComputePool::new();
        compute
            .expect_pool_exists()
            .returning(|_| Err(ProviderError::new("Unavailable", "backend down")));
        compute.expect_delete_pool().times(1).returning(|_| Ok(()));

        let mut exec = MockTaskExecution::new();
        exec.expect_create_job().times(0);
        exec.expect_delete_job()
            .times(1)
            .returning(|_| Err(ProviderError::new("JobNotFound", "never created")));

        let orchestrator = Orchestrator::new(
            providers(compute, storage, exec),
            Arc::new(SystemClock),
            fast_config(input),
        )
        .unwrap();

        let err = orchestrator
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        // The phase error wins; the teardown warning is only logged
        assert!(matches!(err, Error::Provider(_)));
    }

    /// A pre-canceled run aborts at the first wait and still cleans up
    #[tokio::test]
    async fn when_canceled_run_aborts_and_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("test.txt");
        std::fs::write(&input, b"hello").unwrap();

        let mut storage = MockObjectStorage::new();
        storage
            .expect_create_container_if_absent()
            .returning(|_| Ok(()));
        storage.expect_upload_blob().returning(|_, _, _| Ok(()));
        storage.expect_signed_url().returning(|_, _, _, _| {
            Ok("local://c/test.txt?sp=r&se=2099-01-01T00:00:00+00:00".to_string())
        });
        storage
            .expect_delete_container()
            .times(1)
            .returning(|_| Ok(()));

        let mut compute = MockComputePool::new();
        compute.expect_pool_exists().returning(|_| Ok(true));
        compute.expect_get_pool().returning(|id| {
            Ok(crate::provider::PoolStatus {
                id: id.to_string(),
                allocation_state: crate::provider::AllocationState::Resizing,
                lifecycle_state: crate::provider::PoolLifecycleState::Active,
                target_dedicated_nodes: 1,
            })
        });
        compute.expect_resize_pool().returning(|_, _| Ok(()));
        compute.expect_delete_pool().times(1).returning(|_| Ok(()));

        let mut exec = MockTaskExecution::new();
        exec.expect_create_job().times(0);
        exec.expect_delete_job().times(1).returning(|_| Ok(()));

        let orchestrator = Orchestrator::new(
            providers(compute, storage, exec),
            Arc::new(SystemClock),
            fast_config(input),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orchestrator.run(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Canceled { .. }));
    }

    // ==========================================================================
    // Story: Construction Validates Configuration
    // ==========================================================================

    #[tokio::test]
    async fn when_config_is_invalid_construction_fails_before_any_remote_call() {
        let config = RunConfig {
            task_count: 0,
            ..Default::default()
        };
        let result = Orchestrator::new(
            providers(
                MockComputePool::new(),
                MockObjectStorage::new(),
                MockTaskExecution::new(),
            ),
            Arc::new(SystemClock),
            config,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
