//! Job submission
//!
//! Creates a job bound to the ready pool and enqueues the task batch in one
//! call. Job ids are timestamped so repeated runs under the same prefix
//! never collide; task ids are only unique within their job.

use std::sync::Arc;

use tracing::info;

use crate::config::RunConfig;
use crate::provider::{Clock, OutputUploadRule, TaskExecution, TaskSpec};
use crate::staging::StagedResource;
use crate::{Error, Result};

/// Build a collision-avoidant job id: `<prefix>-<UTC yyyymmdd-hhmmss>`
pub fn unique_job_id(prefix: &str, clock: &Arc<dyn Clock>) -> String {
    format!("{}-{}", prefix, clock.now().format("%Y%m%d-%H%M%S"))
}

/// Build the task batch for a run.
///
/// Every task runs the same command with `{input}` expanded to the staged
/// input's node path; ids are `task-0` through `task-(n-1)`.
pub fn build_tasks(
    config: &RunConfig,
    staged: &StagedResource,
    output_rule: Option<&OutputUploadRule>,
) -> Vec<TaskSpec> {
    let command_line = config.command.replace("{input}", &staged.node_path);
    (0..config.task_count)
        .map(|i| TaskSpec {
            id: format!("task-{}", i),
            command_line: command_line.clone(),
            resource_files: vec![staged.resource_file()],
            output_rules: output_rule.iter().map(|&r| r.clone()).collect(),
        })
        .collect()
}

/// Create the job and enqueue its tasks.
///
/// Every rejection here is a `Submit` error: job creation failures (bad
/// pool id, duplicate job id) carry the provider's description, and a
/// refused task batch additionally names the task ids the provider turned
/// away.
pub async fn submit(
    exec: &dyn TaskExecution,
    pool_id: &str,
    job_id: &str,
    tasks: &[TaskSpec],
) -> Result<()> {
    info!(job = %job_id, pool = %pool_id, tasks = tasks.len(), "submitting job");
    exec.create_job(job_id, pool_id)
        .await
        .map_err(|e| Error::submit(format!("job creation rejected: {}", e), Vec::new()))?;

    exec.create_tasks(job_id, tasks).await.map_err(|e| {
        let failed_tasks: Vec<String> = e
            .details
            .iter()
            .filter(|(key, _)| key == "task_id")
            .map(|(_, value)| value.clone())
            .collect();
        Error::submit(format!("task batch rejected: {}", e), failed_tasks)
    })
}
