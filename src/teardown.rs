//! Best-effort cleanup
//!
//! Deletes the job, the pool, and the staging container, each inside its
//! own failure boundary: one deletion failing never prevents the others,
//! and nothing here is ever fatal. The cleanup policy can keep any of the
//! three, for inspection or for a warm pool across runs.

use tracing::{info, warn};

use crate::config::CleanupPolicy;
use crate::error::Warning;
use crate::provider::{ComputePool, ObjectStorage, TaskExecution};

/// Delete whatever the policy allows, collecting a warning per failure.
///
/// Runs all three deletions regardless of individual outcomes and returns
/// the warnings for the run report.
pub async fn teardown(
    exec: &dyn TaskExecution,
    compute: &dyn ComputePool,
    storage: &dyn ObjectStorage,
    job_id: &str,
    pool_id: &str,
    container: &str,
    policy: &CleanupPolicy,
) -> Vec<Warning> {
    let mut warnings = Vec::new();

    if policy.job {
        match exec.delete_job(job_id).await {
            Ok(()) => info!(job = %job_id, "deleted job"),
            Err(e) => {
                warn!(job = %job_id, error = %e, "failed to delete job");
                warnings.push(Warning::new(format!("job {}", job_id), e.to_string()));
            }
        }
    }

    if policy.pool {
        match compute.delete_pool(pool_id).await {
            Ok(()) => info!(pool = %pool_id, "deleted pool"),
            Err(e) => {
                warn!(pool = %pool_id, error = %e, "failed to delete pool");
                warnings.push(Warning::new(format!("pool {}", pool_id), e.to_string()));
            }
        }
    }

    if policy.container {
        match storage.delete_container(container).await {
            Ok(()) => info!(container, "deleted container"),
            Err(e) => {
                warn!(container, error = %e, "failed to delete container");
                warnings.push(Warning::new(format!("container {}", container), e.to_string()));
            }
        }
    }

    warnings
}
