//! Resource staging
//!
//! Copies a local file into the staging container and mints a read-scoped
//! signed reference nodes can download without credentials, valid for 24
//! hours. Also builds write-scoped output-upload rules for providers that
//! move task output back to storage on completion.

use std::path::Path;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::info;

use crate::provider::{
    Clock, ObjectStorage, OutputUploadRule, ResourceFile, SignedPermission, UploadCondition,
};
use crate::{Error, Result, SIGNED_REFERENCE_TTL_HOURS};

/// A staged input file, ready to hand to task submission
#[derive(Debug, Clone)]
pub struct StagedResource {
    /// Blob name within the staging container
    pub blob_name: String,
    /// Path the file lands at on the node, relative to the task working
    /// directory
    pub node_path: String,
    /// Read-scoped signed reference
    pub url: String,
}

impl StagedResource {
    /// The provider-facing resource descriptor for this staged file
    pub fn resource_file(&self) -> ResourceFile {
        ResourceFile {
            file_path: self.node_path.clone(),
            http_url: self.url.clone(),
        }
    }
}

/// Upload `local_file` to `container` and mint its signed reference.
///
/// The blob is named after the file; on the node it lands under `node_dir`.
/// The container is created if absent, and re-staging the same file
/// overwrites the previous blob, so repeated runs converge.
pub async fn stage(
    storage: &dyn ObjectStorage,
    clock: &Arc<dyn Clock>,
    container: &str,
    local_file: &Path,
    node_dir: &str,
) -> Result<StagedResource> {
    let blob_name = local_file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::config(format!("unusable input path {}", local_file.display())))?
        .to_string();

    let data = tokio::fs::read(local_file).await?;

    storage.create_container_if_absent(container).await?;
    storage.upload_blob(container, &blob_name, &data).await?;

    let expires_at = clock.now() + ChronoDuration::hours(SIGNED_REFERENCE_TTL_HOURS);
    let url = storage
        .signed_url(container, Some(&blob_name), SignedPermission::Read, expires_at)
        .await?;

    info!(container, blob = %blob_name, bytes = data.len(), "staged input file");

    Ok(StagedResource {
        node_path: format!("{}/{}", node_dir.trim_end_matches('/'), blob_name),
        blob_name,
        url,
    })
}

/// Build an output-upload rule targeting the staging container.
///
/// The destination reference is container-scoped and write-only; the
/// provider uploads files matching `file_pattern` when the task completes,
/// whatever its exit code.
pub async fn stage_output_rule(
    storage: &dyn ObjectStorage,
    clock: &Arc<dyn Clock>,
    container: &str,
    file_pattern: &str,
) -> Result<OutputUploadRule> {
    storage.create_container_if_absent(container).await?;
    let expires_at = clock.now() + ChronoDuration::hours(SIGNED_REFERENCE_TTL_HOURS);
    let destination = storage
        .signed_url(container, None, SignedPermission::Write, expires_at)
        .await?;
    Ok(OutputUploadRule {
        file_pattern: file_pattern.to_string(),
        destination,
        condition: UploadCondition::TaskCompletion,
    })
}
