//! Provider abstraction
//!
//! The workflow talks to its infrastructure through three narrow traits:
//! [`ComputePool`] for pool and node lifecycle, [`ObjectStorage`] for blob
//! staging and signed references, and [`TaskExecution`] for jobs and tasks.
//! Vendor SDKs live behind these seams; the orchestration core never sees
//! them. A filesystem-backed [`local`] implementation ships for development
//! and integration testing; cloud backends plug in through the same factory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub mod local;

/// Provider-level result shorthand
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

// =============================================================================
// Data Model
// =============================================================================

/// Pool allocation state, as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    /// Node count is changing toward the target
    Resizing,
    /// An in-flight resize is being aborted
    Stopping,
    /// Node count matches the target
    Steady,
}

/// Pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolLifecycleState {
    /// The pool accepts work
    Active,
    /// Deletion is in progress
    Deleting,
}

/// Snapshot of a pool's state
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Pool identifier
    pub id: String,
    /// Current allocation state
    pub allocation_state: AllocationState,
    /// Current lifecycle state
    pub lifecycle_state: PoolLifecycleState,
    /// Desired dedicated node count
    pub target_dedicated_nodes: u32,
}

/// Per-node scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Machine is being provisioned
    Creating,
    /// Machine is booting the agent
    Starting,
    /// Ready and waiting for work
    Idle,
    /// Executing a task
    Running,
    /// Failed provisioning or health checks
    Unusable,
}

/// A worker machine within a pool
#[derive(Debug, Clone)]
pub struct Node {
    /// Node identifier, unique within its pool
    pub id: String,
    /// Current scheduling state
    pub state: NodeState,
}

/// Operating system family of a machine image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsType {
    /// Linux distributions
    Linux,
    /// Windows Server images
    Windows,
}

/// Whether the provider has verified the image against its worker agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageVerification {
    /// Tested and supported
    Verified,
    /// Usable but untested
    Unverified,
}

/// Publisher coordinates identifying a machine image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Image publisher, e.g. `Canonical`
    pub publisher: String,
    /// Image offer, e.g. `0001-com-ubuntu-server-jammy`
    pub offer: String,
    /// Image SKU
    pub sku: String,
    /// Image version
    pub version: String,
}

/// A machine image the provider can boot workers from
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Operating system family
    pub os_type: OsType,
    /// Verification status against the worker agent
    pub verification: ImageVerification,
    /// Publisher coordinates
    pub reference: ImageReference,
    /// Agent SKU the provider pairs with this image
    pub node_agent_sku_id: String,
}

/// Everything needed to create a pool
#[derive(Debug, Clone)]
pub struct PoolCreateSpec {
    /// Pool identifier
    pub id: String,
    /// Machine size name, e.g. `standard_a1_v2`
    pub vm_size: String,
    /// Image to boot nodes from
    pub image: ImageReference,
    /// Agent SKU paired with the image
    pub node_agent_sku_id: String,
    /// Desired dedicated node count
    pub target_dedicated_nodes: u32,
}

/// Permission scope of a signed reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedPermission {
    /// Download only
    Read,
    /// Upload only
    Write,
}

/// An input file a node downloads before running a task
///
/// `http_url` is a signed reference minted by [`ObjectStorage::signed_url`];
/// the node fetches it without further credentials while the reference is
/// valid.
#[derive(Debug, Clone)]
pub struct ResourceFile {
    /// Path the file lands at, relative to the task working directory
    pub file_path: String,
    /// Read-scoped signed reference to the staged blob
    pub http_url: String,
}

/// When an output-upload rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCondition {
    /// After the task reaches its terminal state, success or failure
    TaskCompletion,
}

/// Provider-enforced rule uploading task output files to storage
///
/// Opaque to the orchestration core: it is built during staging and handed
/// through task submission untouched.
#[derive(Debug, Clone)]
pub struct OutputUploadRule {
    /// Glob over the task working directory, e.g. `*.txt`
    pub file_pattern: String,
    /// Write-scoped signed reference to the destination container
    pub destination: String,
    /// When the upload happens
    pub condition: UploadCondition,
}

/// Everything needed to enqueue one task
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Task identifier, unique within its job
    pub id: String,
    /// Shell command the node runs
    pub command_line: String,
    /// Files downloaded to the node before the command runs
    pub resource_files: Vec<ResourceFile>,
    /// Output files uploaded after the command finishes
    pub output_rules: Vec<OutputUploadRule>,
}

/// Task scheduling state; transitions are monotonic and `Completed` is
/// terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Queued, not yet assigned to a node
    Active,
    /// Resource files are being downloaded
    Preparing,
    /// The command is executing
    Running,
    /// Finished, successfully or not
    Completed,
}

/// How the task's command exited
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    /// Process exit code; zero is success
    pub exit_code: i32,
    /// Provider-reported failure description, if any
    pub failure: Option<String>,
}

/// Snapshot of one task's state
#[derive(Debug, Clone)]
pub struct TaskStatus {
    /// Task identifier
    pub id: String,
    /// Current scheduling state
    pub state: TaskState,
    /// Exit information, present once the task completes
    pub execution: Option<ExecutionInfo>,
}

/// How much of each task to fetch when listing
///
/// The completion watcher polls with `IdAndState` so repeated listings stay
/// cheap; collection asks for `Full` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDetail {
    /// Only id and state; `execution` may be absent
    IdAndState,
    /// Everything, including execution info
    Full,
}

// =============================================================================
// Clock
// =============================================================================

/// Source of the current UTC time
///
/// Injected wherever expiry arithmetic happens so signed-reference validity
/// is testable at the boundary.
pub trait Clock: Send + Sync {
    /// The current instant in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Pool and node lifecycle operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputePool: Send + Sync {
    /// Whether a pool with this id exists
    async fn pool_exists(&self, pool_id: &str) -> ProviderResult<bool>;

    /// Fetch a pool's current status
    async fn get_pool(&self, pool_id: &str) -> ProviderResult<PoolStatus>;

    /// Create a pool; fails with code `PoolExists` if the id is taken
    async fn create_pool(&self, spec: &PoolCreateSpec) -> ProviderResult<()>;

    /// Change an existing pool's target node count
    async fn resize_pool(&self, pool_id: &str, target_dedicated_nodes: u32) -> ProviderResult<()>;

    /// Images the provider can boot workers from
    async fn list_supported_images(&self) -> ProviderResult<Vec<ImageInfo>>;

    /// Nodes in the pool, optionally filtered to one state
    async fn list_nodes(
        &self,
        pool_id: &str,
        state_filter: Option<NodeState>,
    ) -> ProviderResult<Vec<Node>>;

    /// Delete the pool and its nodes
    async fn delete_pool(&self, pool_id: &str) -> ProviderResult<()>;
}

/// Blob staging and signed references
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create the container if it does not already exist; idempotent
    async fn create_container_if_absent(&self, container: &str) -> ProviderResult<()>;

    /// Upload bytes to a named blob, overwriting any previous content
    async fn upload_blob(&self, container: &str, blob: &str, data: &[u8]) -> ProviderResult<()>;

    /// Mint a signed reference to a blob (or, with `blob` absent, to the
    /// container itself), valid until `expires_at`
    async fn signed_url<'a>(
        &self,
        container: &str,
        blob: Option<&'a str>,
        permission: SignedPermission,
        expires_at: DateTime<Utc>,
    ) -> ProviderResult<String>;

    /// Delete the container and everything in it
    async fn delete_container(&self, container: &str) -> ProviderResult<()>;
}

/// Job and task operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskExecution: Send + Sync {
    /// Create a job bound to the pool; fails with code `JobExists` if taken
    async fn create_job(&self, job_id: &str, pool_id: &str) -> ProviderResult<()>;

    /// Enqueue a batch of tasks under the job, all-or-nothing
    async fn create_tasks(&self, job_id: &str, tasks: &[TaskSpec]) -> ProviderResult<()>;

    /// List the job's tasks at the requested level of detail
    async fn list_tasks(&self, job_id: &str, detail: TaskDetail) -> ProviderResult<Vec<TaskStatus>>;

    /// Fetch the named output file of a completed task
    async fn task_output(&self, job_id: &str, task_id: &str, file_name: &str)
        -> ProviderResult<Vec<u8>>;

    /// Delete the job and its tasks
    async fn delete_job(&self, job_id: &str) -> ProviderResult<()>;
}

// =============================================================================
// Factory
// =============================================================================

/// Which backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Filesystem-backed backend for development and tests
    Local,
    /// Azure Batch + Blob Storage
    Azure,
}

/// The three collaborators a run needs, sharing one backend
#[derive(Clone)]
pub struct ProviderSet {
    /// Pool and node lifecycle
    pub compute: Arc<dyn ComputePool>,
    /// Blob staging and signed references
    pub storage: Arc<dyn ObjectStorage>,
    /// Jobs and tasks
    pub exec: Arc<dyn TaskExecution>,
}

/// Construct the providers for the requested backend
///
/// `state_dir` roots the local backend's filesystem state; cloud backends
/// ignore it.
pub fn create_providers(
    kind: ProviderKind,
    state_dir: PathBuf,
    clock: Arc<dyn Clock>,
) -> crate::Result<ProviderSet> {
    match kind {
        ProviderKind::Local => {
            let backend = Arc::new(local::LocalProvider::new(state_dir, clock));
            Ok(ProviderSet {
                compute: backend.clone(),
                storage: backend.clone(),
                exec: backend,
            })
        }
        ProviderKind::Azure => Err(crate::Error::config(
            "azure provider not yet implemented; use the local provider",
        )),
    }
}
