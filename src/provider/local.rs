//! Filesystem-backed reference provider
//!
//! Implements all three collaborator traits against a local state directory:
//! blobs are files under `storage/`, pools are records whose allocation
//! becomes steady after a configurable boot delay, and tasks genuinely run
//! via `sh -c` in a per-task working directory, capturing `stdout.txt` and
//! `stderr.txt` the way a real worker agent would.
//!
//! Signed references use a `local://` scheme carrying the permission scope
//! and expiry, and the backend enforces both when a task materializes its
//! resource files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::error::ProviderError;

use super::{
    AllocationState, Clock, ComputePool, ExecutionInfo, ImageInfo, ImageReference,
    ImageVerification, Node, NodeState, ObjectStorage, OsType, PoolCreateSpec,
    PoolLifecycleState, PoolStatus, ProviderResult, SignedPermission, TaskDetail, TaskExecution,
    TaskSpec, TaskState, TaskStatus, UploadCondition,
};

// =============================================================================
// Signed References
// =============================================================================

/// A parsed `local://` signed reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRef {
    /// Container the reference grants access to
    pub container: String,
    /// Blob within the container; absent for container-scoped references
    pub blob: Option<String>,
    /// Granted permission
    pub permission: SignedPermission,
    /// Instant after which the reference is rejected
    pub expires_at: DateTime<Utc>,
}

fn format_local_url(sref: &SignedRef) -> String {
    let path = match &sref.blob {
        Some(blob) => format!("{}/{}", sref.container, blob),
        None => sref.container.clone(),
    };
    let sp = match sref.permission {
        SignedPermission::Read => "r",
        SignedPermission::Write => "w",
    };
    format!("local://{}?sp={}&se={}", path, sp, sref.expires_at.to_rfc3339())
}

/// Parse a `local://` reference back into its parts
pub fn parse_local_url(url: &str) -> ProviderResult<SignedRef> {
    let rest = url
        .strip_prefix("local://")
        .ok_or_else(|| ProviderError::new("InvalidUrl", format!("not a local:// url: {}", url)))?;
    let (path, query) = rest
        .split_once('?')
        .ok_or_else(|| ProviderError::new("InvalidUrl", "missing signature query"))?;

    let (container, blob) = match path.split_once('/') {
        Some((c, b)) => (c.to_string(), Some(b.to_string())),
        None => (path.to_string(), None),
    };

    let mut permission = None;
    let mut expires_at = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("sp", "r")) => permission = Some(SignedPermission::Read),
            Some(("sp", "w")) => permission = Some(SignedPermission::Write),
            Some(("se", ts)) => {
                let parsed = DateTime::parse_from_rfc3339(ts).map_err(|e| {
                    ProviderError::new("InvalidUrl", format!("bad expiry timestamp: {}", e))
                })?;
                expires_at = Some(parsed.with_timezone(&Utc));
            }
            _ => {}
        }
    }

    Ok(SignedRef {
        container,
        blob,
        permission: permission
            .ok_or_else(|| ProviderError::new("InvalidUrl", "missing permission"))?,
        expires_at: expires_at.ok_or_else(|| ProviderError::new("InvalidUrl", "missing expiry"))?,
    })
}

/// Match a file name against a single-`*` style glob
fn glob_matches(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone)]
struct PoolRecord {
    target_dedicated_nodes: u32,
    // Allocation becomes steady once this instant passes
    steady_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TaskRecord {
    state: TaskState,
    execution: Option<ExecutionInfo>,
}

#[derive(Debug, Clone)]
struct JobRecord {
    #[allow(dead_code)]
    pool_id: String,
    // Insertion order preserved separately so listings are deterministic
    task_order: Vec<String>,
    tasks: HashMap<String, TaskRecord>,
}

#[derive(Debug, Default)]
struct LocalState {
    pools: HashMap<String, PoolRecord>,
    jobs: HashMap<String, JobRecord>,
}

/// The filesystem-backed provider
///
/// Layout under the state directory:
/// `storage/<container>/<blob>` for blobs, `jobs/<job>/<task>/` for task
/// working directories.
pub struct LocalProvider {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    boot_delay: ChronoDuration,
    // Never held across an await
    state: Arc<Mutex<LocalState>>,
}

impl LocalProvider {
    /// Create a provider rooted at `root`, with instant node boot
    pub fn new(root: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            root,
            clock,
            boot_delay: ChronoDuration::zero(),
            state: Arc::new(Mutex::new(LocalState::default())),
        }
    }

    /// Delay between pool create/resize and steady allocation, to exercise
    /// the readiness waits
    pub fn with_boot_delay(mut self, delay: ChronoDuration) -> Self {
        self.boot_delay = delay;
        self
    }

    fn storage_dir(&self, container: &str) -> PathBuf {
        self.root.join("storage").join(container)
    }

    fn task_dir(&self, job_id: &str, task_id: &str) -> PathBuf {
        self.root.join("jobs").join(job_id).join(task_id)
    }

    fn pool_status(&self, id: &str, record: &PoolRecord) -> PoolStatus {
        let allocation_state = if self.clock.now() >= record.steady_at {
            AllocationState::Steady
        } else {
            AllocationState::Resizing
        };
        PoolStatus {
            id: id.to_string(),
            allocation_state,
            lifecycle_state: PoolLifecycleState::Active,
            target_dedicated_nodes: record.target_dedicated_nodes,
        }
    }
}

// =============================================================================
// Task Execution Worker
// =============================================================================

struct TaskWorker {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<LocalState>>,
    job_id: String,
    spec: TaskSpec,
}

impl TaskWorker {
    fn set_task(&self, state: TaskState, execution: Option<ExecutionInfo>) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = guard.jobs.get_mut(&self.job_id) {
            if let Some(task) = job.tasks.get_mut(&self.spec.id) {
                task.state = state;
                task.execution = execution;
            }
        }
    }

    async fn fail(&self, dir: &Path, message: String) {
        warn!(job = %self.job_id, task = %self.spec.id, %message, "task failed");
        let _ = tokio::fs::write(dir.join("stdout.txt"), b"").await;
        let _ = tokio::fs::write(dir.join("stderr.txt"), message.as_bytes()).await;
        self.set_task(
            TaskState::Completed,
            Some(ExecutionInfo {
                exit_code: 1,
                failure: Some(message),
            }),
        );
    }

    /// Download-equivalent: copy each resource blob into the working
    /// directory, enforcing the reference's scope and expiry.
    async fn materialize_resources(&self, dir: &Path) -> Result<(), String> {
        for resource in &self.spec.resource_files {
            let sref = parse_local_url(&resource.http_url).map_err(|e| e.to_string())?;
            if sref.permission != SignedPermission::Read {
                return Err(format!(
                    "reference for {} is not read-scoped",
                    resource.file_path
                ));
            }
            if self.clock.now() > sref.expires_at {
                return Err(format!(
                    "reference for {} expired at {}",
                    resource.file_path, sref.expires_at
                ));
            }
            let blob = sref
                .blob
                .as_deref()
                .ok_or_else(|| format!("reference for {} names no blob", resource.file_path))?;
            let source = self.root.join("storage").join(&sref.container).join(blob);
            let target = dir.join(&resource.file_path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            tokio::fs::copy(&source, &target).await.map_err(|e| {
                format!("cannot fetch {}: {}", resource.file_path, e)
            })?;
        }
        Ok(())
    }

    /// Agent-equivalent: upload matching working-directory files to the
    /// rule's destination container under the task's name.
    async fn apply_output_rules(&self, dir: &Path) {
        for rule in &self.spec.output_rules {
            let UploadCondition::TaskCompletion = rule.condition;
            let sref = match parse_local_url(&rule.destination) {
                Ok(s) => s,
                Err(e) => {
                    warn!(task = %self.spec.id, error = %e, "bad output destination");
                    continue;
                }
            };
            if sref.permission != SignedPermission::Write || self.clock.now() > sref.expires_at {
                warn!(task = %self.spec.id, "output destination rejected");
                continue;
            }
            let dest_dir = self
                .root
                .join("storage")
                .join(&sref.container)
                .join(&self.spec.id);
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if !glob_matches(&rule.file_pattern, &name) {
                    continue;
                }
                if tokio::fs::create_dir_all(&dest_dir).await.is_ok() {
                    let _ = tokio::fs::copy(entry.path(), dest_dir.join(&name)).await;
                }
            }
        }
    }

    async fn run(self) {
        let dir = self.root.join("jobs").join(&self.job_id).join(&self.spec.id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            self.fail(&dir, format!("cannot create working directory: {}", e))
                .await;
            return;
        }

        self.set_task(TaskState::Preparing, None);
        if let Err(message) = self.materialize_resources(&dir).await {
            self.fail(&dir, message).await;
            self.apply_output_rules(&dir).await;
            return;
        }

        self.set_task(TaskState::Running, None);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.spec.command_line)
            .current_dir(&dir)
            .output()
            .await;

        match output {
            Ok(out) => {
                let _ = tokio::fs::write(dir.join("stdout.txt"), &out.stdout).await;
                let _ = tokio::fs::write(dir.join("stderr.txt"), &out.stderr).await;
                let exit_code = out.status.code().unwrap_or(-1);
                let failure = if exit_code == 0 {
                    None
                } else {
                    Some(format!("command exited with code {}", exit_code))
                };
                debug!(job = %self.job_id, task = %self.spec.id, exit_code, "task finished");
                self.apply_output_rules(&dir).await;
                self.set_task(TaskState::Completed, Some(ExecutionInfo { exit_code, failure }));
            }
            Err(e) => {
                self.fail(&dir, format!("cannot spawn command: {}", e)).await;
                self.apply_output_rules(&dir).await;
            }
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

#[async_trait]
impl ComputePool for LocalProvider {
    async fn pool_exists(&self, pool_id: &str) -> ProviderResult<bool> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.pools.contains_key(pool_id))
    }

    async fn get_pool(&self, pool_id: &str) -> ProviderResult<PoolStatus> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = guard
            .pools
            .get(pool_id)
            .ok_or_else(|| ProviderError::new("PoolNotFound", format!("no pool {}", pool_id)))?;
        Ok(self.pool_status(pool_id, record))
    }

    async fn create_pool(&self, spec: &PoolCreateSpec) -> ProviderResult<()> {
        let steady_at = self.clock.now() + self.boot_delay;
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.pools.contains_key(&spec.id) {
            return Err(ProviderError::new(
                "PoolExists",
                format!("pool {} already exists", spec.id),
            )
            .with_detail("pool_id", &spec.id));
        }
        debug!(pool = %spec.id, nodes = spec.target_dedicated_nodes, "creating pool");
        guard.pools.insert(
            spec.id.clone(),
            PoolRecord {
                target_dedicated_nodes: spec.target_dedicated_nodes,
                steady_at,
            },
        );
        Ok(())
    }

    async fn resize_pool(&self, pool_id: &str, target_dedicated_nodes: u32) -> ProviderResult<()> {
        let steady_at = self.clock.now() + self.boot_delay;
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = guard
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| ProviderError::new("PoolNotFound", format!("no pool {}", pool_id)))?;
        debug!(pool = %pool_id, nodes = target_dedicated_nodes, "resizing pool");
        record.target_dedicated_nodes = target_dedicated_nodes;
        record.steady_at = steady_at;
        Ok(())
    }

    async fn list_supported_images(&self) -> ProviderResult<Vec<ImageInfo>> {
        Ok(vec![
            ImageInfo {
                os_type: OsType::Windows,
                verification: ImageVerification::Verified,
                reference: ImageReference {
                    publisher: "MicrosoftWindowsServer".into(),
                    offer: "WindowsServer".into(),
                    sku: "2022-datacenter".into(),
                    version: "latest".into(),
                },
                node_agent_sku_id: "batch.node.windows amd64".into(),
            },
            ImageInfo {
                os_type: OsType::Linux,
                verification: ImageVerification::Unverified,
                reference: ImageReference {
                    publisher: "Canonical".into(),
                    offer: "0001-com-ubuntu-server-jammy".into(),
                    sku: "22_04-lts-preview".into(),
                    version: "latest".into(),
                },
                node_agent_sku_id: "batch.node.ubuntu 22.04".into(),
            },
            ImageInfo {
                os_type: OsType::Linux,
                verification: ImageVerification::Verified,
                reference: ImageReference {
                    publisher: "Canonical".into(),
                    offer: "0001-com-ubuntu-server-jammy".into(),
                    sku: "22_04-lts".into(),
                    version: "latest".into(),
                },
                node_agent_sku_id: "batch.node.ubuntu 22.04".into(),
            },
        ])
    }

    async fn list_nodes(
        &self,
        pool_id: &str,
        state_filter: Option<NodeState>,
    ) -> ProviderResult<Vec<Node>> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = guard
            .pools
            .get(pool_id)
            .ok_or_else(|| ProviderError::new("PoolNotFound", format!("no pool {}", pool_id)))?;
        let node_state = if self.clock.now() >= record.steady_at {
            NodeState::Idle
        } else {
            NodeState::Creating
        };
        let nodes: Vec<Node> = (0..record.target_dedicated_nodes)
            .map(|i| Node {
                id: format!("{}-node-{}", pool_id, i),
                state: node_state,
            })
            .filter(|n| state_filter.map_or(true, |s| n.state == s))
            .collect();
        Ok(nodes)
    }

    async fn delete_pool(&self, pool_id: &str) -> ProviderResult<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .pools
            .remove(pool_id)
            .ok_or_else(|| ProviderError::new("PoolNotFound", format!("no pool {}", pool_id)))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for LocalProvider {
    async fn create_container_if_absent(&self, container: &str) -> ProviderResult<()> {
        tokio::fs::create_dir_all(self.storage_dir(container))
            .await
            .map_err(|e| ProviderError::new("StorageIo", e.to_string()))
    }

    async fn upload_blob(&self, container: &str, blob: &str, data: &[u8]) -> ProviderResult<()> {
        let dir = self.storage_dir(container);
        if !dir.is_dir() {
            return Err(ProviderError::new(
                "ContainerNotFound",
                format!("no container {}", container),
            ));
        }
        tokio::fs::write(dir.join(blob), data)
            .await
            .map_err(|e| ProviderError::new("StorageIo", e.to_string()))
    }

    async fn signed_url<'a>(
        &self,
        container: &str,
        blob: Option<&'a str>,
        permission: SignedPermission,
        expires_at: DateTime<Utc>,
    ) -> ProviderResult<String> {
        Ok(format_local_url(&SignedRef {
            container: container.to_string(),
            blob: blob.map(str::to_string),
            permission,
            expires_at,
        }))
    }

    async fn delete_container(&self, container: &str) -> ProviderResult<()> {
        let dir = self.storage_dir(container);
        if !dir.is_dir() {
            return Err(ProviderError::new(
                "ContainerNotFound",
                format!("no container {}", container),
            ));
        }
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| ProviderError::new("StorageIo", e.to_string()))
    }
}

#[async_trait]
impl TaskExecution for LocalProvider {
    async fn create_job(&self, job_id: &str, pool_id: &str) -> ProviderResult<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.pools.contains_key(pool_id) {
            return Err(ProviderError::new(
                "PoolNotFound",
                format!("job {} references missing pool {}", job_id, pool_id),
            ));
        }
        if guard.jobs.contains_key(job_id) {
            return Err(
                ProviderError::new("JobExists", format!("job {} already exists", job_id))
                    .with_detail("job_id", job_id),
            );
        }
        debug!(job = %job_id, pool = %pool_id, "creating job");
        guard.jobs.insert(
            job_id.to_string(),
            JobRecord {
                pool_id: pool_id.to_string(),
                task_order: Vec::new(),
                tasks: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn create_tasks(&self, job_id: &str, tasks: &[TaskSpec]) -> ProviderResult<()> {
        // Validate the whole batch before accepting any of it
        {
            let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let job = guard
                .jobs
                .get(job_id)
                .ok_or_else(|| ProviderError::new("JobNotFound", format!("no job {}", job_id)))?;

            let mut rejected = ProviderError::new("InvalidTask", "task batch rejected");
            let mut any_bad = false;
            let mut seen = std::collections::HashSet::new();
            for task in tasks {
                let reason = if task.id.is_empty() || task.command_line.is_empty() {
                    Some("empty id or command")
                } else if job.tasks.contains_key(&task.id) || !seen.insert(task.id.clone()) {
                    Some("duplicate task id")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    any_bad = true;
                    rejected = rejected.with_detail("task_id", &task.id).with_detail("reason", reason);
                }
            }
            if any_bad {
                return Err(rejected);
            }
        }

        for spec in tasks {
            {
                let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let job = guard.jobs.get_mut(job_id).expect("validated above");
                job.task_order.push(spec.id.clone());
                job.tasks.insert(
                    spec.id.clone(),
                    TaskRecord {
                        state: TaskState::Active,
                        execution: None,
                    },
                );
            }
            let worker = TaskWorker {
                root: self.root.clone(),
                clock: self.clock.clone(),
                state: self.state.clone(),
                job_id: job_id.to_string(),
                spec: spec.clone(),
            };
            tokio::spawn(worker.run());
        }
        Ok(())
    }

    async fn list_tasks(
        &self,
        job_id: &str,
        detail: TaskDetail,
    ) -> ProviderResult<Vec<TaskStatus>> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let job = guard
            .jobs
            .get(job_id)
            .ok_or_else(|| ProviderError::new("JobNotFound", format!("no job {}", job_id)))?;
        Ok(job
            .task_order
            .iter()
            .filter_map(|id| job.tasks.get(id).map(|t| (id, t)))
            .map(|(id, task)| TaskStatus {
                id: id.clone(),
                state: task.state,
                execution: match detail {
                    TaskDetail::IdAndState => None,
                    TaskDetail::Full => task.execution.clone(),
                },
            })
            .collect())
    }

    async fn task_output(
        &self,
        job_id: &str,
        task_id: &str,
        file_name: &str,
    ) -> ProviderResult<Vec<u8>> {
        {
            let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let job = guard
                .jobs
                .get(job_id)
                .ok_or_else(|| ProviderError::new("JobNotFound", format!("no job {}", job_id)))?;
            if !job.tasks.contains_key(task_id) {
                return Err(ProviderError::new(
                    "TaskNotFound",
                    format!("no task {} in job {}", task_id, job_id),
                ));
            }
        }
        tokio::fs::read(self.task_dir(job_id, task_id).join(file_name))
            .await
            .map_err(|e| {
                ProviderError::new("FileNotFound", format!("{}: {}", file_name, e))
                    .with_detail("task_id", task_id)
            })
    }

    async fn delete_job(&self, job_id: &str) -> ProviderResult<()> {
        {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .jobs
                .remove(job_id)
                .ok_or_else(|| ProviderError::new("JobNotFound", format!("no job {}", job_id)))?;
        }
        let dir = self.root.join("jobs").join(job_id);
        if dir.is_dir() {
            tokio::fs::remove_dir_all(dir)
                .await
                .map_err(|e| ProviderError::new("StorageIo", e.to_string()))?;
        }
        Ok(())
    }
}
