//! Run configuration
//!
//! Everything a run needs arrives in one explicit [`RunConfig`], loadable
//! from a YAML file and overridable from the CLI. The orchestration core
//! reads no environment variables and consults no ambient process state;
//! callers decide where values come from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Serialize `Duration` as seconds so YAML stays readable and tests can use
/// sub-second intervals.
mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Publisher coordinates used to pick a machine image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSelector {
    /// Image publisher, matched case-insensitively
    pub publisher: String,
    /// Image offer, matched case-insensitively
    pub offer: String,
}

impl Default for ImageSelector {
    fn default() -> Self {
        Self {
            publisher: "canonical".to_string(),
            offer: "0001-com-ubuntu-server-jammy".to_string(),
        }
    }
}

/// Deadlines and poll cadence for the bounded waits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Interval between remote-state polls
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Maximum wait for steady pool allocation
    #[serde(with = "duration_secs")]
    pub pool_steady: Duration,
    /// Maximum wait for an idle node
    #[serde(with = "duration_secs")]
    pub node_ready: Duration,
    /// Maximum wait for all tasks to complete
    #[serde(with = "duration_secs")]
    pub task_completion: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            pool_steady: Duration::from_secs(crate::DEFAULT_POOL_STEADY_TIMEOUT_SECS),
            node_ready: Duration::from_secs(crate::DEFAULT_NODE_READY_TIMEOUT_SECS),
            task_completion: Duration::from_secs(crate::DEFAULT_TASK_TIMEOUT_SECS),
        }
    }
}

/// Which resources teardown deletes
///
/// Disabling a flag keeps the resource for inspection or reuse (a warm pool
/// across runs); teardown still runs for whatever remains enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    /// Delete the job and its tasks
    pub job: bool,
    /// Delete the pool and its nodes
    pub pool: bool,
    /// Delete the staging container
    pub container: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            job: true,
            pool: true,
            container: true,
        }
    }
}

/// Complete configuration for one orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Pool identifier; reused across runs when cleanup keeps it
    pub pool_id: String,
    /// Prefix for the timestamped job id
    pub job_prefix: String,
    /// Staging container name
    pub container: String,
    /// Machine size for pool nodes
    pub vm_size: String,
    /// Image selection coordinates
    pub image: ImageSelector,
    /// Desired dedicated node count
    pub target_node_count: u32,
    /// Number of tasks to submit
    pub task_count: u32,
    /// Local input file staged for every task
    pub input_file: PathBuf,
    /// Directory on the node the input lands in, relative to the task
    /// working directory
    pub node_resource_dir: String,
    /// Command template; `{input}` expands to the staged input's node path
    pub command: String,
    /// Optional glob of output files the provider uploads back to the
    /// staging container on task completion
    pub output_pattern: Option<String>,
    /// Wait deadlines and poll cadence
    pub timeouts: Timeouts,
    /// What teardown deletes
    pub cleanup: CleanupPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pool_id: "pooltest".to_string(),
            job_prefix: "flotilla".to_string(),
            container: "flotilla-staging".to_string(),
            vm_size: "standard_a1_v2".to_string(),
            image: ImageSelector::default(),
            target_node_count: 1,
            task_count: 5,
            input_file: PathBuf::from("test.txt"),
            node_resource_dir: "resources".to_string(),
            command: "cat {input}".to_string(),
            output_pattern: None,
            timeouts: Timeouts::default(),
            cleanup: CleanupPolicy::default(),
        }
    }
}

impl RunConfig {
    /// Load a configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no provider could act on
    pub fn validate(&self) -> Result<()> {
        if self.pool_id.is_empty() {
            return Err(Error::config("pool_id must not be empty"));
        }
        if self.job_prefix.is_empty() {
            return Err(Error::config("job_prefix must not be empty"));
        }
        if self.container.is_empty() {
            return Err(Error::config("container must not be empty"));
        }
        if self.target_node_count == 0 {
            return Err(Error::config("target_node_count must be at least 1"));
        }
        if self.task_count == 0 {
            return Err(Error::config("task_count must be at least 1"));
        }
        if self.command.is_empty() {
            return Err(Error::config("command must not be empty"));
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(Error::config("poll_interval must be positive"));
        }
        Ok(())
    }
}
