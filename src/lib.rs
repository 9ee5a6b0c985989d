//! Flotilla - bounded-wait batch orchestration over remote worker pools
//!
//! Flotilla submits a small batch of command-line tasks to a pool of remote
//! worker machines, stages local input files through object storage, waits
//! for every task to complete, retrieves output, and tears down the resources
//! it created. The interesting part is the orchestration core: a bounded-wait
//! state machine over an asynchronous, eventually-consistent remote
//! infrastructure, with best-effort cleanup regardless of outcome.
//!
//! # Workflow
//!
//! 1. Stage the input file to object storage and mint a read-scoped,
//!    time-limited signed reference ([`staging`])
//! 2. Ensure the worker pool exists, is steady, and has an idle node ([`pool`])
//! 3. Create a job and enqueue the task batch ([`job`])
//! 4. Poll until every task reaches its terminal state ([`watch`])
//! 5. Fetch each task's output stream ([`collect`])
//! 6. Best-effort deletion of job, pool, and container, always, regardless
//!    of outcome ([`teardown`])
//!
//! # Modules
//!
//! - [`provider`] - collaborator traits (compute pool, object storage, task
//!   execution) and the shared data model; includes a local reference backend
//! - [`poll`] - the poll-until-or-timeout primitive behind every wait
//! - [`staging`] - input staging and output-upload rules
//! - [`pool`] - pool readiness (create-or-resize, steady, idle node)
//! - [`job`] - job and task submission
//! - [`watch`] - task completion watcher
//! - [`collect`] - result collection
//! - [`teardown`] - best-effort cleanup
//! - [`run`] - the orchestrator sequencing all of the above
//! - [`config`] - explicit run configuration
//! - [`error`] - error taxonomy

#![deny(missing_docs)]

pub mod collect;
pub mod config;
pub mod error;
pub mod job;
pub mod poll;
pub mod pool;
pub mod provider;
pub mod run;
pub mod staging;
pub mod teardown;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so CLI defaults, config defaults, and test fixtures agree.

/// Default interval between remote-state polls
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default time allowed for a pool to reach steady allocation
pub const DEFAULT_POOL_STEADY_TIMEOUT_SECS: u64 = 5 * 60;

/// Default time allowed for at least one node to reach the idle state
pub const DEFAULT_NODE_READY_TIMEOUT_SECS: u64 = 20 * 60;

/// Default time allowed for all tasks in a job to complete
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 25 * 60;

/// Validity window for signed references minted during staging
pub const SIGNED_REFERENCE_TTL_HOURS: i64 = 24;
