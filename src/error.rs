//! Error types for flotilla
//!
//! One fatal taxonomy for the orchestration core, plus the non-fatal
//! [`Warning`] carried by result collection and teardown. Task failure
//! (nonzero exit code) is data in the run report, never an `Error`.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during an orchestration run
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unusable configuration, detected before any remote mutation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded wait expired before its condition held
    #[error("Timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        /// Human-readable description of the awaited condition
        waiting_for: String,
        /// Wall-clock time spent waiting
        elapsed: Duration,
    },

    /// A wait was interrupted by cancellation
    #[error("Canceled while waiting for {waiting_for}")]
    Canceled {
        /// Human-readable description of the awaited condition
        waiting_for: String,
    },

    /// The remote provider rejected or failed an operation
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Task batch submission failed, in whole or in part
    #[error("Submit error: {message} (failed tasks: {failed_tasks:?})")]
    Submit {
        /// What went wrong
        message: String,
        /// Ids of the tasks that were not accepted
        failed_tasks: Vec<String>,
    },

    /// Local filesystem I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a timeout error for the named wait
    pub fn timeout(waiting_for: impl Into<String>, elapsed: Duration) -> Self {
        Error::Timeout {
            waiting_for: waiting_for.into(),
            elapsed,
        }
    }

    /// Create a cancellation error for the named wait
    pub fn canceled(waiting_for: impl Into<String>) -> Self {
        Error::Canceled {
            waiting_for: waiting_for.into(),
        }
    }

    /// Create a submission error naming the rejected task ids
    pub fn submit(msg: impl Into<String>, failed_tasks: Vec<String>) -> Self {
        Error::Submit {
            message: msg.into(),
            failed_tasks,
        }
    }

    /// True when the run ended because a bounded wait expired.
    ///
    /// Cancellation counts: the orchestrator treats a canceled wait exactly
    /// like an expired one (abort the phase, run teardown).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Canceled { .. })
    }
}

/// Vendor-agnostic failure reported by a provider implementation
///
/// Carries a machine-readable code, a message, and an optional list of
/// key/value details the way batch service errors do.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Stable machine-readable code, e.g. `PoolExists`, `JobNotFound`
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Additional key/value context from the provider
    pub details: Vec<(String, String)>,
}

impl ProviderError {
    /// Create a provider error with a code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Attach a key/value detail
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.push((key.into(), value.into()));
        self
    }

    /// Multi-line rendering including details, for operator-facing output
    pub fn pretty(&self) -> String {
        let mut out = format!("{}: {}", self.code, self.message);
        for (key, value) in &self.details {
            out.push_str(&format!("\n  {}: {}", key, value));
        }
        out
    }
}

/// Non-fatal problem observed during collection or teardown
#[derive(Debug, Clone)]
pub struct Warning {
    /// The resource or task the warning concerns
    pub target: String,
    /// What happened
    pub message: String,
}

impl Warning {
    /// Create a warning about the named target
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.target, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story: Error Display Formatting
    // ==========================================================================

    #[test]
    fn config_error_displays_message() {
        let err = Error::config("no matching image for publisher 'canonical'");
        assert_eq!(
            err.to_string(),
            "Configuration error: no matching image for publisher 'canonical'"
        );
    }

    #[test]
    fn timeout_error_names_the_awaited_condition() {
        let err = Error::timeout("pool steady state", Duration::from_secs(300));
        assert!(err.to_string().contains("pool steady state"));
        assert!(err.to_string().contains("300"));
    }

    #[test]
    fn provider_error_pretty_includes_details() {
        let err = ProviderError::new("PoolExists", "pool already exists")
            .with_detail("pool_id", "alice-pooltest");
        let pretty = err.pretty();
        assert!(pretty.starts_with("PoolExists: pool already exists"));
        assert!(pretty.contains("pool_id: alice-pooltest"));
    }

    // ==========================================================================
    // Story: Timeout Classification
    //
    // Callers branch on is_timeout to decide whether results may still be
    // worth collecting; cancellation is an implicit timeout.
    // ==========================================================================

    #[test]
    fn timeout_and_canceled_classify_as_timeout() {
        assert!(Error::timeout("tasks", Duration::from_secs(1)).is_timeout());
        assert!(Error::canceled("tasks").is_timeout());
    }

    #[test]
    fn other_errors_do_not_classify_as_timeout() {
        assert!(!Error::config("bad").is_timeout());
        assert!(!Error::from(ProviderError::new("X", "y")).is_timeout());
        assert!(!Error::submit("partial", vec!["task-3".into()]).is_timeout());
    }
}
