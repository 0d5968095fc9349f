//! Error handling module for the orchestration engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All errors in the engine should use these types for consistency.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum OpsError {
    /// No template file exists for the given reference
    #[error("Template not found: {0}")]
    TemplateNotFound(PathBuf),

    /// Template exists but its structure is invalid
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// One or more required parameters were not provided
    #[error("Missing required parameter(s): {0}")]
    MissingParameter(String),

    /// A prerequisite check failed before any step ran
    #[error("Prerequisite failed: {0}")]
    PrerequisiteFailed(String),

    /// A step failed; wraps the originating error with step identity
    #[error("Step '{step}' ({kind}) failed: {message}")]
    StepFailed {
        step: String,
        kind: String,
        message: String,
    },

    /// Lock acquire/release lost the race or the lock is absent when expected
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    /// A local command exited non-zero
    #[error("Command failed: {command} (exit code {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A remote command exited non-zero or timed out
    #[error("Remote command failed on {host}: {message}")]
    RemoteCommandFailed { host: String, message: String },

    /// A health check exhausted its retries
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// State store faults (bad documents, unwritable directories)
    #[error("State error: {0}")]
    State(String),

    /// IO errors (file operations, process spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors from template documents
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP transport errors from health probes
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, OpsError>;

// Convenient error constructors
impl OpsError {
    /// Create an invalid-template error
    pub fn invalid_template(msg: impl Into<String>) -> Self {
        Self::InvalidTemplate(msg.into())
    }

    /// Create a lock conflict error
    pub fn lock_conflict(msg: impl Into<String>) -> Self {
        Self::LockConflict(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Wrap an error as a step failure, tagging it with the step's identity
    pub fn step_failed(step: impl Into<String>, kind: impl Into<String>, err: &Self) -> Self {
        Self::StepFailed {
            step: step.into(),
            kind: kind.into(),
            message: err.to_string(),
        }
    }
}
