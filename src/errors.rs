//! Typed error hierarchy for dispatch.
//!
//! One enum per boundary:
//! - `QueueError`: persistence backends; `Unavailable` is fatal to workers
//! - `ValidationError` / `IntakeError`: webhook intake
//! - `SandboxError`: worktree lifecycle
//! - `OrchestratorError`: per-job pipeline failures
//! - `WorkspaceError`: tenant resolution and provisioning
//! - `BoardError`: board list mapping and notification

use dispatch_common::{JobId, JobStatus, PayloadError};
use thiserror::Error;

/// Errors from a `JobQueue` backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue backend '{backend}' unavailable: {cause}")]
    Unavailable {
        backend: &'static str,
        #[source]
        cause: anyhow::Error,
    },

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Corrupt job record {id}: {message}")]
    Corrupt { id: String, message: String },
}

impl QueueError {
    pub fn unavailable(backend: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable {
            backend,
            cause: cause.into(),
        }
    }

    /// Infrastructure failures end the worker process; everything else is per-job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Rejections of an inbound event before anything is enqueued.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing delivery id for source '{source_name}'")]
    MissingDeliveryId { source_name: String },

    #[error("Unsupported event '{event_type}' from source '{source_name}'")]
    UnsupportedEvent {
        source_name: String,
        event_type: String,
    },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error(transparent)]
    Board(#[from] BoardError),
}

/// Failure of `WebhookProcessor::process`.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from sandbox acquisition and release.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox name collision for '{name}': {reason}")]
    NameCollision { name: String, reason: String },

    #[error("Repository error: {0}")]
    Git(String),

    #[error("Sandbox I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<git2::Error> for SandboxError {
    fn from(e: git2::Error) -> Self {
        Self::Git(e.message().to_string())
    }
}

/// Errors from a single job's pipeline.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Sandbox acquisition failed: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Agent exited with code {exit_code:?}: {output}")]
    AgentFailed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Agent exceeded timeout of {timeout:?}")]
    AgentTimeout { timeout: std::time::Duration },

    #[error("Validation failed: {diagnostics}")]
    ValidationFailed { diagnostics: String },

    #[error("Finalization failed: {0}")]
    Finalize(String),

    #[error("Job cancelled before {phase}")]
    Cancelled { phase: &'static str },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from workspace resolution and provisioning.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Workspace not found")]
    NotFound(String),

    #[error("Invalid workspace id '{0}'")]
    InvalidId(String),

    #[error("Failed to initialize workspace {id}: {cause}")]
    Init {
        id: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("Workspace repository error: {0}")]
    Repository(#[source] anyhow::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from board list mapping and notification.
#[derive(Debug, Error, PartialEq)]
pub enum BoardError {
    #[error("Board list '{0}' is not mapped to a job role")]
    UnmappedList(String),

    #[error("Job status {0} has no board list")]
    UnmappedStatus(JobStatus),

    #[error("Board notification failed: {0}")]
    Notify(String),
}
