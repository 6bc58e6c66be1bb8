//! Error taxonomy for the engine.
//!
//! [`RunError`] values are terminal outcomes of a run and end up in
//! `ExecutionRun.error`. [`EngineError`] values are infrastructure failures of
//! a single checkpoint; the queue redelivers the checkpoint instead of failing
//! the run.

use runway_types::{RunHandle, StepKind, ValidationErrors, WorkflowId};
use thiserror::Error;

/// Failure reported by a remote collaborator.
///
/// `status` is the HTTP status when the service answered; `None` means the
/// request never produced a response (connection refused, timeout).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{body}")]
pub struct RemoteError {
    pub status: Option<u16>,
    pub body: String,
}

impl RemoteError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            body: body.into(),
        }
    }

    pub fn transport(body: impl Into<String>) -> Self {
        Self {
            status: None,
            body: body.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status.is_none()
    }
}

/// Terminal outcome of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// Non-success response from a job service or the provisioner, or an
    /// application-level error embedded in a successful response.
    #[error("{message}")]
    RemoteDispatch { message: String },

    #[error("Cluster '{cluster}' didn't boot up within {timeout_secs} seconds")]
    ProvisioningTimeout { cluster: String, timeout_secs: u64 },

    #[error("{} did not complete within {timeout_secs} seconds", .kind.display_name())]
    StepTimeout { kind: StepKind, timeout_secs: u64 },

    #[error("Workflow has been cancelled")]
    Cancelled,

    /// A checkpoint kept failing on infrastructure errors until the queue
    /// stopped redelivering it.
    #[error("Workflow could not continue: {reason}")]
    Abandoned { reason: String },
}

impl RunError {
    pub fn remote_dispatch(message: impl Into<String>) -> Self {
        Self::RemoteDispatch { message: message.into() }
    }

    /// Remote dispatch failure carrying a `{"error": ...}` document, the
    /// shape job services use for their own errors.
    pub fn remote_dispatch_json(message: &str) -> Self {
        Self::RemoteDispatch {
            message: serde_json::json!({ "error": message }).to_string(),
        }
    }
}

/// Infrastructure failure while executing a checkpoint.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run '{0}' not found")]
    UnknownRun(RunHandle),

    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] ValidationErrors),

    #[error("repository error: {message}")]
    Repository { message: String },

    #[error("state store error: {message}")]
    Store { message: String },

    #[error("checkpoint queue is closed")]
    QueueClosed,

    #[error("remote service unreachable: {0}")]
    Unreachable(RemoteError),
}

impl EngineError {
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository { message: message.into() }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }
}

/// Result of a checkpoint step that can either end the run or be retried.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<RemoteError> for CheckpointError {
    /// Unanswered requests are retried through redelivery; any answered
    /// failure ends the run with the response body as its error.
    fn from(error: RemoteError) -> Self {
        if error.is_transient() {
            CheckpointError::Engine(EngineError::Unreachable(error))
        } else {
            CheckpointError::Run(RunError::RemoteDispatch { message: error.body })
        }
    }
}
