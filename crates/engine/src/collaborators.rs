//! Contracts of the systems the engine drives but does not own.
//!
//! Every collaborator is injected as an `Arc<dyn ...>`; the engine never
//! reaches a remote system through global state. HTTP implementations live
//! in [`crate::remote`], file and in-memory persistence in
//! [`crate::repository`].

use std::fmt;
use std::sync::Arc;

use runway_types::{AccountId, HistoryRecord, Step, StepKind, StepOptions, UserId, UserRecord, Workflow, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, RemoteError};

/// Job-service-issued id used only to poll one step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteStepHandle(pub String);

impl fmt::Display for RemoteStepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a job service needs to start one step.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub account: AccountId,
    pub user: UserId,
    pub cluster: String,
    pub step: Step,
    /// Step options with the run's trigger-time parameters merged over them.
    pub options: StepOptions,
    /// Deterministic per-step key; services that honor it never run a step twice.
    pub idempotency_key: String,
}

/// Identifies one in-flight step on its owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub account: AccountId,
    pub user: UserId,
    pub cluster: String,
    pub remote: RemoteStepHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepProgress {
    pub running: bool,
    /// Raw progress document, surfaced to API consumers as-is.
    pub progress: Value,
}

/// A remote service that runs one kind of step.
#[async_trait::async_trait]
pub trait JobService: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteStepHandle, RemoteError>;

    async fn poll_progress(&self, request: &PollRequest) -> Result<StepProgress, RemoteError>;

    async fn fetch_result(&self, request: &PollRequest) -> Result<Value, RemoteError>;

    async fn cancel(&self, request: &PollRequest) -> Result<(), RemoteError>;
}

/// Routes each step kind to the service that owns it.
#[derive(Clone)]
pub struct JobServices {
    sql: Arc<dyn JobService>,
    code_jobs: Arc<dyn JobService>,
    data_jobs: Arc<dyn JobService>,
}

impl JobServices {
    pub fn new(sql: Arc<dyn JobService>, code_jobs: Arc<dyn JobService>, data_jobs: Arc<dyn JobService>) -> Self {
        Self { sql, code_jobs, data_jobs }
    }

    pub fn for_kind(&self, kind: StepKind) -> &Arc<dyn JobService> {
        match kind {
            StepKind::Sql => &self.sql,
            StepKind::CodeJob => &self.code_jobs,
            StepKind::Import | StepKind::Export => &self.data_jobs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    pub account: AccountId,
    pub user: UserId,
    pub name: String,
    pub workers: u32,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStatus {
    pub alive: bool,
    /// Raw status document from the provisioner.
    pub detail: Value,
}

/// Cluster lifecycle owned by the provisioning system.
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates the cluster record and starts launching workers.
    ///
    /// Returns `false` when a cluster of that name already exists for the
    /// account; creation is exclusive.
    async fn create_cluster(&self, request: &ClusterRequest) -> Result<bool, RemoteError>;

    async fn is_alive(&self, account: AccountId, user: UserId, name: &str) -> Result<ClusterStatus, RemoteError>;

    async fn request_shutdown(&self, account: AccountId, user: UserId, name: &str) -> Result<(), RemoteError>;
}

/// Persistence of workflow definitions and the audit trail.
#[async_trait::async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, EngineError>;

    async fn append_history(&self, record: HistoryRecord) -> Result<(), EngineError>;
}

#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn account_users(&self, account: AccountId) -> Result<Vec<UserRecord>, EngineError>;

    async fn find_user(&self, user: UserId) -> Result<Option<UserRecord>, EngineError>;
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, user: &UserRecord, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// The full set of collaborators an engine instance is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn WorkflowRepository>,
    pub users: Arc<dyn UserDirectory>,
    pub provisioner: Arc<dyn Provisioner>,
    pub jobs: JobServices,
    pub mailer: Arc<dyn Mailer>,
}
