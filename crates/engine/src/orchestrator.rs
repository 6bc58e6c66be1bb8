//! Entry points consumed by an API layer.

use std::sync::Arc;
use std::time::Duration;

use runway_types::{AccountId, ExecutionRun, HistoryEvent, HistoryRecord, RunHandle, StepOptions, Workflow, WorkflowId};
use serde_json::json;
use tracing::info;

use crate::clock::Clock;
use crate::collaborators::WorkflowRepository;
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::queue::{Checkpoint, CheckpointQueue, RunContext};
use crate::store::ExecutionStateStore;

/// Triggers, cancels and reports on runs.
///
/// Every method returns as soon as the state store and queue have been
/// touched; run failures are only visible through [`Orchestrator::run_status`]
/// and the post-run notice.
pub struct Orchestrator {
    repository: Arc<dyn WorkflowRepository>,
    store: Arc<dyn ExecutionStateStore>,
    queue: Arc<dyn CheckpointQueue>,
    clock: Arc<dyn Clock>,
    active_window: Duration,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn WorkflowRepository>,
        store: Arc<dyn ExecutionStateStore>,
        queue: Arc<dyn CheckpointQueue>,
        clock: Arc<dyn Clock>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            repository,
            store,
            queue,
            clock,
            active_window: settings.active_window(),
        }
    }

    pub async fn trigger(&self, workflow_id: WorkflowId) -> Result<RunHandle, EngineError> {
        self.trigger_with(workflow_id, StepOptions::new()).await
    }

    /// Triggers a stored workflow with run parameters merged over every step's options.
    pub async fn trigger_with(&self, workflow_id: WorkflowId, parameters: StepOptions) -> Result<RunHandle, EngineError> {
        let workflow = self.repository.load_workflow(workflow_id).await?;
        self.open_run(workflow, parameters).await
    }

    /// Triggers a caller-supplied snapshot. The snapshot is validated first
    /// because it never passed through a definition write.
    pub async fn trigger_snapshot(&self, workflow: Workflow, parameters: StepOptions) -> Result<RunHandle, EngineError> {
        workflow.validate()?;
        self.open_run(workflow, parameters).await
    }

    /// Flags the run as cancelled. The sequencer observes the flag at its next checkpoint.
    pub async fn cancel(&self, handle: &RunHandle) -> Result<(), EngineError> {
        self.store.mark_cancelled(handle).await?;
        info!(%handle, "cancellation requested");
        Ok(())
    }

    pub async fn run_status(&self, handle: &RunHandle) -> Result<ExecutionRun, EngineError> {
        self.store.get(handle).await
    }

    /// Runs of `account` that made progress within the configured active window.
    pub async fn active_runs(&self, account: AccountId) -> Result<Vec<ExecutionRun>, EngineError> {
        self.store.list_active(account, self.active_window).await
    }

    async fn open_run(&self, workflow: Workflow, parameters: StepOptions) -> Result<RunHandle, EngineError> {
        let handle = RunHandle::generate();
        let now = self.clock.now();
        self.store.open(ExecutionRun::new(handle.clone(), &workflow, now)).await?;

        self.repository
            .append_history(HistoryRecord {
                account: workflow.account,
                user: workflow.user,
                event: HistoryEvent::StartWorkflow,
                workflow_id: Some(workflow.id),
                handle: Some(handle.clone()),
                data: json!({ "title": workflow.title }),
                recorded_at: now,
            })
            .await?;

        info!(
            %handle,
            workflow = %workflow.id,
            account = %workflow.account,
            steps = workflow.steps.len(),
            cluster = workflow.cluster.name(),
            "triggered workflow"
        );
        let context = RunContext::new(handle.clone(), workflow, parameters);
        self.queue.enqueue(Checkpoint::Advance { context }, Duration::ZERO).await?;
        Ok(handle)
    }
}
