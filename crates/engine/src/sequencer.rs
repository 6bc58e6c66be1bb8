//! Step Sequencer: the per-run state machine.
//!
//! A run moves `Init -> ClusterBinding -> (StepDispatching -> StepPolling)* ->
//! Finished`. Every transition is a [`Checkpoint`] executed by whichever
//! worker picks it up. Each checkpoint reads external truth first (the run
//! record, the cancellation flag, remote status), performs at most one
//! remote side effect, and ends by enqueueing exactly one successor. That
//! chaining is what keeps checkpoints of one run strictly sequential.
//!
//! Outcomes are split in two:
//! - a [`RunError`] is terminal and finishes the run;
//! - an [`EngineError`] is returned to the queue, which redelivers the
//!   unchanged checkpoint.
//!
//! Submissions are keyed `"<handle>:<index>"` (`"<handle>:cluster"` for
//! cluster creation) and recorded in the state store, so a redelivered
//! dispatch resumes polling instead of submitting again. History entries are
//! appended after the last redeliverable failure of their checkpoint.
//!
//! A checkpoint the queue gives up on is [abandoned](StepSequencer::abandon_run):
//! the run finishes with [`RunError::Abandoned`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runway_types::{ClusterSpec, HistoryEvent, HistoryRecord, RunHandle, RunUpdate, Step, StepKind, StepOptions};
use runway_util::{redact_json, redact_sensitive};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, after};
use crate::cluster::{BootState, ClusterCoordinator, ClusterResolution};
use crate::collaborators::{Collaborators, JobServices, PollRequest, RemoteStepHandle, SubmitRequest, WorkflowRepository};
use crate::config::{EngineSettings, PollingConfig};
use crate::error::{CheckpointError, EngineError, RunError};
use crate::notify::Notifier;
use crate::queue::{Checkpoint, CheckpointHandler, CheckpointQueue, ClusterBinding, RunContext};
use crate::store::ExecutionStateStore;

const NO_CLUSTER: &str = "No cluster was provided to run this step on";

pub struct StepSequencer {
    repository: Arc<dyn WorkflowRepository>,
    jobs: JobServices,
    store: Arc<dyn ExecutionStateStore>,
    queue: Arc<dyn CheckpointQueue>,
    clock: Arc<dyn Clock>,
    clusters: ClusterCoordinator,
    notifier: Notifier,
    polling: PollingConfig,
}

impl StepSequencer {
    pub fn new(
        collaborators: &Collaborators,
        store: Arc<dyn ExecutionStateStore>,
        queue: Arc<dyn CheckpointQueue>,
        clock: Arc<dyn Clock>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            repository: Arc::clone(&collaborators.repository),
            jobs: collaborators.jobs.clone(),
            store,
            queue,
            clock,
            clusters: ClusterCoordinator::new(Arc::clone(&collaborators.provisioner), settings),
            notifier: Notifier::new(Arc::clone(&collaborators.users), Arc::clone(&collaborators.mailer)),
            polling: settings.polling.clone(),
        }
    }

    /// Executes one checkpoint.
    ///
    /// Checkpoints for finished runs are dropped, so terminal side effects
    /// happen once per run however often a checkpoint is delivered.
    pub async fn execute(&self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        let handle = checkpoint.handle().clone();
        let run = self.store.get(&handle).await?;
        if run.finished {
            debug!(%handle, checkpoint = checkpoint.name(), "dropping checkpoint for finished run");
            return Ok(());
        }
        debug!(%handle, checkpoint = checkpoint.name(), steps_complete = run.steps_complete, "executing checkpoint");

        if self.store.is_cancelled(&handle).await? {
            self.cancel_in_flight(&checkpoint).await?;
            return self.finish(checkpoint.context(), Err(RunError::Cancelled)).await;
        }

        let context = checkpoint.context().clone();
        match self.step(checkpoint).await {
            Ok(()) => Ok(()),
            Err(CheckpointError::Run(failure)) => self.finish(&context, Err(failure)).await,
            Err(CheckpointError::Engine(failure)) => Err(failure),
        }
    }

    async fn step(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        match checkpoint {
            Checkpoint::Advance { context } => self.advance(context).await,
            Checkpoint::BootCluster { context } => self.boot_cluster(context).await,
            Checkpoint::AwaitCluster { context, deadline } => self.await_cluster(context, deadline).await,
            Checkpoint::Dispatch { context, step, index } => self.dispatch(context, step, index).await,
            Checkpoint::AwaitStep {
                context,
                step,
                index,
                remote,
                deadline,
            } => self.await_step(context, step, index, remote, deadline).await,
        }
    }

    async fn advance(&self, mut context: RunContext) -> Result<(), CheckpointError> {
        if context.options.cluster == ClusterBinding::Unbound {
            match ClusterCoordinator::resolve(&context.workflow.cluster) {
                ClusterResolution::Bound(binding) => context.options.cluster = binding,
                ClusterResolution::Boot { .. } => {
                    self.queue.enqueue(Checkpoint::BootCluster { context }, Duration::ZERO).await?;
                    return Ok(());
                }
            }
        }

        let complete = context.steps_complete();
        let update = RunUpdate::new().steps_complete(complete);
        if context.remaining.is_empty() {
            self.store.update(&context.handle, context.account(), update).await?;
            self.finish(&context, Ok(())).await?;
            return Ok(());
        }

        let step = context.remaining.remove(0);
        self.store
            .update(&context.handle, context.account(), update.current_step(Some(step.clone())))
            .await?;
        debug!(handle = %context.handle, step = step.kind().label(), index = complete, "advancing to step");
        self.queue
            .enqueue(Checkpoint::Dispatch { context, step, index: complete }, Duration::ZERO)
            .await?;
        Ok(())
    }

    async fn boot_cluster(&self, mut context: RunContext) -> Result<(), CheckpointError> {
        let (name, workers) = match context.workflow.cluster.clone() {
            ClusterSpec::Start { name, workers } => (name, workers),
            ClusterSpec::Pick { .. } => {
                self.queue.enqueue(Checkpoint::Advance { context }, Duration::ZERO).await?;
                return Ok(());
            }
        };

        let key = cluster_key(&context.handle);
        if self.store.find_submission(&context.handle, &key).await?.is_none() {
            let history = json!({ "name": name });
            match self.clusters.begin_boot(&context, &name, workers).await {
                Ok(()) => {}
                Err(CheckpointError::Run(failure)) => {
                    self.record(&context, HistoryEvent::StartBootCluster, history).await?;
                    return Err(failure.into());
                }
                Err(retry) => return Err(retry),
            }
            self.store
                .record_submission(&context.handle, &key, &RemoteStepHandle(name.clone()))
                .await?;
            self.record(&context, HistoryEvent::StartBootCluster, history).await?;
        } else {
            debug!(handle = %context.handle, cluster = %name, "cluster creation already requested");
        }

        self.store
            .update(&context.handle, context.account(), RunUpdate::new().message("Cluster launch started"))
            .await?;
        context.options.cluster = ClusterBinding::Booting { name };
        let deadline = after(self.clock.now(), self.clusters.boot_timeout());
        self.queue
            .enqueue(Checkpoint::AwaitCluster { context, deadline }, self.clusters.poll_interval())
            .await?;
        Ok(())
    }

    async fn await_cluster(&self, mut context: RunContext, deadline: DateTime<Utc>) -> Result<(), CheckpointError> {
        let ClusterBinding::Booting { name } = context.options.cluster.clone() else {
            self.queue.enqueue(Checkpoint::Advance { context }, Duration::ZERO).await?;
            return Ok(());
        };

        match self.clusters.check_boot(&context, &name, deadline, self.clock.now()).await? {
            BootState::Booting(detail) => {
                self.store
                    .update(
                        &context.handle,
                        context.account(),
                        RunUpdate::new().progress(Some(detail)).message("Cluster is booting up"),
                    )
                    .await?;
                self.queue
                    .enqueue(Checkpoint::AwaitCluster { context, deadline }, self.clusters.poll_interval())
                    .await?;
            }
            BootState::Alive => {
                self.store
                    .update(
                        &context.handle,
                        context.account(),
                        RunUpdate::new().progress(None).message("Cluster has finished booting"),
                    )
                    .await?;
                self.record(&context, HistoryEvent::FinishBootCluster, json!({ "name": name })).await?;
                info!(handle = %context.handle, cluster = %name, "cluster is alive");
                context.options.cluster = ClusterBinding::Bound { name, ephemeral: true };
                self.queue.enqueue(Checkpoint::Advance { context }, Duration::ZERO).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, context: RunContext, step: Step, index: usize) -> Result<(), CheckpointError> {
        let cluster = bound_cluster(&context)?;
        let kind = step.kind();
        let key = step_key(&context.handle, index);

        let remote = match self.store.find_submission(&context.handle, &key).await? {
            Some(remote) => {
                debug!(handle = %context.handle, %remote, key = %key, "step already submitted; resuming poll");
                remote
            }
            None => {
                let request = SubmitRequest {
                    account: context.account(),
                    user: context.user(),
                    cluster: cluster.to_string(),
                    options: merged_options(&step, &context.options.parameters),
                    step: step.clone(),
                    idempotency_key: key.clone(),
                };
                let remote = match self.jobs.for_kind(kind).submit(&request).await {
                    Ok(remote) => remote,
                    Err(failure) if failure.is_transient() => return Err(failure.into()),
                    Err(failure) => {
                        self.record(&context, HistoryEvent::StartStep(kind), step_data(&step)).await?;
                        return Err(failure.into());
                    }
                };
                self.store.record_submission(&context.handle, &key, &remote).await?;
                self.record(&context, HistoryEvent::StartStep(kind), step_data(&step)).await?;
                info!(handle = %context.handle, step = kind.label(), %remote, "submitted step");
                remote
            }
        };

        self.store
            .update(
                &context.handle,
                context.account(),
                RunUpdate::new()
                    .progress(None)
                    .message(format!("{} successfully submitted", kind.display_name())),
            )
            .await?;

        let settings = self.polling.for_kind(kind);
        let deadline = after(self.clock.now(), settings.timeout());
        let next = Checkpoint::AwaitStep {
            context,
            step,
            index,
            remote,
            deadline,
        };
        self.queue.enqueue(next, settings.interval()).await?;
        Ok(())
    }

    async fn await_step(
        &self,
        context: RunContext,
        step: Step,
        index: usize,
        remote: RemoteStepHandle,
        deadline: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        let kind = step.kind();
        let request = PollRequest {
            account: context.account(),
            user: context.user(),
            cluster: bound_cluster(&context)?.to_string(),
            remote,
        };

        if self.clock.now() >= deadline {
            self.cancel_remote(&context, kind, &request).await;
            return Err(RunError::StepTimeout {
                kind,
                timeout_secs: self.polling.for_kind(kind).timeout_secs,
            }
            .into());
        }

        let service = self.jobs.for_kind(kind);
        let progress = service.poll_progress(&request).await?;
        debug!(
            handle = %context.handle,
            remote = %request.remote,
            running = progress.running,
            progress = %redact_json(&progress.progress),
            "polled step"
        );
        self.store
            .update(
                &context.handle,
                context.account(),
                RunUpdate::new()
                    .progress(Some(progress.progress))
                    .message(format!("Waiting for {} to complete", kind.display_name().to_lowercase())),
            )
            .await?;

        if progress.running {
            let next = Checkpoint::AwaitStep {
                context,
                step,
                index,
                remote: request.remote,
                deadline,
            };
            self.queue.enqueue(next, self.polling.for_kind(kind).interval()).await?;
            return Ok(());
        }

        let result = service.fetch_result(&request).await?;
        if !completed_cleanly(&result) {
            debug!(handle = %context.handle, result = %redact_json(&result), "step result carries an error");
            self.record(&context, HistoryEvent::FinishStep(kind), step_data(&step)).await?;
            return Err(RunError::remote_dispatch(result.to_string()).into());
        }

        let message = match kind {
            StepKind::Sql => "Query finished".to_string(),
            other => format!("{} has finished", other.display_name()),
        };
        self.store
            .update(&context.handle, context.account(), RunUpdate::new().progress(None).message(message))
            .await?;
        self.record(&context, HistoryEvent::FinishStep(kind), step_data(&step)).await?;
        info!(handle = %context.handle, step = kind.label(), index, "step finished");
        self.queue.enqueue(Checkpoint::Advance { context }, Duration::ZERO).await?;
        Ok(())
    }

    /// Terminal transition: final run state, ephemeral teardown, notification.
    ///
    /// The history entry goes last; once the run is marked finished a
    /// redelivered checkpoint is dropped, so nothing here repeats.
    async fn finish(&self, context: &RunContext, outcome: Result<(), RunError>) -> Result<(), EngineError> {
        let failure = outcome.err().map(|failure| failure.to_string());
        self.mark_finished(context, failure.as_deref()).await?;
        self.release(context, failure.as_deref()).await;
        self.record(context, HistoryEvent::FinishWorkflow, json!({ "error": failure })).await
    }

    /// Ends a run whose checkpoint the queue stopped redelivering.
    ///
    /// Every step is best effort: the failure that exhausted the checkpoint
    /// may well be the state store itself, and the booted cluster still has
    /// to go.
    pub async fn abandon_run(&self, checkpoint: Checkpoint, failure: EngineError) {
        let context = checkpoint.context();
        if let Ok(run) = self.store.get(&context.handle).await
            && run.finished
        {
            return;
        }

        let failure = RunError::Abandoned {
            reason: failure.to_string(),
        }
        .to_string();
        if let Err(cancel_error) = self.cancel_in_flight(&checkpoint).await {
            warn!(handle = %context.handle, error = %cancel_error, "could not look up in-flight step");
        }
        if let Err(store_error) = self.mark_finished(context, Some(&failure)).await {
            error!(handle = %context.handle, error = %store_error, "could not mark abandoned run finished");
        }
        self.release(context, Some(&failure)).await;
        if let Err(history_error) = self
            .record(context, HistoryEvent::FinishWorkflow, json!({ "error": failure }))
            .await
        {
            warn!(handle = %context.handle, error = %history_error, "could not record abandoned run");
        }
    }

    async fn mark_finished(&self, context: &RunContext, failure: Option<&str>) -> Result<(), EngineError> {
        let message = match failure {
            Some(failure) => {
                error!(handle = %context.handle, error = %redact_sensitive(failure), "workflow failed");
                "Workflow finished in failure"
            }
            None => {
                info!(handle = %context.handle, "workflow finished");
                "Workflow finished"
            }
        };
        let update = RunUpdate::new()
            .current_step(None)
            .progress(None)
            .error(failure.map(str::to_string))
            .message(message)
            .finished();
        self.store.update(&context.handle, context.account(), update).await
    }

    /// Ephemeral teardown and notification; neither can fail the run.
    async fn release(&self, context: &RunContext, failure: Option<&str>) {
        if let Some(cluster) = context.options.cluster.owned_cluster() {
            self.clusters.teardown(context.account(), context.user(), cluster).await;
        }

        if let Err(notify_error) = self.notifier.notify(&context.workflow, failure).await {
            warn!(handle = %context.handle, error = %notify_error, "could not resolve notification recipients");
        }
    }

    /// Best-effort cancel of a step that may be running remotely.
    async fn cancel_in_flight(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let (context, step, remote) = match checkpoint {
            Checkpoint::AwaitStep {
                context, step, remote, ..
            } => (context, step, Some(remote.clone())),
            Checkpoint::Dispatch { context, step, index } => {
                let remote = self.store.find_submission(&context.handle, &step_key(&context.handle, *index)).await?;
                (context, step, remote)
            }
            _ => return Ok(()),
        };
        let (Some(remote), Some(cluster)) = (remote, context.options.cluster.bound_name()) else {
            return Ok(());
        };

        let request = PollRequest {
            account: context.account(),
            user: context.user(),
            cluster: cluster.to_string(),
            remote,
        };
        self.cancel_remote(context, step.kind(), &request).await;
        Ok(())
    }

    async fn cancel_remote(&self, context: &RunContext, kind: StepKind, request: &PollRequest) {
        match self.jobs.for_kind(kind).cancel(request).await {
            Ok(()) => info!(handle = %context.handle, remote = %request.remote, "cancelled in-flight step"),
            Err(cancel_error) => {
                warn!(handle = %context.handle, remote = %request.remote, error = %cancel_error, "failed to cancel in-flight step")
            }
        }
    }

    async fn record(&self, context: &RunContext, event: HistoryEvent, data: Value) -> Result<(), EngineError> {
        let record = HistoryRecord {
            account: context.account(),
            user: context.user(),
            event,
            workflow_id: Some(context.workflow.id),
            handle: Some(context.handle.clone()),
            data,
            recorded_at: self.clock.now(),
        };
        self.repository.append_history(record).await
    }
}

#[async_trait::async_trait]
impl CheckpointHandler for StepSequencer {
    async fn handle(&self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        self.execute(checkpoint).await
    }

    async fn abandon(&self, checkpoint: Checkpoint, failure: EngineError) {
        self.abandon_run(checkpoint, failure).await
    }
}

fn step_key(handle: &RunHandle, index: usize) -> String {
    format!("{handle}:{index}")
}

fn cluster_key(handle: &RunHandle) -> String {
    format!("{handle}:cluster")
}

fn bound_cluster(context: &RunContext) -> Result<&str, RunError> {
    context
        .options
        .cluster
        .bound_name()
        .ok_or_else(|| RunError::remote_dispatch_json(NO_CLUSTER))
}

fn step_data(step: &Step) -> Value {
    match step.entity_id() {
        Some(id) => json!({ "id": id }),
        None => json!({}),
    }
}

/// Step options with run parameters layered on top.
fn merged_options(step: &Step, parameters: &StepOptions) -> StepOptions {
    let mut options = step.options().clone();
    options.extend(parameters.iter().map(|(key, value)| (key.clone(), value.clone())));
    options
}

/// A completed step's payload must carry `results`, and `results` must not
/// be an object with an `error` entry.
fn completed_cleanly(result: &Value) -> bool {
    match result.get("results") {
        None => false,
        Some(Value::Object(results)) => !results.contains_key("error"),
        Some(_) => true,
    }
}
