//! Checkpoint payloads and the queues that deliver them.
//!
//! A [`Checkpoint`] carries everything the sequencer needs to resume a run:
//! the workflow snapshot, the run handle, the running options and the steps
//! still to execute. Nothing lives only in a worker's memory, so a lost
//! checkpoint is simply delivered again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use runway_types::{AccountId, RunHandle, Step, StepOptions, UserId, Workflow};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::clock::{Clock, ManualClock, after};
use crate::collaborators::RemoteStepHandle;
use crate::error::EngineError;

/// Per-run state that travels with every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub handle: RunHandle,
    /// Immutable snapshot taken at trigger time.
    pub workflow: Workflow,
    pub options: RunningOptions,
    /// Steps not yet dispatched, in execution order.
    pub remaining: Vec<Step>,
}

impl RunContext {
    pub fn new(handle: RunHandle, workflow: Workflow, parameters: StepOptions) -> Self {
        let remaining = workflow.steps.clone();
        Self {
            handle,
            workflow,
            options: RunningOptions {
                cluster: ClusterBinding::Unbound,
                parameters,
            },
            remaining,
        }
    }

    pub fn account(&self) -> AccountId {
        self.workflow.account
    }

    pub fn user(&self) -> UserId {
        self.workflow.user
    }

    /// Derived from the snapshot, so redelivery never double counts.
    pub fn steps_complete(&self) -> usize {
        self.workflow.steps.len().saturating_sub(self.remaining.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningOptions {
    pub cluster: ClusterBinding,
    /// Trigger-time parameters merged over every step's own options.
    #[serde(default)]
    pub parameters: StepOptions,
}

/// How far cluster resolution has progressed for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClusterBinding {
    Unbound,
    /// Creation was accepted; the run owns this cluster even before it is alive.
    Booting { name: String },
    Bound { name: String, ephemeral: bool },
}

impl ClusterBinding {
    pub fn bound_name(&self) -> Option<&str> {
        match self {
            ClusterBinding::Bound { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Name of the cluster this run created and must tear down.
    pub fn owned_cluster(&self) -> Option<&str> {
        match self {
            ClusterBinding::Booting { name } | ClusterBinding::Bound { name, ephemeral: true } => Some(name),
            _ => None,
        }
    }
}

/// One discrete, re-enqueueable unit of sequencer progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "checkpoint", rename_all = "snake_case")]
pub enum Checkpoint {
    /// Resolve the cluster if needed, record progress, then pick the next step or finish.
    Advance { context: RunContext },
    BootCluster { context: RunContext },
    AwaitCluster { context: RunContext, deadline: DateTime<Utc> },
    Dispatch { context: RunContext, step: Step, index: usize },
    AwaitStep {
        context: RunContext,
        step: Step,
        index: usize,
        remote: RemoteStepHandle,
        deadline: DateTime<Utc>,
    },
}

impl Checkpoint {
    pub fn context(&self) -> &RunContext {
        match self {
            Checkpoint::Advance { context }
            | Checkpoint::BootCluster { context }
            | Checkpoint::AwaitCluster { context, .. }
            | Checkpoint::Dispatch { context, .. }
            | Checkpoint::AwaitStep { context, .. } => context,
        }
    }

    pub fn handle(&self) -> &RunHandle {
        &self.context().handle
    }

    pub fn name(&self) -> &'static str {
        match self {
            Checkpoint::Advance { .. } => "advance",
            Checkpoint::BootCluster { .. } => "boot_cluster",
            Checkpoint::AwaitCluster { .. } => "await_cluster",
            Checkpoint::Dispatch { .. } => "dispatch",
            Checkpoint::AwaitStep { .. } => "await_step",
        }
    }
}

/// Anything that can place a checkpoint on a work queue.
#[async_trait::async_trait]
pub trait CheckpointQueue: Send + Sync {
    /// Schedules delivery after `delay`; never blocks for the delay itself.
    async fn enqueue(&self, checkpoint: Checkpoint, delay: Duration) -> Result<(), EngineError>;
}

/// Consumer side of a queue; implemented by the sequencer.
#[async_trait::async_trait]
pub trait CheckpointHandler: Send + Sync {
    async fn handle(&self, checkpoint: Checkpoint) -> Result<(), EngineError>;

    /// Dead-letter hook: `checkpoint` failed on every delivery and will not
    /// be delivered again.
    async fn abandon(&self, checkpoint: Checkpoint, failure: EngineError);
}

#[derive(Debug, Clone)]
struct Delivery {
    checkpoint: Checkpoint,
    attempt: u32,
}

/// In-process queue built on a tokio channel and timer tasks.
///
/// Checkpoints whose handler returns an [`EngineError`] are delivered again
/// after `redelivery_delay`, at most `max_redeliveries` times. After that the
/// handler's [`CheckpointHandler::abandon`] gets the last failure.
#[derive(Debug)]
pub struct LocalQueue {
    sender: UnboundedSender<Delivery>,
    receiver: Mutex<UnboundedReceiver<Delivery>>,
    max_redeliveries: u32,
    redelivery_delay: Duration,
}

impl LocalQueue {
    pub fn new(max_redeliveries: u32, redelivery_delay: Duration) -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            max_redeliveries,
            redelivery_delay,
        }
    }

    fn schedule(&self, delivery: Delivery, delay: Duration) -> Result<(), EngineError> {
        if delay.is_zero() {
            return self.sender.send(delivery).map_err(|_| EngineError::QueueClosed);
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(delivery).is_err() {
                warn!("checkpoint queue closed before a delayed delivery");
            }
        });
        Ok(())
    }

    /// Starts `count` workers draining the queue into `handler`.
    pub fn spawn_workers(self: &Arc<Self>, count: usize, handler: Arc<dyn CheckpointHandler>) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let queue = Arc::clone(self);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { queue.work(worker, handler).await })
            })
            .collect()
    }

    async fn work(&self, worker: usize, handler: Arc<dyn CheckpointHandler>) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            let Some(delivery) = next else {
                debug!(worker, "checkpoint queue drained; worker exiting");
                break;
            };

            let name = delivery.checkpoint.name();
            let handle = delivery.checkpoint.handle().clone();
            debug!(worker, %handle, checkpoint = name, attempt = delivery.attempt, "delivering checkpoint");

            let Err(failure) = handler.handle(delivery.checkpoint.clone()).await else {
                continue;
            };
            if delivery.attempt < self.max_redeliveries {
                warn!(%handle, checkpoint = name, attempt = delivery.attempt, error = %failure, "checkpoint failed; redelivering");
                let retry = Delivery {
                    checkpoint: delivery.checkpoint,
                    attempt: delivery.attempt + 1,
                };
                if let Err(schedule_error) = self.schedule(retry, self.redelivery_delay) {
                    error!(%handle, error = %schedule_error, "could not redeliver checkpoint");
                }
            } else {
                error!(%handle, checkpoint = name, error = %failure, "checkpoint exhausted its redeliveries");
                handler.abandon(delivery.checkpoint, failure).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl CheckpointQueue for LocalQueue {
    async fn enqueue(&self, checkpoint: Checkpoint, delay: Duration) -> Result<(), EngineError> {
        self.schedule(Delivery { checkpoint, attempt: 0 }, delay)
    }
}

/// Queue drained explicitly by the caller, paired with a [`ManualClock`].
///
/// Delivering a checkpoint first moves the clock to its due time, so hours
/// of simulated polling run instantly and deterministically.
#[derive(Debug)]
pub struct ManualQueue {
    clock: Arc<ManualClock>,
    pending: StdMutex<BTreeMap<(DateTime<Utc>, u64), Checkpoint>>,
    sequence: AtomicU64,
}

impl ManualQueue {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            pending: StdMutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes the earliest-due checkpoint and advances the clock to its due time.
    pub fn pop_next(&self) -> Option<Checkpoint> {
        let ((due, _), checkpoint) = self.lock().pop_first()?;
        self.clock.advance_to(due);
        Some(checkpoint)
    }

    /// Delivers checkpoints until the queue is empty or `limit` deliveries ran.
    /// Returns the number of deliveries made.
    pub async fn run_until_idle(&self, handler: &dyn CheckpointHandler, limit: usize) -> Result<usize, EngineError> {
        let mut delivered = 0;
        while delivered < limit {
            let Some(checkpoint) = self.pop_next() else {
                break;
            };
            handler.handle(checkpoint).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(DateTime<Utc>, u64), Checkpoint>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl CheckpointQueue for ManualQueue {
    async fn enqueue(&self, checkpoint: Checkpoint, delay: Duration) -> Result<(), EngineError> {
        let due = after(self.clock.now(), delay);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.lock().insert((due, sequence), checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use runway_types::{ClusterSpec, CodeJobStep, NotifyTargets, WorkflowId};
    use std::sync::atomic::AtomicUsize;

    fn context(handle: &str) -> RunContext {
        let workflow = Workflow {
            id: WorkflowId(1),
            account: AccountId(1),
            user: UserId(1),
            title: "wf".into(),
            description: None,
            steps: vec![Step::CodeJob(CodeJobStep {
                job_id: 9,
                options: StepOptions::new(),
            })],
            cluster: ClusterSpec::Pick { name: "c".into() },
            notify: NotifyTargets::default(),
        };
        RunContext::new(RunHandle::from(handle), workflow, StepOptions::new())
    }

    #[test]
    fn context_counts_completed_steps_from_the_snapshot() {
        let mut context = context("h");
        assert_eq!(context.steps_complete(), 0);
        context.remaining.clear();
        assert_eq!(context.steps_complete(), 1);
    }

    #[test]
    fn owned_cluster_covers_booting_and_ephemeral() {
        assert_eq!(ClusterBinding::Booting { name: "x".into() }.owned_cluster(), Some("x"));
        assert_eq!(
            ClusterBinding::Bound {
                name: "x".into(),
                ephemeral: false
            }
            .owned_cluster(),
            None
        );
        assert_eq!(ClusterBinding::Booting { name: "x".into() }.bound_name(), None);
    }

    #[test]
    fn checkpoints_serialize_for_a_broker() {
        let checkpoint = Checkpoint::AwaitStep {
            context: context("h"),
            step: context("h").remaining[0].clone(),
            index: 0,
            remote: RemoteStepHandle("flint-7".into()),
            deadline: Utc.timestamp_opt(1_000, 0).unwrap(),
        };
        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["checkpoint"], "await_step");
        assert_eq!(value["context"]["options"]["cluster"]["state"], "unbound");
        let decoded: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, checkpoint);
    }

    #[tokio::test]
    async fn manual_queue_delivers_in_due_order_and_moves_the_clock() {
        let start = Utc.timestamp_opt(0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let queue = ManualQueue::new(clock.clone());

        queue.enqueue(Checkpoint::Advance { context: context("late") }, Duration::from_secs(10)).await.unwrap();
        queue.enqueue(Checkpoint::Advance { context: context("first") }, Duration::ZERO).await.unwrap();
        queue.enqueue(Checkpoint::Advance { context: context("second") }, Duration::ZERO).await.unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_next()).map(|checkpoint| checkpoint.handle().to_string()).collect();
        assert_eq!(order, vec!["first", "second", "late"]);
        assert_eq!(clock.now(), Utc.timestamp_opt(10, 0).unwrap());
    }

    struct FlakyHandler {
        calls: AtomicUsize,
        failures: usize,
        done: tokio::sync::mpsc::UnboundedSender<usize>,
        abandoned: StdMutex<Vec<String>>,
    }

    impl FlakyHandler {
        fn new(failures: usize, done: tokio::sync::mpsc::UnboundedSender<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                done,
                abandoned: StdMutex::new(Vec::new()),
            }
        }

        fn abandoned(&self) -> Vec<String> {
            self.abandoned.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CheckpointHandler for FlakyHandler {
        async fn handle(&self, _checkpoint: Checkpoint) -> Result<(), EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.done.send(call);
            if call <= self.failures {
                Err(EngineError::store("unavailable"))
            } else {
                Ok(())
            }
        }

        async fn abandon(&self, checkpoint: Checkpoint, failure: EngineError) {
            self.abandoned.lock().unwrap().push(format!("{}: {failure}", checkpoint.handle()));
        }
    }

    #[tokio::test]
    async fn local_queue_redelivers_failed_checkpoints() {
        let queue = Arc::new(LocalQueue::new(3, Duration::from_millis(5)));
        let (done, mut calls) = unbounded_channel();
        let handler = Arc::new(FlakyHandler::new(2, done));
        let workers = queue.spawn_workers(2, handler.clone());

        queue.enqueue(Checkpoint::Advance { context: context("h") }, Duration::from_millis(5)).await.unwrap();

        for expected in 1..=3 {
            let call = tokio::time::timeout(Duration::from_secs(5), calls.recv()).await.unwrap().unwrap();
            assert_eq!(call, expected);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(handler.abandoned().is_empty());

        workers.iter().for_each(JoinHandle::abort);
    }

    #[tokio::test]
    async fn local_queue_hands_exhausted_checkpoints_to_the_dead_letter_hook() {
        let queue = Arc::new(LocalQueue::new(1, Duration::from_millis(1)));
        let (done, _calls) = unbounded_channel();
        let handler = Arc::new(FlakyHandler::new(usize::MAX, done));
        let workers = queue.spawn_workers(1, handler.clone());

        queue.enqueue(Checkpoint::Advance { context: context("h") }, Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(handler.abandoned(), vec!["h: state store error: unavailable".to_string()]);
        workers.iter().for_each(JoinHandle::abort);
    }
}
