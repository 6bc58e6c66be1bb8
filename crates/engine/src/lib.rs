//! # Runway Engine
//!
//! Multi-tenant workflow orchestration: a triggered [`Workflow`] snapshot is
//! driven step by step against remote job services, on a cluster that is
//! either picked or booted for the run, and its progress is exposed through
//! an [`ExecutionStateStore`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runway_engine::{Engine, InMemoryStateStore, LocalQueue, SystemClock};
//!
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(InMemoryStateStore::new(clock.clone()));
//! let queue = Arc::new(LocalQueue::new(settings.max_redeliveries, settings.redelivery_delay()));
//! let engine = Engine::new(&collaborators, store, queue.clone(), clock, &settings);
//! let _workers = queue.spawn_workers(settings.workers, engine.sequencer());
//!
//! let handle = engine.orchestrator().trigger(WorkflowId(7)).await?;
//! let status = engine.orchestrator().run_status(&handle).await?;
//! ```
//!
//! ## Architecture
//!
//! - **`orchestrator`**: trigger, cancel and status entry points
//! - **`sequencer`**: the per-run checkpoint state machine
//! - **`cluster`**: pick-or-boot cluster binding and teardown
//! - **`notify`**: post-run email notices
//! - **`store`**: run records and the rolling active-run index
//! - **`queue`**: checkpoint payloads plus local and manual queues
//! - **`collaborators`**: contracts of the remote systems the engine drives
//! - **`remote`**: HTTP implementations of those contracts
//! - **`repository`**: file-backed and in-memory persistence
//! - **`config`**: configuration file loading and validation

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};

pub mod clock;
pub mod cluster;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod sequencer;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    ClusterRequest, ClusterStatus, Collaborators, JobService, JobServices, Mailer, PollRequest, Provisioner, RemoteStepHandle,
    StepProgress, SubmitRequest, UserDirectory, WorkflowRepository,
};
pub use error::{EngineError, RemoteError, RunError};
pub use notify::{LogMailer, Notifier};
pub use orchestrator::Orchestrator;
pub use queue::{Checkpoint, CheckpointHandler, CheckpointQueue, ClusterBinding, LocalQueue, ManualQueue, RunContext};
pub use remote::{HttpJobService, HttpProvisioner};
pub use repository::{FileWorkflowRepository, InMemoryRepository};
pub use runway_types::Workflow;
pub use sequencer::StepSequencer;
pub use store::{ExecutionStateStore, InMemoryStateStore};

use config::EngineSettings;

/// An orchestrator and the sequencer that executes its checkpoints, wired
/// to the same store, queue and clock.
pub struct Engine {
    orchestrator: Orchestrator,
    sequencer: Arc<StepSequencer>,
}

impl Engine {
    pub fn new(
        collaborators: &Collaborators,
        store: Arc<dyn ExecutionStateStore>,
        queue: Arc<dyn CheckpointQueue>,
        clock: Arc<dyn Clock>,
        settings: &EngineSettings,
    ) -> Self {
        let sequencer = StepSequencer::new(collaborators, Arc::clone(&store), Arc::clone(&queue), Arc::clone(&clock), settings);
        let orchestrator = Orchestrator::new(Arc::clone(&collaborators.repository), store, queue, clock, settings);
        Self {
            orchestrator,
            sequencer: Arc::new(sequencer),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn sequencer(&self) -> Arc<StepSequencer> {
        Arc::clone(&self.sequencer)
    }
}

/// Loads a workflow definition from the filesystem.
///
/// YAML and JSON are both accepted; JSON documents parse as YAML. The
/// definition is validated before it is returned, so a file that loads
/// cleanly can be triggered as-is.
///
/// # Errors
///
/// Returns an error if the file cannot be read, does not describe a
/// workflow, or fails definition validation.
pub fn parse_workflow_file(file_path: impl AsRef<Path>) -> Result<Workflow> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read workflow file: {}", file_path.display()))?;
    let workflow: Workflow =
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse workflow file: {}", file_path.display()))?;
    workflow
        .validate()
        .with_context(|| format!("Invalid workflow definition: {}", file_path.display()))?;
    Ok(workflow)
}
