//! Per-run progress record owned by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AccountId, RunHandle, Step, UserId, Workflow, WorkflowId};

/// Status message written when a run is first opened.
pub const INITIAL_MESSAGE: &str = "Warming up...";

/// Live state of one triggered workflow execution.
///
/// Mutated by every sequencer checkpoint and never deleted, so callers can
/// still read the final state of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    pub handle: RunHandle,
    pub workflow_id: WorkflowId,
    pub account: AccountId,
    pub user: UserId,
    pub title: String,
    pub total_steps: usize,
    pub steps_complete: usize,
    pub current_step: Option<Step>,
    /// Opaque status payload reported by the remote system currently doing work.
    pub progress: Option<Value>,
    pub message: String,
    pub finished: bool,
    pub error: Option<String>,
    /// Set out-of-band by a cancel request; never reset.
    pub cancelled: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRun {
    pub fn new(handle: RunHandle, workflow: &Workflow, now: DateTime<Utc>) -> Self {
        Self {
            handle,
            workflow_id: workflow.id,
            account: workflow.account,
            user: workflow.user,
            title: workflow.title.clone(),
            total_steps: workflow.steps.len(),
            steps_complete: 0,
            current_step: None,
            progress: None,
            message: INITIAL_MESSAGE.to_string(),
            finished: false,
            error: None,
            cancelled: false,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.finished && self.error.is_none()
    }
}

/// Field-set applied to an [`ExecutionRun`], last write wins per field.
///
/// Nullable fields use a nested `Option`: the outer level says whether the
/// field is written at all, the inner value is what gets stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub steps_complete: Option<usize>,
    pub current_step: Option<Option<Step>>,
    pub progress: Option<Option<Value>>,
    pub message: Option<String>,
    pub finished: Option<bool>,
    pub error: Option<Option<String>>,
}

impl RunUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps_complete(mut self, count: usize) -> Self {
        self.steps_complete = Some(count);
        self
    }

    pub fn current_step(mut self, step: Option<Step>) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn progress(mut self, progress: Option<Value>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = Some(true);
        self
    }

    /// True when this update moves the run into its terminal state.
    pub fn is_terminal(&self) -> bool {
        self.finished == Some(true)
    }

    pub fn apply(self, run: &mut ExecutionRun, now: DateTime<Utc>) {
        if let Some(count) = self.steps_complete {
            run.steps_complete = count.min(run.total_steps);
        }
        if let Some(step) = self.current_step {
            run.current_step = step;
        }
        if let Some(progress) = self.progress {
            run.progress = progress;
        }
        if let Some(message) = self.message {
            run.message = message;
        }
        if let Some(finished) = self.finished {
            run.finished = finished;
        }
        if let Some(error) = self.error {
            run.error = error;
        }
        run.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClusterSpec, NotifyTargets};
    use chrono::TimeZone;
    use serde_json::json;

    fn workflow() -> Workflow {
        Workflow {
            id: WorkflowId(4),
            account: AccountId(2),
            user: UserId(8),
            title: "daily".into(),
            description: None,
            steps: Vec::new(),
            cluster: ClusterSpec::Pick { name: "shared".into() },
            notify: NotifyTargets::default(),
        }
    }

    #[test]
    fn new_run_starts_warming_up() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let run = ExecutionRun::new(RunHandle::from("h"), &workflow(), now);
        assert_eq!(run.message, INITIAL_MESSAGE);
        assert_eq!(run.total_steps, 0);
        assert!(!run.finished);

        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["startedAt"], json!(1_700_000_000_000i64));
        assert_eq!(value["workflowId"], json!(4));
    }

    #[test]
    fn update_only_touches_named_fields() {
        let now = Utc.timestamp_millis_opt(0).unwrap();
        let later = Utc.timestamp_millis_opt(5_000).unwrap();
        let mut run = ExecutionRun::new(RunHandle::from("h"), &workflow(), now);
        run.progress = Some(json!({"pct": 10}));

        RunUpdate::new().message("Cluster launch started").apply(&mut run, later);

        assert_eq!(run.message, "Cluster launch started");
        assert_eq!(run.progress, Some(json!({"pct": 10})));
        assert_eq!(run.updated_at, later);

        RunUpdate::new().progress(None).error(Some("boom".into())).finished().apply(&mut run, later);
        assert_eq!(run.progress, None);
        assert!(run.finished);
        assert!(!run.succeeded());
    }

    #[test]
    fn steps_complete_never_exceeds_total() {
        let mut run = ExecutionRun::new(RunHandle::from("h"), &workflow(), Utc::now());
        RunUpdate::new().steps_complete(3).apply(&mut run, Utc::now());
        assert_eq!(run.steps_complete, 0);
    }
}
