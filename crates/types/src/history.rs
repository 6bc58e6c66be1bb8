//! Audit history vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AccountId, RunHandle, StepKind, UserId, WorkflowId};

/// Milestones recorded for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum HistoryEvent {
    StartWorkflow,
    FinishWorkflow,
    StartBootCluster,
    FinishBootCluster,
    StartStep(StepKind),
    FinishStep(StepKind),
}

impl HistoryEvent {
    pub fn label(self) -> &'static str {
        match self {
            HistoryEvent::StartWorkflow => "start_workflow",
            HistoryEvent::FinishWorkflow => "finish_workflow",
            HistoryEvent::StartBootCluster => "start_boot_cluster",
            HistoryEvent::FinishBootCluster => "finish_boot_cluster",
            HistoryEvent::StartStep(StepKind::Sql) => "start_run_query",
            HistoryEvent::StartStep(StepKind::CodeJob) => "start_run_job",
            HistoryEvent::StartStep(StepKind::Import) => "start_run_import_job",
            HistoryEvent::StartStep(StepKind::Export) => "start_run_export_job",
            HistoryEvent::FinishStep(StepKind::Sql) => "finish_run_query",
            HistoryEvent::FinishStep(StepKind::CodeJob) => "finish_run_job",
            HistoryEvent::FinishStep(StepKind::Import) => "finish_run_import_job",
            HistoryEvent::FinishStep(StepKind::Export) => "finish_run_export_job",
        }
    }

    fn all() -> impl Iterator<Item = HistoryEvent> {
        [
            HistoryEvent::StartWorkflow,
            HistoryEvent::FinishWorkflow,
            HistoryEvent::StartBootCluster,
            HistoryEvent::FinishBootCluster,
        ]
        .into_iter()
        .chain(StepKind::ALL.into_iter().map(HistoryEvent::StartStep))
        .chain(StepKind::ALL.into_iter().map(HistoryEvent::FinishStep))
    }
}

impl fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for HistoryEvent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        HistoryEvent::all()
            .find(|event| event.label() == value)
            .ok_or_else(|| format!("unknown history event '{value}'"))
    }
}

impl From<HistoryEvent> for String {
    fn from(event: HistoryEvent) -> Self {
        event.label().to_string()
    }
}

impl TryFrom<String> for HistoryEvent {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One appended audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub account: AccountId,
    pub user: UserId,
    pub event: HistoryEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<RunHandle>,
    #[serde(default)]
    pub data: Value,
    pub recorded_at: DateTime<Utc>,
}
