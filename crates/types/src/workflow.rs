//! Workflow definitions as consumed by the orchestration engine.
//!
//! A [`Workflow`] is persisted by an external collaborator and read by the
//! engine as an immutable snapshot at trigger time. Steps are a closed
//! tagged union so dispatch is an exhaustive `match` rather than string
//! branching on a type field.

pub mod validation;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AccountId, UserId, WorkflowId};
use validation::{ValidationError, ValidationErrors};

/// Free-form options forwarded verbatim to a job service.
pub type StepOptions = Map<String, Value>;

/// Notify-target value meaning "every user in the run's account".
pub const ALL_ACCOUNT_USERS_SENTINEL: i64 = -1;

/// Snapshot of a user-defined workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub account: AccountId,
    pub user: UserId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered steps, executed strictly one after another.
    #[serde(default)]
    pub steps: Vec<Step>,
    pub cluster: ClusterSpec,
    #[serde(default)]
    pub notify: NotifyTargets,
}

impl Workflow {
    /// Definition-write validation. The engine never re-validates at run time.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        validation::validate_workflow(self)
    }
}

/// One unit of remote work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Sql(SqlStep),
    CodeJob(CodeJobStep),
    DataJob(DataJobStep),
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Sql(_) => StepKind::Sql,
            Step::CodeJob(_) => StepKind::CodeJob,
            Step::DataJob(step) => match step.direction {
                DataDirection::Import => StepKind::Import,
                DataDirection::Export => StepKind::Export,
            },
        }
    }

    /// Identifier of the referenced saved entity, if the step references one.
    pub fn entity_id(&self) -> Option<i64> {
        match self {
            Step::Sql(step) => match &step.query {
                SqlQuery::Saved(query_id) => Some(*query_id),
                SqlQuery::Adhoc(_) => None,
            },
            Step::CodeJob(step) => Some(step.job_id),
            Step::DataJob(step) => Some(step.datajob_id),
        }
    }

    pub fn options(&self) -> &StepOptions {
        match self {
            Step::Sql(step) => &step.options,
            Step::CodeJob(step) => &step.options,
            Step::DataJob(step) => &step.options,
        }
    }
}

/// Runs either a saved query or an ad-hoc SQL statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "SqlStepDocument", into = "SqlStepDocument")]
pub struct SqlStep {
    pub query: SqlQuery,
    pub options: StepOptions,
}

/// Source of the SQL executed by a [`SqlStep`]; exactly one is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlQuery {
    Saved(i64),
    Adhoc(String),
}

#[derive(Serialize, Deserialize)]
struct SqlStepDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    query_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    adhoc_sql: Option<String>,
    #[serde(default)]
    options: StepOptions,
}

impl TryFrom<SqlStepDocument> for SqlStep {
    type Error = ValidationError;

    fn try_from(document: SqlStepDocument) -> Result<Self, Self::Error> {
        let query = match (document.query_id, document.adhoc_sql) {
            (Some(query_id), None) => SqlQuery::Saved(query_id),
            (None, Some(sql)) => SqlQuery::Adhoc(sql),
            _ => return Err(ValidationError::AmbiguousSqlSource),
        };
        Ok(Self {
            query,
            options: document.options,
        })
    }
}

impl From<SqlStep> for SqlStepDocument {
    fn from(step: SqlStep) -> Self {
        let (query_id, adhoc_sql) = match step.query {
            SqlQuery::Saved(query_id) => (Some(query_id), None),
            SqlQuery::Adhoc(sql) => (None, Some(sql)),
        };
        Self {
            query_id,
            adhoc_sql,
            options: step.options,
        }
    }
}

/// Runs a saved code job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeJobStep {
    pub job_id: i64,
    #[serde(default)]
    pub options: StepOptions,
}

/// Runs a saved import or export job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataJobStep {
    pub datajob_id: i64,
    pub direction: DataDirection,
    #[serde(default)]
    pub options: StepOptions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataDirection {
    Import,
    Export,
}

/// Flattened step classification used for routing, settings and labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Sql,
    CodeJob,
    Import,
    Export,
}

impl StepKind {
    pub const ALL: [StepKind; 4] = [StepKind::Sql, StepKind::CodeJob, StepKind::Import, StepKind::Export];

    /// Snake-case noun used inside history event labels.
    pub fn label(self) -> &'static str {
        match self {
            StepKind::Sql => "query",
            StepKind::CodeJob => "job",
            StepKind::Import => "import_job",
            StepKind::Export => "export_job",
        }
    }

    /// Capitalized noun used in run status messages.
    pub fn display_name(self) -> &'static str {
        match self {
            StepKind::Sql => "Query",
            StepKind::CodeJob => "Job",
            StepKind::Import => "Import job",
            StepKind::Export => "Export job",
        }
    }
}

/// Compute target a run executes against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClusterSpec {
    /// Provision an ephemeral cluster for this run and tear it down afterwards.
    Start { name: String, workers: u32 },
    /// Bind to an existing, externally managed cluster.
    Pick { name: String },
}

impl ClusterSpec {
    pub fn name(&self) -> &str {
        match self {
            ClusterSpec::Start { name, .. } | ClusterSpec::Pick { name } => name,
        }
    }
}

/// Recipients of the post-run notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<i64>", into = "Vec<i64>")]
pub enum NotifyTargets {
    /// Every user currently belonging to the run's account.
    AllAccountUsers,
    /// The literal set of user ids (possibly empty).
    Users(Vec<UserId>),
}

impl Default for NotifyTargets {
    fn default() -> Self {
        NotifyTargets::Users(Vec::new())
    }
}

impl From<Vec<i64>> for NotifyTargets {
    fn from(values: Vec<i64>) -> Self {
        if values == [ALL_ACCOUNT_USERS_SENTINEL] {
            NotifyTargets::AllAccountUsers
        } else {
            NotifyTargets::Users(values.into_iter().map(UserId).collect())
        }
    }
}

impl From<NotifyTargets> for Vec<i64> {
    fn from(targets: NotifyTargets) -> Self {
        match targets {
            NotifyTargets::AllAccountUsers => vec![ALL_ACCOUNT_USERS_SENTINEL],
            NotifyTargets::Users(users) => users.into_iter().map(|user| user.0).collect(),
        }
    }
}
