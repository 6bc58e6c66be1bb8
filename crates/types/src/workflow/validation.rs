//! Definition-write validation for workflows.
//!
//! These checks run when a definition is created or edited, never inside the
//! sequencer. Ownership of referenced queries and jobs is verified by the
//! persistence collaborator, which has access to those records.

use std::fmt;

use thiserror::Error;

use super::{ALL_ACCOUNT_USERS_SENTINEL, ClusterSpec, NotifyTargets, SqlQuery, Step, Workflow};

/// A single problem found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("you must give your workflow a title")]
    MissingTitle,

    #[error("you must name your cluster")]
    MissingClusterName,

    #[error("the number of workers for cluster '{name}' must be greater than zero")]
    NoWorkers { name: String },

    #[error("SQL step requires exactly one of a saved query id or an ad-hoc query")]
    AmbiguousSqlSource,

    #[error("step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("'{user}' is not a valid user id")]
    InvalidNotifyTarget { user: i64 },
}

impl ValidationError {
    pub fn invalid_step(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidStep {
            index,
            reason: reason.into(),
        }
    }
}

/// Every problem found in one definition, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Validate a workflow definition, collecting every violation.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    if workflow.title.trim().is_empty() {
        errors.push(ValidationError::MissingTitle);
    }

    validate_cluster(&workflow.cluster, &mut errors);

    for (index, step) in workflow.steps.iter().enumerate() {
        if let Err(error) = validate_step(index, step) {
            errors.push(error);
        }
    }

    if let NotifyTargets::Users(users) = &workflow.notify {
        for user in users {
            // The sentinel only means "everyone" as a singleton; mixed in a list it is just a bad id.
            if user.0 <= 0 || user.0 == ALL_ACCOUNT_USERS_SENTINEL {
                errors.push(ValidationError::InvalidNotifyTarget { user: user.0 });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

fn validate_cluster(cluster: &ClusterSpec, errors: &mut Vec<ValidationError>) {
    if cluster.name().trim().is_empty() {
        errors.push(ValidationError::MissingClusterName);
    }
    if let ClusterSpec::Start { name, workers } = cluster
        && *workers == 0
    {
        errors.push(ValidationError::NoWorkers { name: name.clone() });
    }
}

fn validate_step(index: usize, step: &Step) -> Result<(), ValidationError> {
    match step {
        Step::Sql(sql) => match &sql.query {
            SqlQuery::Saved(query_id) if *query_id <= 0 => {
                Err(ValidationError::invalid_step(index, format!("query id '{query_id}' is not valid")))
            }
            SqlQuery::Adhoc(text) if text.trim().is_empty() => Err(ValidationError::invalid_step(index, "ad-hoc query is empty")),
            _ => Ok(()),
        },
        Step::CodeJob(job) if job.job_id <= 0 => Err(ValidationError::invalid_step(index, "this step requires a valid job")),
        Step::DataJob(job) if job.datajob_id <= 0 => Err(ValidationError::invalid_step(
            index,
            format!("this step requires a valid {} job", step.kind().display_name().to_lowercase()),
        )),
        _ => Ok(()),
    }
}
