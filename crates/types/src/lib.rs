//! Shared type definitions for the Runway workflow orchestrator.
//!
//! The crate holds the immutable workflow snapshot consumed by the engine
//! ([`workflow`]), the mutable per-run progress record exposed to API
//! consumers ([`run`]), and the audit history vocabulary ([`history`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod history;
pub mod run;
pub mod workflow;

pub use history::{HistoryEvent, HistoryRecord};
pub use run::{ExecutionRun, RunUpdate};
pub use workflow::validation::{ValidationError, ValidationErrors};
pub use workflow::{
    ClusterSpec, CodeJobStep, DataDirection, DataJobStep, NotifyTargets, SqlQuery, SqlStep, Step, StepKind, StepOptions, Workflow,
};

/// Identifier of a tenant account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

/// Identifier of a user belonging to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Identifier of a persisted workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub i64);

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(AccountId, UserId, WorkflowId);

/// Opaque lookup key for one triggered run.
///
/// Handles are UUIDv7 strings, so sorting them lexically orders runs by
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunHandle(String);

impl RunHandle {
    /// Generates a fresh, time-ordered handle.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunHandle {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(value.to_string()))
    }
}

impl From<&str> for RunHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A user as seen by the notification path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub account: AccountId,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}
