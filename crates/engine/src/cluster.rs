//! Cluster Binding Coordinator.
//!
//! Resolves a [`ClusterSpec`] into a bound cluster name. `Pick` binds
//! immediately; `Start` creates a cluster through the [`Provisioner`] and is
//! then polled by the sequencer until it reports alive or the boot budget runs
//! out. The wait is a rescheduled checkpoint, never a parked worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runway_types::{AccountId, ClusterSpec, UserId};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::collaborators::{ClusterRequest, Provisioner};
use crate::config::EngineSettings;
use crate::error::{CheckpointError, RunError};
use crate::queue::{ClusterBinding, RunContext};

/// What the sequencer has to do to obtain a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterResolution {
    /// Already usable.
    Bound(ClusterBinding),
    /// Must be created and waited on.
    Boot { name: String, workers: u32 },
}

/// Outcome of one boot poll.
#[derive(Debug, Clone, PartialEq)]
pub enum BootState {
    Booting(Value),
    Alive,
}

pub struct ClusterCoordinator {
    provisioner: Arc<dyn Provisioner>,
    boot_timeout: Duration,
    poll_interval: Duration,
}

impl ClusterCoordinator {
    pub fn new(provisioner: Arc<dyn Provisioner>, settings: &EngineSettings) -> Self {
        Self {
            provisioner,
            boot_timeout: settings.boot_timeout(),
            poll_interval: settings.boot_poll_interval(),
        }
    }

    pub fn boot_timeout(&self) -> Duration {
        self.boot_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn resolve(spec: &ClusterSpec) -> ClusterResolution {
        match spec {
            ClusterSpec::Pick { name } => ClusterResolution::Bound(ClusterBinding::Bound {
                name: name.clone(),
                ephemeral: false,
            }),
            ClusterSpec::Start { name, workers } => ClusterResolution::Boot {
                name: name.clone(),
                workers: *workers,
            },
        }
    }

    /// Asks the provisioner to create `name`. Creation is exclusive: an
    /// existing cluster of the same name fails the run.
    pub async fn begin_boot(&self, context: &RunContext, name: &str, workers: u32) -> Result<(), CheckpointError> {
        let request = ClusterRequest {
            account: context.account(),
            user: context.user(),
            name: name.to_string(),
            workers,
            idempotency_key: format!("{}:cluster", context.handle),
        };
        let created = self.provisioner.create_cluster(&request).await?;
        if !created {
            return Err(RunError::remote_dispatch(format!("Cluster '{name}' already exists")).into());
        }
        info!(handle = %context.handle, cluster = name, workers, "cluster launch started");
        Ok(())
    }

    /// Polls the provisioner once. The deadline is checked before the call so
    /// an exhausted budget never costs another round trip.
    pub async fn check_boot(
        &self,
        context: &RunContext,
        name: &str,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BootState, CheckpointError> {
        if now >= deadline {
            return Err(RunError::ProvisioningTimeout {
                cluster: name.to_string(),
                timeout_secs: self.boot_timeout.as_secs(),
            }
            .into());
        }
        let status = self.provisioner.is_alive(context.account(), context.user(), name).await?;
        debug!(handle = %context.handle, cluster = name, alive = status.alive, "polled cluster");
        Ok(if status.alive {
            BootState::Alive
        } else {
            BootState::Booting(status.detail)
        })
    }

    /// Fire-and-forget shutdown of an ephemeral cluster.
    pub async fn teardown(&self, account: AccountId, user: UserId, name: &str) {
        match self.provisioner.request_shutdown(account, user, name).await {
            Ok(()) => info!(%account, cluster = name, "requested cluster shutdown"),
            Err(error) => warn!(%account, cluster = name, %error, "cluster shutdown request failed"),
        }
    }
}
