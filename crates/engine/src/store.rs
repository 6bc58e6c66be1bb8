//! Execution State Store.
//!
//! Holds one [`ExecutionRun`] per handle plus, per account, a time-indexed
//! set of active handles. The index is what makes `list_active` a rolling
//! window: a run whose worker died stops being refreshed and ages out even
//! though its terminal state was never written.
//!
//! Writes are last-write-wins per field. No locking across checkpoints is
//! needed because a run only ever has one checkpoint in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runway_types::{AccountId, ExecutionRun, RunHandle, RunUpdate};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::collaborators::RemoteStepHandle;
use crate::error::EngineError;

#[async_trait::async_trait]
pub trait ExecutionStateStore: Send + Sync {
    /// Stores a freshly opened run and adds it to its account's active index.
    async fn open(&self, run: ExecutionRun) -> Result<RunHandle, EngineError>;

    /// Applies a field-set. Terminal updates (and cancelled runs) leave the
    /// active index; every other update refreshes the run's index timestamp.
    async fn update(&self, handle: &RunHandle, account: AccountId, update: RunUpdate) -> Result<(), EngineError>;

    async fn get(&self, handle: &RunHandle) -> Result<ExecutionRun, EngineError>;

    /// Sets the cancellation flag. The flag is never cleared.
    async fn mark_cancelled(&self, handle: &RunHandle) -> Result<(), EngineError>;

    async fn is_cancelled(&self, handle: &RunHandle) -> Result<bool, EngineError>;

    /// Runs of `account` refreshed within `window`, oldest handle first.
    async fn list_active(&self, account: AccountId, window: Duration) -> Result<Vec<ExecutionRun>, EngineError>;

    /// Remembers which remote handle a submission produced, keyed by its idempotency key.
    async fn record_submission(&self, handle: &RunHandle, key: &str, remote: &RemoteStepHandle) -> Result<(), EngineError>;

    async fn find_submission(&self, handle: &RunHandle, key: &str) -> Result<Option<RemoteStepHandle>, EngineError>;
}

#[derive(Debug, Default)]
struct StoreState {
    runs: HashMap<RunHandle, ExecutionRun>,
    active: HashMap<AccountId, HashMap<RunHandle, DateTime<Utc>>>,
    submissions: HashMap<(RunHandle, String), RemoteStepHandle>,
}

impl StoreState {
    fn deactivate(&mut self, account: AccountId, handle: &RunHandle) {
        if let Some(index) = self.active.get_mut(&account) {
            index.remove(handle);
            if index.is_empty() {
                self.active.remove(&account);
            }
        }
    }
}

/// Process-local store backed by a mutex-guarded map.
#[derive(Debug, Clone)]
pub struct InMemoryStateStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }
}

#[async_trait::async_trait]
impl ExecutionStateStore for InMemoryStateStore {
    async fn open(&self, run: ExecutionRun) -> Result<RunHandle, EngineError> {
        let mut state = self.state.lock().await;
        if state.runs.contains_key(&run.handle) {
            return Err(EngineError::store(format!("run '{}' already exists", run.handle)));
        }
        let handle = run.handle.clone();
        state.active.entry(run.account).or_default().insert(handle.clone(), self.clock.now());
        state.runs.insert(handle.clone(), run);
        debug!(%handle, "opened run");
        Ok(handle)
    }

    async fn update(&self, handle: &RunHandle, account: AccountId, update: RunUpdate) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let terminal = update.is_terminal();
        let run = state.runs.get_mut(handle).ok_or_else(|| EngineError::UnknownRun(handle.clone()))?;
        update.apply(run, now);
        let inactive = terminal || run.finished || run.cancelled;

        if inactive {
            state.deactivate(account, handle);
        } else {
            state.active.entry(account).or_default().insert(handle.clone(), now);
        }
        Ok(())
    }

    async fn get(&self, handle: &RunHandle) -> Result<ExecutionRun, EngineError> {
        let state = self.state.lock().await;
        state.runs.get(handle).cloned().ok_or_else(|| EngineError::UnknownRun(handle.clone()))
    }

    async fn mark_cancelled(&self, handle: &RunHandle) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(handle).ok_or_else(|| EngineError::UnknownRun(handle.clone()))?;
        run.cancelled = true;
        run.updated_at = now;
        let account = run.account;
        state.deactivate(account, handle);
        debug!(%handle, "run marked cancelled");
        Ok(())
    }

    async fn is_cancelled(&self, handle: &RunHandle) -> Result<bool, EngineError> {
        let state = self.state.lock().await;
        state
            .runs
            .get(handle)
            .map(|run| run.cancelled)
            .ok_or_else(|| EngineError::UnknownRun(handle.clone()))
    }

    async fn list_active(&self, account: AccountId, window: Duration) -> Result<Vec<ExecutionRun>, EngineError> {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| self.clock.now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let state = self.state.lock().await;
        let mut runs: Vec<ExecutionRun> = state
            .active
            .get(&account)
            .into_iter()
            .flatten()
            .filter(|(_, refreshed_at)| **refreshed_at >= cutoff)
            .filter_map(|(handle, _)| state.runs.get(handle).cloned())
            .collect();
        runs.sort_by(|left, right| left.handle.cmp(&right.handle));
        Ok(runs)
    }

    async fn record_submission(&self, handle: &RunHandle, key: &str, remote: &RemoteStepHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.submissions.insert((handle.clone(), key.to_string()), remote.clone());
        Ok(())
    }

    async fn find_submission(&self, handle: &RunHandle, key: &str) -> Result<Option<RemoteStepHandle>, EngineError> {
        let state = self.state.lock().await;
        Ok(state.submissions.get(&(handle.clone(), key.to_string())).cloned())
    }
}
