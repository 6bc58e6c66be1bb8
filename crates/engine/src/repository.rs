//! Persistence collaborators: workflow definitions, account users and the
//! history log.
//!
//! [`FileWorkflowRepository`] keeps everything under one directory:
//!
//! ```text
//! <root>/<workflow-id>.yaml|yml|json   workflow definitions
//! <root>/users.json                    account users
//! <root>/.history/<account>.jsonl      appended history records
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use runway_types::{AccountId, HistoryRecord, UserId, UserRecord, Workflow, WorkflowId};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::collaborators::{UserDirectory, WorkflowRepository};
use crate::error::EngineError;

const DEFINITION_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];
const USERS_FILE: &str = "users.json";
const HISTORY_DIR: &str = ".history";

#[derive(Debug, Clone)]
pub struct FileWorkflowRepository {
    root: PathBuf,
}

impl FileWorkflowRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_path(&self, account: AccountId) -> PathBuf {
        self.root.join(HISTORY_DIR).join(format!("{account}.jsonl"))
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, EngineError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(EngineError::repository(format!("failed to read {}: {error}", path.display()))),
        }
    }

    async fn users(&self) -> Result<Vec<UserRecord>, EngineError> {
        let path = self.root.join(USERS_FILE);
        let Some(content) = Self::read_optional(&path).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&content).map_err(|error| EngineError::repository(format!("failed to parse {}: {error}", path.display())))
    }
}

#[async_trait::async_trait]
impl WorkflowRepository for FileWorkflowRepository {
    /// Definitions on disk never went through a definition write, so they are
    /// validated on load.
    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, EngineError> {
        for extension in DEFINITION_EXTENSIONS {
            let path = self.root.join(format!("{id}.{extension}"));
            let Some(content) = Self::read_optional(&path).await? else {
                continue;
            };
            let workflow: Workflow = serde_yaml::from_str(&content)
                .map_err(|error| EngineError::repository(format!("failed to parse {}: {error}", path.display())))?;
            if workflow.id != id {
                return Err(EngineError::repository(format!(
                    "{} declares workflow {} instead of {id}",
                    path.display(),
                    workflow.id
                )));
            }
            workflow.validate()?;
            debug!(workflow = %id, path = %path.display(), "loaded workflow definition");
            return Ok(workflow);
        }
        Err(EngineError::WorkflowNotFound(id))
    }

    async fn append_history(&self, record: HistoryRecord) -> Result<(), EngineError> {
        let path = self.history_path(record.account);
        let failed = |error: std::io::Error| EngineError::repository(format!("failed to append to {}: {error}", path.display()));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(failed)?;
        }
        let mut line = serde_json::to_string(&record).map_err(|error| EngineError::repository(error.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await.map_err(failed)?;
        file.write_all(line.as_bytes()).await.map_err(failed)?;
        file.flush().await.map_err(failed)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl UserDirectory for FileWorkflowRepository {
    async fn account_users(&self, account: AccountId) -> Result<Vec<UserRecord>, EngineError> {
        Ok(self.users().await?.into_iter().filter(|user| user.account == account).collect())
    }

    async fn find_user(&self, user: UserId) -> Result<Option<UserRecord>, EngineError> {
        Ok(self.users().await?.into_iter().find(|record| record.id == user))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    workflows: HashMap<WorkflowId, Workflow>,
    users: Vec<UserRecord>,
    history: Vec<HistoryRecord>,
}

/// Process-local repository and user directory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_workflow(&self, workflow: Workflow) {
        self.lock().workflows.insert(workflow.id, workflow);
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.lock().users.push(user);
    }

    /// Every history record appended so far, oldest first.
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl WorkflowRepository for InMemoryRepository {
    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, EngineError> {
        self.lock().workflows.get(&id).cloned().ok_or(EngineError::WorkflowNotFound(id))
    }

    async fn append_history(&self, record: HistoryRecord) -> Result<(), EngineError> {
        self.lock().history.push(record);
        Ok(())
    }
}

#[async_trait::async_trait]
impl UserDirectory for InMemoryRepository {
    async fn account_users(&self, account: AccountId) -> Result<Vec<UserRecord>, EngineError> {
        Ok(self.lock().users.iter().filter(|user| user.account == account).cloned().collect())
    }

    async fn find_user(&self, user: UserId) -> Result<Option<UserRecord>, EngineError> {
        Ok(self.lock().users.iter().find(|record| record.id == user).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runway_types::HistoryEvent;
    use std::fs;

    const DEFINITION: &str = r#"
id: 7
account: 1
user: 2
title: nightly
cluster:
  action: pick
  name: shared
steps:
  - type: code_job
    job_id: 11
notify: [-1]
"#;

    #[tokio::test]
    async fn loads_yaml_definitions_by_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("7.yaml"), DEFINITION).unwrap();
        let repository = FileWorkflowRepository::new(temp_dir.path());

        let workflow = repository.load_workflow(WorkflowId(7)).await.unwrap();
        assert_eq!(workflow.title, "nightly");
        assert_eq!(workflow.steps.len(), 1);

        let error = repository.load_workflow(WorkflowId(8)).await.unwrap_err();
        assert!(matches!(error, EngineError::WorkflowNotFound(WorkflowId(8))));
    }

    #[tokio::test]
    async fn rejects_definitions_under_the_wrong_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("9.yml"), DEFINITION).unwrap();
        let repository = FileWorkflowRepository::new(temp_dir.path());

        let error = repository.load_workflow(WorkflowId(9)).await.unwrap_err();
        assert!(error.to_string().contains("declares workflow 7"), "unexpected error: {error}");
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected_on_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("7.yaml"), DEFINITION.replace("title: nightly", "title: ''")).unwrap();
        let repository = FileWorkflowRepository::new(temp_dir.path());

        let error = repository.load_workflow(WorkflowId(7)).await.unwrap_err();
        assert!(matches!(error, EngineError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn history_is_appended_as_json_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repository = FileWorkflowRepository::new(temp_dir.path());
        for event in [HistoryEvent::StartWorkflow, HistoryEvent::FinishWorkflow] {
            repository
                .append_history(HistoryRecord {
                    account: AccountId(3),
                    user: UserId(1),
                    event,
                    workflow_id: Some(WorkflowId(7)),
                    handle: None,
                    data: serde_json::json!({}),
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let content = fs::read_to_string(repository.history_path(AccountId(3))).unwrap();
        let events: Vec<String> = content
            .lines()
            .map(|line| serde_json::from_str::<HistoryRecord>(line).unwrap().event.to_string())
            .collect();
        assert_eq!(events, vec!["start_workflow", "finish_workflow"]);
    }

    #[tokio::test]
    async fn users_are_scoped_by_account() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(
            temp_dir.path().join(USERS_FILE),
            r#"[
                {"id": 1, "account": 1, "email": "a@example.com"},
                {"id": 2, "account": 1, "email": "b@example.com"},
                {"id": 3, "account": 2, "email": "c@example.com"}
            ]"#,
        )
        .unwrap();
        let repository = FileWorkflowRepository::new(temp_dir.path());

        assert_eq!(repository.account_users(AccountId(1)).await.unwrap().len(), 2);
        assert_eq!(repository.find_user(UserId(3)).await.unwrap().unwrap().account, AccountId(2));
        assert!(repository.find_user(UserId(4)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_users_file_means_no_users() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repository = FileWorkflowRepository::new(temp_dir.path());
        assert!(repository.account_users(AccountId(1)).await.unwrap().is_empty());
    }
}
