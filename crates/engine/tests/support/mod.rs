//! In-memory collaborators and a deterministic harness for sequencer tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use runway_engine::config::EngineSettings;
use runway_engine::{
    Clock, ClusterRequest, ClusterStatus, Collaborators, Engine, ExecutionStateStore, InMemoryRepository, InMemoryStateStore, JobService,
    JobServices, Mailer, ManualClock, ManualQueue, PollRequest, Provisioner, RemoteError, RemoteStepHandle, StepProgress,
    SubmitRequest,
};
use runway_types::{
    AccountId, ClusterSpec, CodeJobStep, DataDirection, DataJobStep, ExecutionRun, NotifyTargets, RunHandle, SqlQuery, SqlStep, Step,
    StepOptions, UserId, UserRecord, Workflow, WorkflowId,
};
use serde_json::{Value, json};

pub const ACCOUNT: AccountId = AccountId(1);
pub const OWNER: UserId = UserId(1);
const DELIVERY_LIMIT: usize = 200_000;

#[derive(Default)]
struct JobState {
    submits: Vec<SubmitRequest>,
    submit_attempts: usize,
    polls: HashMap<String, usize>,
    cancels: Vec<PollRequest>,
}

/// Job service whose behavior is scripted up front.
pub struct FakeJobService {
    prefix: &'static str,
    running_polls: usize,
    result: Value,
    submit_failure: Option<RemoteError>,
    transient_submit_failures: usize,
    state: Mutex<JobState>,
}

impl FakeJobService {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            running_polls: 1,
            result: json!({ "results": [] }),
            submit_failure: None,
            transient_submit_failures: 0,
            state: Mutex::new(JobState::default()),
        }
    }

    /// Number of polls that report the step as still running.
    pub fn running_for(mut self, polls: usize) -> Self {
        self.running_polls = polls;
        self
    }

    pub fn never_finishing(self) -> Self {
        self.running_for(usize::MAX)
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    pub fn failing_submit(mut self, failure: RemoteError) -> Self {
        self.submit_failure = Some(failure);
        self
    }

    /// The first `failures` submissions fail without a response.
    pub fn unreachable_for(mut self, failures: usize) -> Self {
        self.transient_submit_failures = failures;
        self
    }

    pub fn submits(&self) -> Vec<SubmitRequest> {
        self.state.lock().unwrap().submits.clone()
    }

    pub fn submit_attempts(&self) -> usize {
        self.state.lock().unwrap().submit_attempts
    }

    pub fn cancels(&self) -> Vec<PollRequest> {
        self.state.lock().unwrap().cancels.clone()
    }
}

#[async_trait::async_trait]
impl JobService for FakeJobService {
    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteStepHandle, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.submit_attempts += 1;
        if state.submit_attempts <= self.transient_submit_failures {
            return Err(RemoteError::transport("connection refused"));
        }
        if let Some(failure) = &self.submit_failure {
            return Err(failure.clone());
        }
        state.submits.push(request.clone());
        Ok(RemoteStepHandle(format!("{}-{}", self.prefix, state.submits.len())))
    }

    async fn poll_progress(&self, request: &PollRequest) -> Result<StepProgress, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let polls = state.polls.entry(request.remote.to_string()).or_default();
        *polls += 1;
        let running = *polls <= self.running_polls;
        Ok(StepProgress {
            running,
            progress: json!({ "running": running, "polls": *polls }),
        })
    }

    async fn fetch_result(&self, _request: &PollRequest) -> Result<Value, RemoteError> {
        Ok(self.result.clone())
    }

    async fn cancel(&self, request: &PollRequest) -> Result<(), RemoteError> {
        self.state.lock().unwrap().cancels.push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
struct ProvisionerState {
    creates: Vec<ClusterRequest>,
    alive_checks: usize,
    shutdowns: Vec<String>,
}

/// Provisioner that turns a cluster alive after a fixed number of checks.
pub struct FakeProvisioner {
    alive_after: Option<usize>,
    name_taken: bool,
    state: Mutex<ProvisionerState>,
}

impl FakeProvisioner {
    pub fn alive_after(checks: usize) -> Self {
        Self {
            alive_after: Some(checks),
            name_taken: false,
            state: Mutex::new(ProvisionerState::default()),
        }
    }

    pub fn never_alive() -> Self {
        Self {
            alive_after: None,
            ..Self::alive_after(0)
        }
    }

    pub fn name_taken() -> Self {
        Self {
            name_taken: true,
            ..Self::alive_after(0)
        }
    }

    pub fn creates(&self) -> Vec<ClusterRequest> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn alive_checks(&self) -> usize {
        self.state.lock().unwrap().alive_checks
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.state.lock().unwrap().shutdowns.clone()
    }
}

#[async_trait::async_trait]
impl Provisioner for FakeProvisioner {
    async fn create_cluster(&self, request: &ClusterRequest) -> Result<bool, RemoteError> {
        self.state.lock().unwrap().creates.push(request.clone());
        Ok(!self.name_taken)
    }

    async fn is_alive(&self, _account: AccountId, _user: UserId, name: &str) -> Result<ClusterStatus, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.alive_checks += 1;
        let alive = self.alive_after.is_some_and(|after| state.alive_checks > after);
        Ok(ClusterStatus {
            alive,
            detail: json!({ "cluster": { "name": name, "alive": alive } }),
        })
    }

    async fn request_shutdown(&self, _account: AccountId, _user: UserId, name: &str) -> Result<(), RemoteError> {
        self.state.lock().unwrap().shutdowns.push(name.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentEmail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send_email(&self, user: &UserRecord, subject: &str, body: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(SentEmail {
            to: user.email.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// A fully wired engine driven by a manual queue and clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub queue: Arc<ManualQueue>,
    pub store: Arc<InMemoryStateStore>,
    pub repository: Arc<InMemoryRepository>,
    pub sql: Arc<FakeJobService>,
    pub code_jobs: Arc<FakeJobService>,
    pub data_jobs: Arc<FakeJobService>,
    pub provisioner: Arc<FakeProvisioner>,
    pub mailer: Arc<RecordingMailer>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Stores `workflow` and triggers it.
    pub async fn trigger(&self, workflow: Workflow) -> RunHandle {
        self.trigger_with(workflow, StepOptions::new()).await
    }

    pub async fn trigger_with(&self, workflow: Workflow, parameters: StepOptions) -> RunHandle {
        let id = workflow.id;
        self.repository.insert_workflow(workflow);
        self.engine.orchestrator().trigger_with(id, parameters).await.unwrap()
    }

    /// Delivers checkpoints until none are left.
    pub async fn drain(&self) -> usize {
        self.drain_at_most(DELIVERY_LIMIT).await
    }

    pub async fn drain_at_most(&self, limit: usize) -> usize {
        let sequencer = self.engine.sequencer();
        self.queue.run_until_idle(sequencer.as_ref(), limit).await.unwrap()
    }

    pub async fn status(&self, handle: &RunHandle) -> ExecutionRun {
        self.store.get(handle).await.unwrap()
    }

    pub fn add_users(&self, account: AccountId, ids: impl IntoIterator<Item = i64>) {
        for id in ids {
            self.repository.insert_user(UserRecord {
                id: UserId(id),
                account,
                email: format!("user{id}@example.com"),
                name: None,
            });
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn history_labels(&self) -> Vec<String> {
        self.repository.history().iter().map(|record| record.event.to_string()).collect()
    }

    pub fn total_submits(&self) -> usize {
        self.sql.submits().len() + self.code_jobs.submits().len() + self.data_jobs.submits().len()
    }
}

pub struct HarnessBuilder {
    sql: FakeJobService,
    code_jobs: FakeJobService,
    data_jobs: FakeJobService,
    provisioner: FakeProvisioner,
    settings: EngineSettings,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            sql: FakeJobService::new("query"),
            code_jobs: FakeJobService::new("job"),
            data_jobs: FakeJobService::new("datajob"),
            provisioner: FakeProvisioner::alive_after(2),
            settings: EngineSettings::default(),
        }
    }
}

impl HarnessBuilder {
    pub fn sql(mut self, service: FakeJobService) -> Self {
        self.sql = service;
        self
    }

    pub fn code_jobs(mut self, service: FakeJobService) -> Self {
        self.code_jobs = service;
        self
    }

    pub fn data_jobs(mut self, service: FakeJobService) -> Self {
        self.data_jobs = service;
        self
    }

    pub fn provisioner(mut self, provisioner: FakeProvisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let queue = Arc::new(ManualQueue::new(clock.clone()));
        let store = Arc::new(InMemoryStateStore::new(clock.clone()));
        let repository = Arc::new(InMemoryRepository::new());
        let sql = Arc::new(self.sql);
        let code_jobs = Arc::new(self.code_jobs);
        let data_jobs = Arc::new(self.data_jobs);
        let provisioner = Arc::new(self.provisioner);
        let mailer = Arc::new(RecordingMailer::default());

        let collaborators = Collaborators {
            repository: repository.clone(),
            users: repository.clone(),
            provisioner: provisioner.clone(),
            jobs: JobServices::new(sql.clone(), code_jobs.clone(), data_jobs.clone()),
            mailer: mailer.clone(),
        };
        let engine = Engine::new(&collaborators, store.clone(), queue.clone(), clock.clone(), &self.settings);

        Harness {
            clock,
            queue,
            store,
            repository,
            sql,
            code_jobs,
            data_jobs,
            provisioner,
            mailer,
            engine,
        }
    }
}

pub fn workflow(id: i64, cluster: ClusterSpec, steps: Vec<Step>) -> Workflow {
    Workflow {
        id: WorkflowId(id),
        account: ACCOUNT,
        user: OWNER,
        title: format!("workflow {id}"),
        description: None,
        steps,
        cluster,
        notify: NotifyTargets::default(),
    }
}

pub fn pick(name: &str) -> ClusterSpec {
    ClusterSpec::Pick { name: name.to_string() }
}

pub fn start(name: &str, workers: u32) -> ClusterSpec {
    ClusterSpec::Start {
        name: name.to_string(),
        workers,
    }
}

pub fn saved_query(id: i64) -> Step {
    Step::Sql(SqlStep {
        query: SqlQuery::Saved(id),
        options: StepOptions::new(),
    })
}

pub fn code_job(id: i64) -> Step {
    Step::CodeJob(CodeJobStep {
        job_id: id,
        options: StepOptions::new(),
    })
}

pub fn import_job(id: i64) -> Step {
    Step::DataJob(DataJobStep {
        datajob_id: id,
        direction: DataDirection::Import,
        options: StepOptions::new(),
    })
}
