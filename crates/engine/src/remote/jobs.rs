use reqwest::Method;
use runway_api::{ServiceClient, ServiceKind};
use runway_types::{SqlQuery, Step};
use serde_json::{Value, json};

use super::{call, unbuildable};
use crate::collaborators::{JobService, PollRequest, RemoteStepHandle, StepProgress, SubmitRequest};
use crate::error::RemoteError;

/// Where a service's in-flight steps are tracked.
#[derive(Debug, Clone, Copy)]
struct Tracking {
    service: ServiceKind,
    progress: &'static str,
    results: &'static str,
}

const SQL_TRACKING: Tracking = Tracking {
    service: ServiceKind::Sql,
    progress: "/progress",
    results: "/results",
};

/// Code jobs and data jobs both run on the cluster's job coordinator.
const ASYNC_JOB_TRACKING: Tracking = Tracking {
    service: ServiceKind::CodeJobs,
    progress: "/spark/job/async/progress",
    results: "/spark/job/async/results",
};

/// Every in-flight step, queries included, is cancelled through the job coordinator.
const CANCEL_SERVICE: ServiceKind = ServiceKind::CodeJobs;
const CANCEL_PATH: &str = "/spark/job/async/cancel";

/// [`JobService`] over HTTP.
///
/// Submission goes to the service that owns the step kind; progress and
/// results go to wherever that kind is tracked. Data jobs are submitted to
/// the data-job service but tracked on the code-job service.
///
/// Services read submissions as form fields, with the step options as a
/// JSON-encoded `options` field. The idempotency key travels as a header.
#[derive(Debug, Clone)]
pub struct HttpJobService {
    client: ServiceClient,
    submit_to: ServiceKind,
    tracking: Tracking,
}

impl HttpJobService {
    pub fn sql(client: ServiceClient) -> Self {
        Self {
            client,
            submit_to: ServiceKind::Sql,
            tracking: SQL_TRACKING,
        }
    }

    pub fn code_jobs(client: ServiceClient) -> Self {
        Self {
            client,
            submit_to: ServiceKind::CodeJobs,
            tracking: ASYNC_JOB_TRACKING,
        }
    }

    pub fn data_jobs(client: ServiceClient) -> Self {
        Self {
            client,
            submit_to: ServiceKind::DataJobs,
            tracking: ASYNC_JOB_TRACKING,
        }
    }

    fn submit_path(step: &Step) -> String {
        match step {
            Step::Sql(sql) => match &sql.query {
                SqlQuery::Saved(id) => format!("/query/{id}/run"),
                SqlQuery::Adhoc(_) => "/sql".to_string(),
            },
            Step::CodeJob(job) => format!("/job/{}/run", job.job_id),
            Step::DataJob(job) => format!("/datajob/{}/run", job.datajob_id),
        }
    }

    fn submit_form(request: &SubmitRequest) -> Vec<(&'static str, String)> {
        let mut form = Vec::with_capacity(5);
        if let Step::Sql(sql) = &request.step
            && let SqlQuery::Adhoc(query) = &sql.query
        {
            form.push(("query", query.clone()));
        }
        form.push(("cluster", request.cluster.clone()));
        form.push(("account", request.account.to_string()));
        form.push(("user", request.user.to_string()));
        form.push(("options", Value::Object(request.options.clone()).to_string()));
        form
    }

    fn tracked(&self, method: Method, path: &str, query: &[(&str, String)]) -> Result<reqwest::RequestBuilder, RemoteError> {
        let service = self.tracking.service;
        Ok(self
            .client
            .request(service, method, path)
            .map_err(|error| unbuildable(service, error))?
            .query(query))
    }
}

fn tracking_query(request: &PollRequest, with_cluster: bool) -> Vec<(&'static str, String)> {
    let mut query = Vec::with_capacity(4);
    if with_cluster {
        query.push(("cluster", request.cluster.clone()));
    }
    query.push(("account", request.account.to_string()));
    query.push(("user", request.user.to_string()));
    query.push(("handle", request.remote.to_string()));
    query
}

/// Remote handles arrive as strings or bare numbers.
fn remote_handle(document: &Value) -> Result<RemoteStepHandle, RemoteError> {
    match document.get("handle") {
        Some(Value::String(handle)) if !handle.is_empty() => Ok(RemoteStepHandle(handle.clone())),
        Some(Value::Number(handle)) => Ok(RemoteStepHandle(handle.to_string())),
        _ => Err(RemoteError::status(200, json!({ "error": "submission response carried no handle" }).to_string())),
    }
}

#[async_trait::async_trait]
impl JobService for HttpJobService {
    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteStepHandle, RemoteError> {
        let builder = self
            .client
            .request(self.submit_to, Method::POST, &Self::submit_path(&request.step))
            .map_err(|error| unbuildable(self.submit_to, error))?
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&Self::submit_form(request));
        let document = call(self.submit_to, builder).await?;
        remote_handle(&document)
    }

    async fn poll_progress(&self, request: &PollRequest) -> Result<StepProgress, RemoteError> {
        let builder = self.tracked(Method::GET, self.tracking.progress, &tracking_query(request, true))?;
        let progress = call(self.tracking.service, builder).await?;
        let Some(running) = progress.get("running").and_then(Value::as_bool) else {
            return Err(RemoteError::status(200, progress.to_string()));
        };
        Ok(StepProgress { running, progress })
    }

    async fn fetch_result(&self, request: &PollRequest) -> Result<Value, RemoteError> {
        let builder = self.tracked(Method::GET, self.tracking.results, &tracking_query(request, false))?;
        call(self.tracking.service, builder).await
    }

    async fn cancel(&self, request: &PollRequest) -> Result<(), RemoteError> {
        let builder = self
            .client
            .request(CANCEL_SERVICE, Method::POST, CANCEL_PATH)
            .map_err(|error| unbuildable(CANCEL_SERVICE, error))?
            .form(&tracking_query(request, true));
        call(CANCEL_SERVICE, builder).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_types::{AccountId, CodeJobStep, DataDirection, DataJobStep, SqlStep, StepOptions, UserId};

    fn request(step: Step) -> SubmitRequest {
        let mut options = StepOptions::new();
        options.insert("limit".into(), json!(5));
        SubmitRequest {
            account: AccountId(1),
            user: UserId(2),
            cluster: "etl".into(),
            step,
            options,
            idempotency_key: "run:0".into(),
        }
    }

    #[test]
    fn submit_paths_follow_step_kind() {
        let saved = Step::Sql(SqlStep {
            query: SqlQuery::Saved(12),
            options: StepOptions::new(),
        });
        let job = Step::CodeJob(CodeJobStep {
            job_id: 7,
            options: StepOptions::new(),
        });
        let import = Step::DataJob(DataJobStep {
            datajob_id: 3,
            direction: DataDirection::Import,
            options: StepOptions::new(),
        });
        assert_eq!(HttpJobService::submit_path(&saved), "/query/12/run");
        assert_eq!(HttpJobService::submit_path(&job), "/job/7/run");
        assert_eq!(HttpJobService::submit_path(&import), "/datajob/3/run");
    }

    #[test]
    fn adhoc_sql_travels_as_form_fields() {
        let submit = request(Step::Sql(SqlStep {
            query: SqlQuery::Adhoc("select 1".into()),
            options: StepOptions::new(),
        }));
        let form = HttpJobService::submit_form(&submit);
        assert_eq!(
            form,
            vec![
                ("query", "select 1".to_string()),
                ("cluster", "etl".to_string()),
                ("account", "1".to_string()),
                ("user", "2".to_string()),
                ("options", r#"{"limit":5}"#.to_string()),
            ]
        );
        assert!(form.iter().all(|(name, _)| *name != "idempotencyKey"));
        assert_eq!(HttpJobService::submit_path(&submit.step), "/sql");
    }

    #[test]
    fn handles_may_be_numeric() {
        assert_eq!(remote_handle(&json!({"handle": 42})).unwrap(), RemoteStepHandle("42".into()));
        assert!(remote_handle(&json!({"status": "ok"})).is_err());
    }
}
