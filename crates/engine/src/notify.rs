//! Post-run email notification.

use std::sync::Arc;

use indexmap::IndexMap;
use runway_types::{NotifyTargets, UserRecord, Workflow};
use tracing::{info, warn};

use crate::collaborators::{Mailer, UserDirectory};
use crate::error::EngineError;

/// Subject and HTML body of the notice for a finished run.
pub fn compose(title: &str, error: Option<&str>) -> (String, String) {
    match error {
        Some(error) => (
            format!("Workflow '{title}' failed"),
            format!("<p>The workflow '{title}' has failed with following error:</p><p>{error}</p>"),
        ),
        None => (
            format!("Workflow '{title}' has succeeded"),
            format!("<p>The workflow '{title}' has succeeded.</p>"),
        ),
    }
}

pub struct Notifier {
    users: Arc<dyn UserDirectory>,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    pub fn new(users: Arc<dyn UserDirectory>, mailer: Arc<dyn Mailer>) -> Self {
        Self { users, mailer }
    }

    /// Sends one notice per resolved recipient and returns how many were sent.
    ///
    /// Unknown users and users outside the workflow's account are skipped.
    /// Mail delivery failures are logged and never fail the run.
    pub async fn notify(&self, workflow: &Workflow, error: Option<&str>) -> Result<usize, EngineError> {
        let recipients = self.recipients(workflow).await?;
        if recipients.is_empty() {
            return Ok(0);
        }

        let (subject, body) = compose(&workflow.title, error);
        let mut sent = 0;
        for user in &recipients {
            match self.mailer.send_email(user, &subject, &body).await {
                Ok(()) => sent += 1,
                Err(error) => warn!(user = %user.id, error = %error, "failed to send workflow notice"),
            }
        }
        info!(workflow = %workflow.id, sent, "sent workflow notices");
        Ok(sent)
    }

    async fn recipients(&self, workflow: &Workflow) -> Result<Vec<UserRecord>, EngineError> {
        let candidates = match &workflow.notify {
            NotifyTargets::AllAccountUsers => self.users.account_users(workflow.account).await?,
            NotifyTargets::Users(ids) => {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.users.find_user(*id).await? {
                        Some(user) if user.account == workflow.account => found.push(user),
                        Some(user) => {
                            warn!(user = %id, account = %user.account, workflow = %workflow.id, "skipping notify target from another account")
                        }
                        None => warn!(user = %id, workflow = %workflow.id, "skipping unknown notify target"),
                    }
                }
                found
            }
        };

        let unique: IndexMap<_, _> = candidates.into_iter().map(|user| (user.id, user)).collect();
        Ok(unique.into_values().collect())
    }
}

/// Mailer that writes notices to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait::async_trait]
impl Mailer for LogMailer {
    async fn send_email(&self, user: &UserRecord, subject: &str, _body: &str) -> anyhow::Result<()> {
        info!(to = %user.email, subject, "workflow notice");
        Ok(())
    }
}
