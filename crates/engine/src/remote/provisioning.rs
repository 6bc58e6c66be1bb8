use reqwest::{Method, StatusCode};
use runway_api::{ServiceClient, ServiceKind};
use runway_types::{AccountId, UserId};
use serde_json::Value;
use tracing::debug;

use super::{call, encode_segment, exchange, unbuildable};
use crate::collaborators::{ClusterRequest, ClusterStatus, Provisioner};
use crate::error::RemoteError;

const SERVICE: ServiceKind = ServiceKind::Provisioning;

/// [`Provisioner`] over HTTP. Launch and shutdown are sent as form fields.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: ServiceClient,
}

impl HttpProvisioner {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, RemoteError> {
        self.client.request(SERVICE, method, path).map_err(|error| unbuildable(SERVICE, error))
    }
}

#[async_trait::async_trait]
impl Provisioner for HttpProvisioner {
    /// `409 Conflict` means the name is taken for the account.
    async fn create_cluster(&self, request: &ClusterRequest) -> Result<bool, RemoteError> {
        let form = [
            ("account", request.account.to_string()),
            ("user", request.user.to_string()),
            ("workers", request.workers.to_string()),
            ("clusterName", request.name.clone()),
        ];
        let builder = self
            .request(Method::POST, "/launch/cluster")?
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form);
        let (status, text) = exchange(SERVICE, builder).await?;
        match StatusCode::from_u16(status) {
            Ok(code) if code.is_success() => Ok(true),
            Ok(StatusCode::CONFLICT) => {
                debug!(cluster = %request.name, "cluster name already taken");
                Ok(false)
            }
            _ => Err(RemoteError::status(status, text)),
        }
    }

    async fn is_alive(&self, account: AccountId, user: UserId, name: &str) -> Result<ClusterStatus, RemoteError> {
        let builder = self
            .request(Method::GET, &format!("/cluster/{}", encode_segment(name)))?
            .query(&[("account", account.to_string()), ("user", user.to_string())]);
        let detail = call(SERVICE, builder).await?;
        let Some(alive) = detail.pointer("/cluster/alive").and_then(Value::as_bool) else {
            return Err(RemoteError::status(200, detail.to_string()));
        };
        Ok(ClusterStatus { alive, detail })
    }

    async fn request_shutdown(&self, account: AccountId, user: UserId, name: &str) -> Result<(), RemoteError> {
        let form = [("account", account.to_string()), ("user", user.to_string())];
        let builder = self
            .request(Method::POST, &format!("/cluster/{}/shutdown", encode_segment(name)))?
            .form(&form);
        call(SERVICE, builder).await.map(|_| ())
    }
}
