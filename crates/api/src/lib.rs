//! HTTP plumbing for the remote job services the engine drives.
//!
//! This crate provides:
//!
//! - [`ServiceKind`], the closed set of remote collaborators (SQL engine,
//!   code-job runner, import/export runner, cluster provisioning)
//! - [`ServiceRegistry`], an injected, refreshable map from service to base
//!   URL, so no service location ever lives in process-global state
//! - [`ServiceClient`], a thin wrapper around `reqwest::Client` that builds
//!   requests against the registry's current locations
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runway_api::{ServiceClient, ServiceKind, ServiceRegistry};
//!
//! let registry = Arc::new(ServiceRegistry::from_env()?);
//! let client = ServiceClient::new(registry, std::time::Duration::from_secs(30))?;
//! let response = client
//!     .request(ServiceKind::Provisioning, reqwest::Method::GET, "/cluster/nightly")?
//!     .send()
//!     .await?;
//! ```

mod registry;

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, header};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use registry::ServiceRegistry;

/// Remote collaborators reachable over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    Sql,
    CodeJobs,
    DataJobs,
    Provisioning,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [ServiceKind::Sql, ServiceKind::CodeJobs, ServiceKind::DataJobs, ServiceKind::Provisioning];

    /// Environment variable that overrides this service's base URL.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::Sql => "RUNWAY_SQL_URL",
            Self::CodeJobs => "RUNWAY_CODE_JOBS_URL",
            Self::DataJobs => "RUNWAY_DATA_JOBS_URL",
            Self::Provisioning => "RUNWAY_PROVISIONING_URL",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Sql => "http://localhost:8081/sql",
            Self::CodeJobs => "http://localhost:8082/jobs",
            Self::DataJobs => "http://localhost:8083/datajobs",
            Self::Provisioning => "http://localhost:8084/provisioning",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::CodeJobs => "code-jobs",
            Self::DataJobs => "data-jobs",
            Self::Provisioning => "provisioning",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| ServiceError::UnknownServiceName(value.to_string()))
    }
}

/// Failures while locating or calling a remote service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no location registered for service '{0}'")]
    NotRegistered(ServiceKind),

    #[error("unknown service '{0}'")]
    UnknownServiceName(String),

    #[error("invalid base URL '{url}' for service '{kind}': {reason}")]
    InvalidBaseUrl { kind: ServiceKind, url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Thin wrapper around a configured `reqwest::Client`.
///
/// Every request resolves its base URL through the shared registry at build
/// time, so a refreshed registry takes effect on the next call.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: Client,
    registry: Arc<ServiceRegistry>,
    user_agent: String,
}

impl ServiceClient {
    pub fn new(registry: Arc<ServiceRegistry>, timeout: Duration) -> Result<Self, ServiceError> {
        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let http = Client::builder().default_headers(default_headers).timeout(timeout).build()?;

        Ok(Self {
            http,
            registry,
            user_agent: format!("runway/{}; {}", env!("CARGO_PKG_VERSION"), env::consts::OS),
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Build a request for a method and service-relative path.
    pub fn request(&self, kind: ServiceKind, method: reqwest::Method, path: &str) -> Result<RequestBuilder, ServiceError> {
        let base_url = self.registry.base_url(kind)?;
        let url = join_url(&base_url, path);
        debug!(service = %kind, %url, "building request");

        Ok(self.http.request(method, url).header(header::USER_AGENT, &self.user_agent))
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Validate that a base URL is usable for a service.
///
/// Rules:
/// - must parse as an absolute URL with a host
/// - scheme must be `http` or `https`
pub fn validate_base_url(kind: ServiceKind, base: &str) -> Result<(), ServiceError> {
    let invalid = |reason: String| ServiceError::InvalidBaseUrl {
        kind,
        url: base.to_string(),
        reason,
    };

    let parsed = Url::parse(base).map_err(|error| invalid(error.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("scheme must be http or https; got '{}://'", parsed.scheme())));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("URL must include a host".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_scheme_and_host() {
        assert!(validate_base_url(ServiceKind::Sql, "http://sql.internal:8080/shark").is_ok());
        assert!(validate_base_url(ServiceKind::Sql, "https://sql.example.com").is_ok());

        let error = validate_base_url(ServiceKind::CodeJobs, "ftp://jobs.internal").unwrap_err();
        assert!(error.to_string().contains("scheme must be http or https"));
        assert!(validate_base_url(ServiceKind::CodeJobs, "not a url").is_err());
    }

    #[test]
    fn joins_paths_without_double_slashes() {
        assert_eq!(join_url("http://h/flint/", "/job/3/run"), "http://h/flint/job/3/run");
        assert_eq!(join_url("http://h/flint", "progress"), "http://h/flint/progress");
    }

    #[test]
    fn request_uses_current_registry_location() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.set(ServiceKind::Sql, "http://first.internal/shark").unwrap();
        let client = ServiceClient::new(registry.clone(), Duration::from_secs(5)).unwrap();

        let request = client.request(ServiceKind::Sql, reqwest::Method::GET, "/progress").unwrap().build().unwrap();
        assert_eq!(request.url().as_str(), "http://first.internal/shark/progress");

        registry.set(ServiceKind::Sql, "http://second.internal/shark").unwrap();
        let request = client.request(ServiceKind::Sql, reqwest::Method::GET, "/progress").unwrap().build().unwrap();
        assert_eq!(request.url().host_str(), Some("second.internal"));
    }

    #[test]
    fn unregistered_service_is_an_error() {
        let client = ServiceClient::new(Arc::new(ServiceRegistry::new()), Duration::from_secs(5)).unwrap();
        let error = client.request(ServiceKind::DataJobs, reqwest::Method::POST, "/datajob/1/run").unwrap_err();
        assert!(matches!(error, ServiceError::NotRegistered(ServiceKind::DataJobs)));
    }

    #[test]
    fn parses_service_names() {
        assert_eq!("code-jobs".parse::<ServiceKind>().unwrap(), ServiceKind::CodeJobs);
        assert!("shark".parse::<ServiceKind>().is_err());
    }
}
