//! HTTP implementations of the job-service and provisioning contracts.
//!
//! Both adapters resolve their base URLs through the shared
//! [`ServiceRegistry`](runway_api::ServiceRegistry) on every call, so a
//! registry refresh redirects in-flight runs at their next checkpoint.

mod jobs;
mod provisioning;

pub use jobs::HttpJobService;
pub use provisioning::HttpProvisioner;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::RequestBuilder;
use runway_api::{ServiceError, ServiceKind};
use runway_util::response::PREVIEW_LIMIT;
use runway_util::{parse_response_json_strict, redact_sensitive, truncate_response_preview};
use serde_json::Value;
use tracing::debug;

use crate::error::RemoteError;

/// Characters escaped when a name is placed in a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'%').add(b'/').add(b'?').add(b'<').add(b'>');

pub(crate) fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// A request that could not even be built is as good as unanswered.
pub(crate) fn unbuildable(service: ServiceKind, error: ServiceError) -> RemoteError {
    RemoteError::transport(format!("{service}: {error}"))
}

/// Sends a request and returns the raw status and body.
///
/// Transport failures are reported without a status so they can be retried.
pub(crate) async fn exchange(service: ServiceKind, builder: RequestBuilder) -> Result<(u16, String), RemoteError> {
    let response = builder
        .send()
        .await
        .map_err(|error| RemoteError::transport(format!("{service} request failed: {error}")))?;
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    debug!(
        %service,
        status,
        body = %redact_sensitive(&truncate_response_preview(&text, PREVIEW_LIMIT)),
        "service responded"
    );
    Ok((status, text))
}

/// Sends a request that must answer 2xx with a JSON (or empty) body.
pub(crate) async fn call(service: ServiceKind, builder: RequestBuilder) -> Result<Value, RemoteError> {
    let (status, text) = exchange(service, builder).await?;
    if !(200..300).contains(&status) {
        return Err(RemoteError::status(status, text));
    }
    parse_response_json_strict(&text, Some(status)).map_err(|error| RemoteError::status(status, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_are_escaped() {
        assert_eq!(encode_segment("nightly etl"), "nightly%20etl");
        assert_eq!(encode_segment("a/b?c"), "a%2Fb%3Fc");
        assert_eq!(encode_segment("plain-name_1"), "plain-name_1");
    }
}
