//! Helpers for interpreting job-service response bodies.

use serde_json::Value;
use thiserror::Error;

/// Longest body excerpt kept in parse errors and log lines.
pub const PREVIEW_LIMIT: usize = 200;

/// Parse a response body that must be JSON.
///
/// An empty body parses as `null`; job services answer some POSTs with no
/// content at all. Anything else that fails to parse is reported with the
/// status code and a collapsed preview of the body.
pub fn parse_response_json_strict(text: &str, status: Option<u16>) -> Result<Value, JsonParseError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str::<Value>(text).map_err(|error| {
        let status_note = status
            .map(|code| format!("status {code}"))
            .unwrap_or_else(|| "unknown status".to_string());
        JsonParseError {
            status_note,
            source: error,
            body_preview: truncate_response_preview(text, PREVIEW_LIMIT),
        }
    })
}

/// Collapse whitespace and cut a body down to roughly `limit` bytes.
pub fn truncate_response_preview(text: &str, limit: usize) -> String {
    if text.trim().is_empty() {
        return "<empty>".to_string();
    }

    let mut preview = String::new();
    for ch in text.chars() {
        if preview.len() >= limit {
            preview.push_str("...");
            break;
        }
        match ch {
            '\n' | '\r' | '\t' => {
                if !preview.ends_with(' ') {
                    preview.push(' ');
                }
            }
            _ => preview.push(ch),
        }
    }

    preview.trim().to_string()
}

#[derive(Debug, Error)]
#[error("failed to parse JSON response ({status_note}): {source}. body preview: {body_preview}")]
pub struct JsonParseError {
    status_note: String,
    #[source]
    source: serde_json::Error,
    body_preview: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_null() {
        assert_eq!(parse_response_json_strict("  \n", Some(200)).unwrap(), Value::Null);
    }

    #[test]
    fn malformed_body_reports_status_and_preview() {
        let error = parse_response_json_strict("<html>\n<body>bad gateway</body>", Some(502)).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("status 502"));
        assert!(message.ends_with("body preview: <html> <body>bad gateway</body>"));
    }

    #[test]
    fn preview_is_bounded() {
        let long = "x".repeat(500);
        let preview = truncate_response_preview(&long, 20);
        assert_eq!(preview, format!("{}...", "x".repeat(20)));
    }
}
