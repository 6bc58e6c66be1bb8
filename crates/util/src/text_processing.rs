//! Redaction of credential-looking values before they reach logs or run
//! status records.
//!
//! Step options routinely carry storage credentials (import/export jobs read
//! from object stores) and job services sometimes echo them back in error
//! bodies, so every remote payload that is logged passes through here.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const REPLACEMENT: &str = "[REDACTED]";

/// Redacts values that look like secrets in a string.
///
/// Key names are preserved so the redacted text stays useful for debugging:
///
/// ```rust
/// use runway_util::redact_sensitive;
///
/// assert_eq!(redact_sensitive("AWS_SECRET_ACCESS_KEY=abc123"), "AWS_SECRET_ACCESS_KEY=[REDACTED]");
/// assert_eq!(redact_sensitive("Authorization: Bearer abc.def"), "Authorization: [REDACTED]");
/// ```
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();

    for pattern in redact_patterns().iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| {
                let prefix = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                let suffix = captures.get(3).map(|m| m.as_str()).unwrap_or("");
                if captures.get(2).is_some() {
                    format!("{prefix}{REPLACEMENT}{suffix}")
                } else {
                    REPLACEMENT.to_string()
                }
            })
            .to_string();
    }

    redacted
}

/// Applies [`redact_sensitive`] to every string inside a JSON value, and
/// blanks out values stored under credential-like keys.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(redact_sensitive(text)),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, entry) in map {
                let redacted = if is_sensitive_key(key) && !entry.is_null() {
                    Value::String(REPLACEMENT.to_string())
                } else {
                    redact_json(entry)
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    static PATTERN: Lazy<Option<Regex>> =
        Lazy::new(|| Regex::new(&format!(r"(?i)^[a-z0-9_.-]*?(?:{})[a-z0-9_.-]*$", keyword_fragment())).ok());
    PATTERN.as_ref().is_some_and(|pattern| pattern.is_match(key))
}

fn redact_patterns() -> &'static Vec<Regex> {
    static PATTERNS: Lazy<Vec<Regex>> = Lazy::new(build_redact_patterns);
    &PATTERNS
}

const SENSITIVE_KEYWORDS: &[&str] = &[
    "ACCESS_KEY",
    "API_KEY",
    "API_TOKEN",
    "AUTH_TOKEN",
    "CLIENT_SECRET",
    "CONNECTION_STRING",
    "DATABASE_URL",
    "PASSWORD",
    "PASSWD",
    "PRIVATE_KEY",
    "SECRET",
    "SECRET_ACCESS_KEY",
    "SESSION_TOKEN",
    "TOKEN",
];

fn keyword_fragment() -> String {
    SENSITIVE_KEYWORDS
        .iter()
        .map(|keyword| keyword.split('_').map(regex::escape).collect::<Vec<_>>().join("[_\\-]?"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Ordered from most specific to most general.
fn build_redact_patterns() -> Vec<Regex> {
    let keywords = keyword_fragment();
    let sources = vec![
        // bare values
        r"(AKIA[0-9A-Z]{16})".to_string(),
        r"(eyJ[A-Za-z0-9\-._~+/]+=*)".to_string(),
        r"(?s)(-----BEGIN [^-]+-----[\s\S]+?-----END [^-]+-----)".to_string(),
        // credentials embedded in connection URLs
        r"(?i)((?:postgres(?:ql)?|mysql|redshift|jdbc:[a-z]+|rediss?|amqps?|s3a?)://[^:/\s]+:)([^@\s]+)(@)".to_string(),
        // headers
        r"(?i)(authorization:\s+)([^\s]+(?:\s+[^\s,;]+)?)".to_string(),
        r"(?i)((?:^|\b)Bearer\s+)([A-Za-z0-9\-._~+/]+=*)".to_string(),
        // assignments
        format!(r"(?im)((?:export\s+)?[A-Za-z0-9_]*?(?:{keywords})[A-Za-z0-9_]*\s*=\s*)([^\s&]+)"),
        format!("(?im)((?:\"|')[A-Za-z0-9_.-]*?(?:{keywords})[A-Za-z0-9_.-]*[\"']\\s*:\\s*(?:\"|'))([^\"']+)((?:\"|'))"),
    ];

    sources.iter().filter_map(|source| Regex::new(source).ok()).collect()
}
