//! Redaction of sensitive values before they reach any log record

use hyper::HeaderMap;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "password",
    "token",
    "access_token",
    "refresh_token",
    "secret",
    "message",
    "context",
    "content",
    "email",
    "phone",
];

/// Any key containing one of these is treated as a credential
const CREDENTIAL_FRAGMENTS: &[&str] = &["authorization", "cookie", "password", "token", "secret", "api-key", "api_key", "apikey"];

/// Exact match on the sensitive key list, or a key that looks like it holds a credential
pub fn is_sensitive(key: &str) -> bool {
    if SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
        return true;
    }
    let lower = key.to_ascii_lowercase();
    CREDENTIAL_FRAGMENTS.iter().any(|fragment| lower.contains(fragment))
}

/// Copy of the headers with sensitive values replaced by the marker.
/// Non-UTF-8 values are dropped.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_string();
            if is_sensitive(&name) {
                return Some((name, REDACTED.to_string()));
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect()
}

/// Copy of a JSON value with sensitive keys replaced at any depth
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    if is_sensitive(key) {
                        (key.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), redact_json(inner))
                    }
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}
