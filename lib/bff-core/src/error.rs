//! Gateway error taxonomy
//!
//! Every failure the gateway reports to a client is one of these kinds. The
//! `Display` impl is for internal logs; clients only ever see `code()` and
//! `client_message()`.

use serde_json::{json, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Validation failed on '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Upstream {service} unavailable (status {status}): {detail}")]
    UpstreamUnavailable {
        service: String,
        status: u16,
        detail: String,
    },

    #[error("Route not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Backend answered, but with a status the gateway will not relay as-is.
    /// Only 5xx codes are kept; anything else collapses to 502.
    pub fn upstream_status(service: impl Into<String>, status: u16, detail: impl Into<String>) -> Self {
        let status = if (500..600).contains(&status) { status } else { 502 };
        Self::UpstreamUnavailable {
            service: service.into(),
            status,
            detail: detail.into(),
        }
    }

    /// Backend did not answer before the deadline.
    pub fn upstream_timeout(service: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            status: 504,
            detail: "request timed out".to_string(),
        }
    }

    /// Backend could not be reached or returned an unreadable response.
    pub fn upstream_unreachable(service: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            status: 502,
            detail: detail.into(),
        }
    }

    /// HTTP status code reported to the client
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingCredential(_) | Self::InvalidCredential(_) => 401,
            Self::Validation { .. } | Self::UnsupportedMediaType(_) => 400,
            Self::RateLimitExceeded { .. } => 429,
            Self::UpstreamUnavailable { status, .. } => *status,
            Self::NotFound(_) => 404,
            Self::MethodNotAllowed(_) => 405,
            Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code, used as the `error` field of every error body
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential(_) => "missing_credential",
            Self::InvalidCredential(_) => "invalid_credential",
            Self::Validation { .. } => "validation_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::NotFound(_) => "not_found",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to the client. Never includes backend detail.
    pub fn client_message(&self) -> String {
        match self {
            Self::MissingCredential(_) => "Authorization header with a Bearer token is required".to_string(),
            Self::InvalidCredential(_) => "Invalid or expired token".to_string(),
            Self::Validation { field, reason } => format!("{}: {}", field, reason),
            Self::RateLimitExceeded { .. } => "Too many requests, please try again later.".to_string(),
            Self::UnsupportedMediaType(mime) => format!("File type '{}' is not allowed", mime),
            Self::UpstreamUnavailable { .. } => "Upstream service unavailable".to_string(),
            Self::NotFound(_) => "Not found".to_string(),
            Self::MethodNotAllowed(_) => "Method not allowed".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// JSON error body sent to the client
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "error": self.code(),
            "message": self.client_message(),
        });
        if let Self::Validation { field, .. } = self {
            body["field"] = Value::String(field.clone());
        }
        body
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::MissingCredential("x".into()).status_code(), 401);
        assert_eq!(GatewayError::InvalidCredential("x".into()).status_code(), 401);
        assert_eq!(GatewayError::validation("message", "too long").status_code(), 400);
        assert_eq!(GatewayError::UnsupportedMediaType("image/png".into()).status_code(), 400);
        assert_eq!(GatewayError::RateLimitExceeded { retry_after_secs: 3 }.status_code(), 429);
        assert_eq!(GatewayError::Internal("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_upstream_status_keeps_only_server_errors() {
        assert_eq!(GatewayError::upstream_status("ai", 503, "down").status_code(), 503);
        assert_eq!(GatewayError::upstream_status("ai", 200, "garbled").status_code(), 502);
        assert_eq!(GatewayError::upstream_timeout("ai").status_code(), 504);
        assert_eq!(GatewayError::upstream_unreachable("ai", "refused").status_code(), 502);
    }

    #[test]
    fn test_body_hides_upstream_detail() {
        let err = GatewayError::upstream_unreachable("ai", "connect to 10.0.3.7:8000 refused");
        let body = err.to_body().to_string();
        assert!(body.contains("upstream_unavailable"));
        assert!(!body.contains("10.0.3.7"));
    }

    #[test]
    fn test_validation_body_names_field() {
        let body = GatewayError::validation("conversation_id", "does not match required pattern").to_body();
        assert_eq!(body["error"], "validation_error");
        assert_eq!(body["field"], "conversation_id");
    }
}
