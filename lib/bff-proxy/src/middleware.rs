//! Middleware framework for per-request hooks, and the audit logger built on it
//!
//! Every routed request gets a `RequestContext`. Its header and body snapshots
//! are redacted when they are stored, so nothing downstream of the context
//! (audit records, tracing fields, metrics labels) can observe raw credentials
//! or message content.

use crate::redact::{redact_headers, redact_json};
use anyhow::Result;
use bff_core::GatewayError;
use hyper::Request;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, span, warn, Instrument, Level};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Context passed through the middleware chain
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: String,
    /// Route name from the route table, or `unmatched`
    pub route: String,
    pub path: String,
    pub method: String,
    pub client_key: String,
    /// Redacted snapshot of the inbound headers
    pub request_headers: BTreeMap<String, String>,
    pub started: Instant,
    metadata: Arc<Mutex<HashMap<String, String>>>,
    body: Arc<Mutex<Option<Value>>>,
}

impl RequestContext {
    pub fn from_request<B>(req: &Request<B>, route: &str, client_key: &str) -> Self {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128 && v.chars().all(|c| c.is_ascii_graphic()))
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            request_id,
            route: route.to_string(),
            path: req.uri().path().to_string(),
            method: req.method().to_string(),
            client_key: client_key.to_string(),
            request_headers: redact_headers(req.headers()),
            started: Instant::now(),
            metadata: Arc::new(Mutex::new(HashMap::new())),
            body: Arc::new(Mutex::new(None)),
        }
    }

    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn set_metadata(&self, key: &str, value: String) {
        if let Ok(mut m) = self.metadata.lock() {
            m.insert(key.to_string(), value);
        }
    }

    pub fn set_user_id(&self, user_id: &str) {
        self.set_metadata("user_id", user_id.to_string());
    }

    pub fn user_id(&self) -> Option<String> {
        self.get_metadata("user_id")
    }

    /// Record a summary of the request payload. Redaction happens here, before storage.
    pub fn set_body(&self, body: &Value) {
        if let Ok(mut slot) = self.body.lock() {
            *slot = Some(redact_json(body));
        }
    }

    pub fn body(&self) -> Option<Value> {
        self.body.lock().ok().and_then(|b| b.clone())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Coarse classification of how a request ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    ClientError,
    Unauthenticated,
    RateLimited,
    UpstreamError,
    InternalError,
    /// Client went away before a streaming response finished
    ClientClosed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ClientError => "client_error",
            Self::Unauthenticated => "unauthenticated",
            Self::RateLimited => "rate_limited",
            Self::UpstreamError => "upstream_error",
            Self::InternalError => "internal_error",
            Self::ClientClosed => "client_closed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Terminal result of one request
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub status: u16,
    pub kind: OutcomeKind,
    pub error_code: Option<&'static str>,
}

impl Outcome {
    pub fn from_status(status: u16) -> Self {
        let kind = match status {
            200..=399 => OutcomeKind::Success,
            401 => OutcomeKind::Unauthenticated,
            429 => OutcomeKind::RateLimited,
            400..=499 => OutcomeKind::ClientError,
            500 => OutcomeKind::InternalError,
            _ => OutcomeKind::UpstreamError,
        };
        Self {
            status,
            kind,
            error_code: None,
        }
    }

    pub fn from_error(error: &GatewayError) -> Self {
        let kind = match error {
            GatewayError::MissingCredential(_) | GatewayError::InvalidCredential(_) => OutcomeKind::Unauthenticated,
            GatewayError::RateLimitExceeded { .. } => OutcomeKind::RateLimited,
            GatewayError::UpstreamUnavailable { .. } => OutcomeKind::UpstreamError,
            GatewayError::Internal(_) => OutcomeKind::InternalError,
            _ => OutcomeKind::ClientError,
        };
        Self {
            status: error.status_code(),
            kind,
            error_code: Some(error.code()),
        }
    }

    pub fn with_kind(mut self, kind: OutcomeKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Middleware trait for observing requests and their outcomes
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called once the route is resolved, before any gate runs
    async fn on_request(&self, _context: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// Called exactly once per request, when its outcome is final
    async fn on_response(&self, _context: &RequestContext, _outcome: &Outcome) -> Result<()> {
        Ok(())
    }

    /// Called before `on_response` when the request failed
    async fn on_error(&self, _context: &RequestContext, _error: &GatewayError) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub async fn on_request(&self, context: &RequestContext) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context).instrument(span).await?;
        }
        Ok(())
    }

    /// Runs in reverse order
    pub async fn on_response(&self, context: &RequestContext, outcome: &Outcome) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, outcome).instrument(span).await?;
        }
        Ok(())
    }

    pub async fn on_error(&self, context: &RequestContext, error: &GatewayError) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_error(context, error).instrument(span).await?;
        }
        Ok(())
    }

    /// Run the terminal hooks for one request. Hook failures are logged, never surfaced.
    pub async fn complete(&self, context: &RequestContext, outcome: &Outcome, error: Option<&GatewayError>) {
        if let Some(error) = error {
            if let Err(e) = self.on_error(context, error).await {
                debug!("Middleware on_error error: {}", e);
            }
        }
        if let Err(e) = self.on_response(context, outcome).await {
            debug!("Middleware on_response error: {}", e);
        }
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// One structured audit entry. Built only from already-redacted context data.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub route: String,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub outcome: &'static str,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    pub duration_ms: u64,
    pub client_key: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl AuditRecord {
    pub fn from_context(context: &RequestContext, outcome: &Outcome) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: context.request_id.clone(),
            trace_id: context.get_metadata("trace_id"),
            route: context.route.clone(),
            method: context.method.clone(),
            path: context.path.clone(),
            user_id: context.user_id(),
            outcome: outcome.kind.as_str(),
            status: outcome.status,
            error: outcome.error_code,
            duration_ms: context.elapsed_ms(),
            client_key: context.client_key.clone(),
            headers: context.request_headers.clone(),
            body: context.body(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Logs one audit record per request outcome under the `audit` target
pub struct AuditMiddleware;

#[async_trait::async_trait]
impl Middleware for AuditMiddleware {
    fn name(&self) -> &'static str {
        "AuditMiddleware"
    }

    async fn on_response(&self, context: &RequestContext, outcome: &Outcome) -> Result<()> {
        let record = AuditRecord::from_context(context, outcome);
        let headers = serde_json::to_string(&record.headers)?;
        let body = record.body.as_ref().map(Value::to_string).unwrap_or_default();
        let user_id = record.user_id.as_deref().unwrap_or("-");
        let trace_id = record.trace_id.as_deref().unwrap_or("-");
        let error = record.error.unwrap_or("-");

        if outcome.kind.is_success() {
            info!(
                target: "audit",
                request_id = %record.request_id,
                trace_id = %trace_id,
                route = %record.route,
                method = %record.method,
                user_id = %user_id,
                outcome = record.outcome,
                status = record.status,
                duration_ms = record.duration_ms,
                client_key = %record.client_key,
                headers = %headers,
                body = %body,
                "request completed"
            );
        } else {
            warn!(
                target: "audit",
                request_id = %record.request_id,
                trace_id = %trace_id,
                route = %record.route,
                method = %record.method,
                user_id = %user_id,
                outcome = record.outcome,
                status = record.status,
                error = %error,
                duration_ms = record.duration_ms,
                client_key = %record.client_key,
                headers = %headers,
                body = %body,
                "request failed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redact::REDACTED;
    use serde_json::json;
    use std::io::Write;

    fn test_context() -> RequestContext {
        let req = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("authorization", "Bearer top-secret-token")
            .header("content-type", "application/json")
            .body(())
            .unwrap();
        RequestContext::from_request(&req, "chat", "127.0.0.1")
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_context_metadata() {
        let context = test_context();
        context.set_metadata("key1", "value1".to_string());
        assert_eq!(context.get_metadata("key1"), Some("value1".to_string()));
        assert_eq!(context.get_metadata("key2"), None);
    }

    #[test]
    fn test_context_redacts_on_construction() {
        let context = test_context();
        assert_eq!(context.request_headers["authorization"], REDACTED);

        context.set_body(&json!({"username": "bob", "password": "hunter2"}));
        let body = context.body().unwrap();
        assert_eq!(body["password"], REDACTED);
        assert_eq!(body["username"], "bob");
    }

    #[test]
    fn test_request_id_is_propagated_or_generated() {
        let req = Request::builder()
            .uri("/api/health")
            .header("x-request-id", "req-123")
            .body(())
            .unwrap();
        assert_eq!(RequestContext::from_request(&req, "health", "anonymous").request_id, "req-123");

        let generated = test_context().request_id;
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(Outcome::from_status(200).kind, OutcomeKind::Success);
        assert_eq!(Outcome::from_status(404).kind, OutcomeKind::ClientError);
        assert_eq!(Outcome::from_status(429).kind, OutcomeKind::RateLimited);
        assert_eq!(
            Outcome::from_error(&GatewayError::InvalidCredential("expired".into())).kind,
            OutcomeKind::Unauthenticated
        );
        assert_eq!(
            Outcome::from_error(&GatewayError::upstream_timeout("ai")).kind,
            OutcomeKind::UpstreamError
        );
    }

    #[tokio::test]
    async fn test_middleware_chain() {
        let chain = MiddlewareChain::default().add(AuditMiddleware);
        let context = test_context();

        assert!(chain.on_request(&context).await.is_ok());
        assert!(chain.on_response(&context, &Outcome::from_status(200)).await.is_ok());
    }

    #[test]
    fn test_audit_record_never_contains_secrets() {
        let context = test_context();
        context.set_user_id("u-42");
        context.set_body(&json!({"message": "my diary", "password": "hunter2"}));

        let record = AuditRecord::from_context(&context, &Outcome::from_status(200));
        let text = record.to_json();

        assert!(!text.contains("top-secret-token"));
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("my diary"));
        assert!(text.contains("u-42"));
        assert_eq!(record.outcome, "success");
    }

    #[tokio::test]
    async fn test_audit_log_output_is_redacted() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let context = test_context();
        context.set_body(&json!({"password": "hunter2", "conversation_id": "c-9"}));
        AuditMiddleware
            .on_response(&context, &Outcome::from_status(200))
            .await
            .unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("request completed"));
        assert!(output.contains("c-9"));
        assert!(!output.contains("top-secret-token"));
        assert!(!output.contains("hunter2"));
    }
}
