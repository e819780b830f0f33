//! W3C trace context propagation toward backend services

use crate::middleware::{Middleware, RequestContext};
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::debug;

/// Assigns every request a trace id, reusing the client's `traceparent` when valid
pub struct TraceContextMiddleware {
    pub service_name: String,
}

impl TraceContextMiddleware {
    pub fn new() -> Self {
        Self {
            service_name: "bff-gateway".to_string(),
        }
    }

    pub fn with_service_name(service_name: String) -> Self {
        Self { service_name }
    }

    /// Extract W3C Trace Context from request headers.
    /// Returns (trace_id, span_id, trace_flags) if present and well formed.
    pub fn extract_w3c_trace_context(headers: &BTreeMap<String, String>) -> Option<(String, String, String)> {
        // version-trace_id-span_id-trace_flags
        headers.get("traceparent").and_then(|v| {
            let parts: Vec<&str> = v.trim().split('-').collect();
            if parts.len() != 4 {
                return None;
            }
            let hex = |s: &str, len: usize| s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit());
            if hex(parts[0], 2) && hex(parts[1], 32) && hex(parts[2], 16) && hex(parts[3], 2) {
                Some((parts[1].to_string(), parts[2].to_string(), parts[3].to_string()))
            } else {
                None
            }
        })
    }

    pub fn create_w3c_trace_context(trace_id: &str, span_id: &str, trace_flags: &str) -> String {
        format!("00-{}-{}-{}", trace_id, span_id, trace_flags)
    }

    /// Random 16 hex digit span id
    pub fn generate_span_id() -> String {
        format!("{:016x}", rand::random::<u64>())
    }

    /// Random 32 hex digit trace id
    pub fn generate_trace_id() -> String {
        format!("{:032x}", rand::random::<u128>())
    }
}

impl Default for TraceContextMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

/// `traceparent` value to send upstream for this request, with a fresh span id
pub fn outbound_traceparent(context: &RequestContext) -> Option<String> {
    let trace_id = context.get_metadata("trace_id")?;
    let flags = context.get_metadata("trace_flags").unwrap_or_else(|| "01".to_string());
    Some(TraceContextMiddleware::create_w3c_trace_context(
        &trace_id,
        &TraceContextMiddleware::generate_span_id(),
        &flags,
    ))
}

#[async_trait::async_trait]
impl Middleware for TraceContextMiddleware {
    fn name(&self) -> &'static str {
        "TraceContextMiddleware"
    }

    async fn on_request(&self, context: &RequestContext) -> Result<()> {
        let (trace_id, parent_span_id, flags) =
            match Self::extract_w3c_trace_context(&context.request_headers) {
                Some(ctx) => ctx,
                None => (Self::generate_trace_id(), Self::generate_span_id(), "01".to_string()),
            };

        context.set_metadata("trace_id", trace_id.clone());
        context.set_metadata("parent_span_id", parent_span_id);
        context.set_metadata("trace_flags", flags);

        debug!(
            service = %self.service_name,
            trace_id = %trace_id,
            request_id = %context.request_id,
            method = %context.method,
            path = %context.path,
            "Request started"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn context_with(traceparent: Option<&str>) -> RequestContext {
        let mut builder = Request::builder().uri("/api/chat");
        if let Some(tp) = traceparent {
            builder = builder.header("traceparent", tp);
        }
        RequestContext::from_request(&builder.body(()).unwrap(), "chat", "anonymous")
    }

    #[test]
    fn test_extract_w3c_trace_context_valid() {
        let mut headers = BTreeMap::new();
        headers.insert("traceparent".to_string(), TRACEPARENT.to_string());

        let (trace_id, span_id, flags) = TraceContextMiddleware::extract_w3c_trace_context(&headers).unwrap();
        assert_eq!(trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(span_id, "b7ad6b7169203331");
        assert_eq!(flags, "01");
    }

    #[test]
    fn test_extract_w3c_trace_context_invalid() {
        let mut headers = BTreeMap::new();
        headers.insert("traceparent".to_string(), "invalid-format".to_string());
        assert!(TraceContextMiddleware::extract_w3c_trace_context(&headers).is_none());

        headers.insert("traceparent".to_string(), "00-short-b7ad6b7169203331-01".to_string());
        assert!(TraceContextMiddleware::extract_w3c_trace_context(&headers).is_none());
    }

    #[test]
    fn test_generated_ids_are_hex() {
        let span_id = TraceContextMiddleware::generate_span_id();
        let trace_id = TraceContextMiddleware::generate_trace_id();
        assert_eq!(span_id.len(), 16);
        assert_eq!(trace_id.len(), 32);
        assert!(u64::from_str_radix(&span_id, 16).is_ok());
        assert!(u128::from_str_radix(&trace_id, 16).is_ok());
    }

    #[tokio::test]
    async fn test_on_request_reuses_client_trace() {
        let context = context_with(Some(TRACEPARENT));
        TraceContextMiddleware::new().on_request(&context).await.unwrap();

        assert_eq!(
            context.get_metadata("trace_id"),
            Some("0af7651916cd43dd8448eb211c80319c".to_string())
        );
        let outbound = outbound_traceparent(&context).unwrap();
        assert!(outbound.starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
        assert!(outbound.ends_with("-01"));
        assert_ne!(outbound, TRACEPARENT);
    }

    #[tokio::test]
    async fn test_on_request_starts_new_trace() {
        let context = context_with(None);
        assert!(outbound_traceparent(&context).is_none());

        TraceContextMiddleware::default().on_request(&context).await.unwrap();
        assert_eq!(context.get_metadata("trace_id").map(|t| t.len()), Some(32));
    }
}
