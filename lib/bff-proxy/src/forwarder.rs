//! Outbound calls to backend services
//!
//! Requests are rebuilt from scratch rather than passed through: only a small
//! whitelist of client headers survives, and the gateway injects identity and
//! trace headers itself. Credentials, cookies and hop-by-hop headers never
//! reach a backend.

use crate::http::{full, BoxError, GatewayBody};
use bff_core::{BackendService, GatewayError, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// Client headers that may be forwarded upstream
const FORWARDED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    header::USER_AGENT,
];

pub const USER_ID_HEADER: &str = "x-user-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Longest backend error body kept for logs
const LOGGED_BODY_LIMIT: usize = 512;

pub type UpstreamStream = BoxStream<'static, std::result::Result<Bytes, BoxError>>;

pub enum ProxyBody {
    Empty,
    Json(Value),
    Multipart(reqwest::multipart::Form),
}

/// One outbound call, built per inbound request
pub struct ProxyRequest {
    pub service: BackendService,
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: ProxyBody,
    pub timeout: Duration,
}

impl ProxyRequest {
    pub fn new(service: BackendService, method: Method, url: String, timeout: Duration) -> Self {
        Self {
            service,
            method,
            url,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: ProxyBody::Empty,
            timeout,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn body(mut self, body: ProxyBody) -> Self {
        self.body = body;
        self
    }
}

/// Backend reply relayed to the client unchanged
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl BufferedResponse {
    pub fn into_response(self) -> Response<GatewayBody> {
        let mut response = Response::new(full(self.body));
        *response.status_mut() = self.status;
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        response
    }
}

pub struct RequestForwarder {
    client: reqwest::Client,
}

impl RequestForwarder {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Copy whitelisted client headers and add the gateway's own
    pub fn forwarded_headers(inbound: &HeaderMap, injected: &[(&'static str, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for name in FORWARDED_HEADERS.iter() {
            if let Some(value) = inbound.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        for &(name, ref value) in injected {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(HeaderName::from_static(name), value);
                }
                Err(_) => debug!(header = name, "Skipping unrepresentable header value"),
            }
        }
        headers
    }

    fn build(&self, request: ProxyRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        match request.body {
            ProxyBody::Empty => builder,
            ProxyBody::Json(value) => builder.json(&value),
            ProxyBody::Multipart(form) => builder.multipart(form),
        }
    }

    /// The request URL carries user query text, so it never reaches a log line or an error detail.
    fn send_error(service: BackendService, e: reqwest::Error) -> GatewayError {
        let e = e.without_url();
        if e.is_timeout() {
            GatewayError::upstream_timeout(service.name())
        } else {
            warn!(service = %service, error = %e, "Backend request error");
            GatewayError::upstream_unreachable(service.name(), e.to_string())
        }
    }

    /// Send and fully read the reply. The timeout covers both.
    ///
    /// Backend 2xx-4xx replies are returned as-is. A 5xx becomes
    /// `UpstreamUnavailable` with the backend's status; its body is only logged.
    pub async fn forward(&self, request: ProxyRequest) -> Result<BufferedResponse> {
        let service = request.service;
        let deadline = request.timeout;
        debug!(service = %service, method = %request.method, "Forwarding request");

        let call = async {
            let response = self
                .build(request)
                .send()
                .await
                .map_err(|e| Self::send_error(service, e))?;
            let status = response.status();
            let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
            let body = response.bytes().await.map_err(|e| {
                warn!(service = %service, error = %e.without_url(), "Unreadable backend response");
                GatewayError::upstream_unreachable(service.name(), "unreadable response body")
            })?;
            Ok::<_, GatewayError>(BufferedResponse {
                status,
                content_type,
                body,
            })
        };

        let response = match tokio_timeout(deadline, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(service = %service, timeout_ms = deadline.as_millis() as u64, "Backend request timeout");
                return Err(GatewayError::upstream_timeout(service.name()));
            }
        };

        if response.status.is_server_error() {
            let detail = Self::truncated(&response.body);
            warn!(
                service = %service,
                status = response.status.as_u16(),
                body = %detail,
                "Backend returned server error"
            );
            return Err(GatewayError::upstream_status(service.name(), response.status.as_u16(), detail));
        }

        debug!(service = %service, status = response.status.as_u16(), bytes = response.body.len(), "Backend responded");
        Ok(response)
    }

    /// Open a streaming GET. Only a 2xx reply yields a byte stream.
    pub async fn open_stream(&self, request: ProxyRequest) -> Result<UpstreamStream> {
        let service = request.service;
        let response = self
            .build(request)
            .send()
            .await
            .map_err(|e| Self::send_error(service, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(service = %service, status = status.as_u16(), "Backend refused stream");
            return Err(GatewayError::upstream_status(service.name(), status.as_u16(), "stream refused"));
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| Box::new(e.without_url()) as BoxError)
            .boxed())
    }

    fn truncated(body: &[u8]) -> String {
        let text = String::from_utf8_lossy(body);
        text.chars().take(LOGGED_BODY_LIMIT).collect()
    }
}
