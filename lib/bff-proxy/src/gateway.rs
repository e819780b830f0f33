//! Request pipeline
//!
//! Every request runs the same fixed sequence: resolve route, rate limit,
//! authenticate, validate, dispatch by transport mode. Gates that reject a
//! request do so before any backend is contacted. The middleware chain sees
//! exactly one terminal outcome per request; for streams that happens when
//! the relay ends, not when the headers go out.

use crate::auth::AuthVerifier;
use crate::forwarder::{
    ProxyBody, ProxyRequest, RequestForwarder, REQUEST_ID_HEADER, TRACEPARENT_HEADER, USER_ID_HEADER,
};
use crate::health_check::HealthAggregator;
use crate::http::{error_response, json_response, sse_response, text_response, BoxError, GatewayBody};
use crate::metrics::{MetricsCollector, MetricsMiddleware};
use crate::middleware::{AuditMiddleware, MiddlewareChain, Outcome, OutcomeKind, RequestContext};
use crate::rate_limiter::{client_key, FixedWindowRateLimiter};
use crate::routes::{IdentityPlacement, Route, RouteTable, TransportMode, Validation};
use crate::stream::{channel_body, StreamEnd, StreamRelay, STREAM_CHANNEL_CAPACITY};
use crate::trace_context::{outbound_traceparent, TraceContextMiddleware};
use crate::upload::{read_single_file, UploadPolicy};
use crate::validation::parse_query;
use bff_core::{BackendService, GatewayConfig, GatewayError, Identity, Result, ServiceDirectory};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, BodyStream, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Largest JSON request body accepted
pub const MAX_JSON_BODY_BYTES: usize = 64 * 1024;

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

enum Reply {
    /// Outcome is final when the response is returned
    Finished(Response<GatewayBody>),
    /// A relay task owns the outcome and reports it when the stream ends
    Streaming(Response<GatewayBody>),
}

pub struct Gateway {
    config: GatewayConfig,
    routes: RouteTable,
    directory: ServiceDirectory,
    rate_limiter: Arc<FixedWindowRateLimiter>,
    auth: AuthVerifier,
    forwarder: RequestForwarder,
    health: HealthAggregator,
    metrics: MetricsCollector,
    chain: MiddlewareChain,
    upload_policy: UploadPolicy,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let directory = ServiceDirectory::from_config(&config);
        Self::with_directory(config, directory)
    }

    /// Build a gateway against an explicit set of backends
    pub fn with_directory(config: GatewayConfig, directory: ServiceDirectory) -> anyhow::Result<Self> {
        // No overall timeout on the client: each call applies its own, and streams outlive any request timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeouts.request)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let verify_url = directory.url(BackendService::Auth, "/verify")?;
        let auth = AuthVerifier::new(client.clone(), verify_url, config.timeouts.auth, config.auth_cache_ttl);
        let health = HealthAggregator::new(client.clone(), directory.health_targets(), config.timeouts.health_check);

        let metrics = MetricsCollector::new()?;
        let chain = MiddlewareChain::new()
            .add(TraceContextMiddleware::new())
            .add(MetricsMiddleware::new(metrics.clone()))
            .add(AuditMiddleware);

        info!(
            backends = directory.len(),
            auth_cache = auth.caching_enabled(),
            max_upload_bytes = config.max_upload_bytes,
            "Gateway initialized"
        );

        Ok(Self {
            routes: RouteTable::standard(),
            rate_limiter: Arc::new(FixedWindowRateLimiter::new(&config.rate_limit)),
            auth,
            forwarder: RequestForwarder::new(client),
            health,
            metrics,
            chain,
            upload_policy: UploadPolicy::new(config.max_upload_bytes),
            directory,
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &Arc<FixedWindowRateLimiter> {
        &self.rate_limiter
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Handle one inbound request. Never fails: every error becomes a JSON error response.
    pub async fn handle<B>(self: Arc<Self>, req: Request<B>, peer: Option<SocketAddr>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send + Sync + 'static,
    {
        let key = client_key(peer, req.headers(), self.config.rate_limit.trust_forwarded_for);

        let resolved = self.routes.resolve(req.method(), req.uri().path());
        let route_name = resolved.as_ref().map_or("unmatched", |route| route.name);

        // Unmatched requests still get trace context for their audit record
        let context = RequestContext::from_request(&req, route_name, &key);
        if let Err(e) = self.chain.on_request(&context).await {
            debug!("Middleware on_request error: {}", e);
        }

        let route = match resolved {
            Ok(route) => route,
            Err(e) => return self.reject(&context, e).await,
        };

        match self.process(route, &context, req).await {
            Ok(Reply::Finished(response)) => {
                let outcome = Outcome::from_status(response.status().as_u16());
                self.chain.complete(&context, &outcome, None).await;
                response
            }
            Ok(Reply::Streaming(response)) => response,
            Err(e) => self.reject(&context, e).await,
        }
    }

    async fn reject(&self, context: &RequestContext, e: GatewayError) -> Response<GatewayBody> {
        if let GatewayError::Internal(detail) = &e {
            error!(request_id = %context.request_id, detail = %detail, "Internal gateway error");
        }
        self.chain.complete(context, &Outcome::from_error(&e), Some(&e)).await;
        error_response(&e)
    }

    async fn process<B>(self: &Arc<Self>, route: &Route, context: &RequestContext, req: Request<B>) -> Result<Reply>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send + Sync + 'static,
    {
        if route.rate_limited {
            self.rate_limiter.check(&context.client_key).into_result()?;
        }

        let identity = if route.requires_auth {
            let identity = self.auth.verify(req.headers()).await?;
            context.set_user_id(&identity.user_id);
            Some(identity)
        } else {
            None
        };

        match &route.mode {
            TransportMode::Health => Ok(Reply::Finished(self.health_response().await?)),
            TransportMode::Metrics => {
                let body = self
                    .metrics
                    .gather()
                    .map_err(|e| GatewayError::Internal(format!("metrics encoding failed: {}", e)))?;
                Ok(Reply::Finished(text_response(StatusCode::OK, METRICS_CONTENT_TYPE, body)))
            }
            TransportMode::Buffered {
                service,
                method,
                upstream_path,
                identity: placement,
            } => {
                let identity = Self::require_identity(identity)?;
                let response = self
                    .proxy_buffered(route, context, req, &identity, *service, method, upstream_path, *placement)
                    .await?;
                Ok(Reply::Finished(response))
            }
            TransportMode::Streaming { service, upstream_path } => {
                let identity = Self::require_identity(identity)?;
                self.proxy_stream(route, context, req, &identity, *service, upstream_path)
            }
            TransportMode::Upload { service, upstream_path } => {
                let identity = Self::require_identity(identity)?;
                let response = self
                    .proxy_upload(context, req, &identity, *service, upstream_path)
                    .await?;
                Ok(Reply::Finished(response))
            }
        }
    }

    fn require_identity(identity: Option<Identity>) -> Result<Identity> {
        identity.ok_or_else(|| GatewayError::Internal("proxy route resolved without identity".to_string()))
    }

    async fn health_response(&self) -> Result<Response<GatewayBody>> {
        let report = self.health.check_all().await;
        let body = serde_json::to_value(&report)
            .map_err(|e| GatewayError::Internal(format!("health report encoding failed: {}", e)))?;
        Ok(json_response(StatusCode::OK, &body))
    }

    /// Whitelisted client headers plus request id, trace context and identity
    fn upstream_headers(&self, inbound: &HeaderMap, context: &RequestContext, identity: &Identity) -> HeaderMap {
        let mut injected = vec![(REQUEST_ID_HEADER, context.request_id.clone())];
        if let Some(traceparent) = outbound_traceparent(context) {
            injected.push((TRACEPARENT_HEADER, traceparent));
        }
        injected.push((USER_ID_HEADER, identity.user_id.clone()));
        RequestForwarder::forwarded_headers(inbound, &injected)
    }

    #[allow(clippy::too_many_arguments)]
    async fn proxy_buffered<B>(
        &self,
        route: &Route,
        context: &RequestContext,
        req: Request<B>,
        identity: &Identity,
        service: BackendService,
        method: &Method,
        upstream_path: &str,
        placement: IdentityPlacement,
    ) -> Result<Response<GatewayBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send + Sync + 'static,
    {
        let url = self.directory.url(service, upstream_path)?;
        let headers = self.upstream_headers(req.headers(), context, identity);
        let mut request =
            ProxyRequest::new(service, method.clone(), url, self.config.timeouts.request).headers(headers);

        match placement {
            IdentityPlacement::JsonField => {
                let mut body = read_json_body(req.into_body()).await?;
                context.set_body(&body);
                if let Validation::JsonBody(schema) = &route.validation {
                    schema.validate(&body)?;
                }
                if let Some(object) = body.as_object_mut() {
                    object.insert("user_id".to_string(), Value::String(identity.user_id.clone()));
                }
                request = request.body(ProxyBody::Json(body));
            }
            IdentityPlacement::Query => {
                request = request.query(vec![("user_id".to_string(), identity.user_id.clone())]);
            }
        }

        Ok(self.forwarder.forward(request).await?.into_response())
    }

    /// Validate, then hand the stream to a relay task and return SSE headers at once
    fn proxy_stream<B>(
        self: &Arc<Self>,
        route: &Route,
        context: &RequestContext,
        req: Request<B>,
        identity: &Identity,
        service: BackendService,
        upstream_path: &str,
    ) -> Result<Reply> {
        let query = match &route.validation {
            Validation::Query(schema) => schema.validate_query(&parse_query(req.uri().query()))?,
            _ => json!({}),
        };
        context.set_body(&query);

        let mut pairs: Vec<(String, String)> = query
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        pairs.push(("user_id".to_string(), identity.user_id.clone()));

        let mut headers = self.upstream_headers(req.headers(), context, identity);
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        let url = self.directory.url(service, upstream_path)?;
        let request = ProxyRequest::new(service, Method::GET, url, self.config.timeouts.stream)
            .headers(headers)
            .query(pairs);

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let gateway = Arc::clone(self);
        let context = context.clone();
        self.metrics.active_streams.inc();

        tokio::spawn(async move {
            let relay = StreamRelay::new(gateway.config.timeouts.stream);
            let end = relay.run(gateway.forwarder.open_stream(request), tx).await;
            gateway.metrics.active_streams.dec();

            let (outcome, error) = stream_outcome(end, service);
            debug!(request_id = %context.request_id, end = ?end, "Stream session ended");
            gateway.chain.complete(&context, &outcome, error.as_ref()).await;
        });

        Ok(Reply::Streaming(sse_response(channel_body(rx))))
    }

    async fn proxy_upload<B>(
        &self,
        context: &RequestContext,
        req: Request<B>,
        identity: &Identity,
        service: BackendService,
        upstream_path: &str,
    ) -> Result<Response<GatewayBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send + Sync + 'static,
    {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // reqwest writes its own multipart content type and boundary
        let mut headers = self.upstream_headers(req.headers(), context, identity);
        headers.remove(header::CONTENT_TYPE);

        let frames = BodyStream::new(req.into_body())
            .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())));
        let file = read_single_file(content_type.as_deref(), frames, &self.upload_policy).await?;

        context.set_body(&json!({
            "file_name": file.file_name,
            "content_type": file.content_type,
            "size": file.len(),
        }));
        debug!(request_id = %context.request_id, size = file.len(), "Upload accepted");

        let url = self.directory.url(service, upstream_path)?;
        let form = file.into_form(self.upload_policy.field_name)?;
        let request = ProxyRequest::new(service, Method::POST, url, self.config.timeouts.upload)
            .headers(headers)
            .body(ProxyBody::Multipart(form));

        Ok(self.forwarder.forward(request).await?.into_response())
    }
}

/// Read a size-capped JSON body
async fn read_json_body<B>(body: B) -> Result<Value>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send + Sync + 'static,
{
    let collected = Limited::new(body, MAX_JSON_BODY_BYTES).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            GatewayError::validation("body", format!("must be at most {} bytes", MAX_JSON_BODY_BYTES))
        } else {
            GatewayError::validation("body", "could not be read")
        }
    })?;
    serde_json::from_slice(&collected.to_bytes()).map_err(|_| GatewayError::validation("body", "must be valid JSON"))
}

/// Audit outcome for a finished relay. The client already saw 200 headers.
fn stream_outcome(end: StreamEnd, service: BackendService) -> (Outcome, Option<GatewayError>) {
    let ok = Outcome::from_status(200);
    let failed = |error: GatewayError| {
        let outcome = Outcome {
            status: 200,
            kind: OutcomeKind::UpstreamError,
            error_code: Some(error.code()),
        };
        (outcome, Some(error))
    };

    match end {
        StreamEnd::Completed | StreamEnd::Synthesized => (ok, None),
        StreamEnd::ClientDisconnected => (ok.with_kind(OutcomeKind::ClientClosed), None),
        StreamEnd::UpstreamError => failed(GatewayError::upstream_unreachable(service.name(), "stream failed")),
        StreamEnd::TimedOut => failed(GatewayError::upstream_timeout(service.name())),
    }
}
