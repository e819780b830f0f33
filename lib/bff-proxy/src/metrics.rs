//! Prometheus metrics for gateway traffic

use crate::middleware::{Middleware, Outcome, RequestContext};
use anyhow::Result;
use bff_core::GatewayError;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector. Clones share the same registry.
#[derive(Clone)]
pub struct MetricsCollector {
    /// Requests by route and outcome
    pub requests_total: CounterVec,
    /// Request latency by route, in seconds
    pub request_duration_seconds: HistogramVec,
    /// Requests rejected by the rate limiter
    pub rate_limited_total: CounterVec,
    /// Failed upstream calls by backend
    pub upstream_errors_total: CounterVec,
    /// SSE relays currently open
    pub active_streams: IntGauge,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new("bff_requests_total", "Total gateway requests by route and outcome"),
            &["route", "outcome"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("bff_request_duration_seconds", "Gateway request latency in seconds"),
            &["route"],
        )?;

        let rate_limited_total = CounterVec::new(
            Opts::new("bff_rate_limited_total", "Requests rejected by the rate limiter"),
            &["route"],
        )?;

        let upstream_errors_total = CounterVec::new(
            Opts::new("bff_upstream_errors_total", "Failed calls to backend services"),
            &["service", "status"],
        )?;

        let active_streams = IntGauge::new("bff_active_streams", "Open SSE relay sessions")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(upstream_errors_total.clone()))?;
        registry.register(Box::new(active_streams.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            rate_limited_total,
            upstream_errors_total,
            active_streams,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Records per-request counters and latency
pub struct MetricsMiddleware {
    pub collector: MetricsCollector,
}

impl MetricsMiddleware {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_response(&self, context: &RequestContext, outcome: &Outcome) -> Result<()> {
        self.collector
            .requests_total
            .with_label_values(&[context.route.as_str(), outcome.kind.as_str()])
            .inc();
        self.collector
            .request_duration_seconds
            .with_label_values(&[context.route.as_str()])
            .observe(context.started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn on_error(&self, context: &RequestContext, error: &GatewayError) -> Result<()> {
        match error {
            GatewayError::RateLimitExceeded { .. } => {
                self.collector.rate_limited_total.with_label_values(&[context.route.as_str()]).inc();
            }
            GatewayError::UpstreamUnavailable { service, status, .. } => {
                self.collector
                    .upstream_errors_total
                    .with_label_values(&[service.as_str(), status.to_string().as_str()])
                    .inc();
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn test_context() -> RequestContext {
        let req = Request::builder().uri("/api/chat").body(()).unwrap();
        RequestContext::from_request(&req, "chat", "127.0.0.1")
    }

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        let metrics = collector.gather().expect("Failed to gather metrics");
        assert!(metrics.contains("bff_active_streams"));
    }

    #[tokio::test]
    async fn test_on_response_counts_by_route_and_outcome() {
        let middleware = MetricsMiddleware::new(MetricsCollector::new().unwrap());
        let context = test_context();

        middleware.on_response(&context, &Outcome::from_status(200)).await.unwrap();

        let metrics = middleware.collector.gather().unwrap();
        assert!(metrics.contains(r#"bff_requests_total{outcome="success",route="chat"} 1"#));
        assert!(metrics.contains("bff_request_duration_seconds"));
    }

    #[tokio::test]
    async fn test_on_error_counts_rejections_and_upstream_failures() {
        let middleware = MetricsMiddleware::new(MetricsCollector::new().unwrap());
        let context = test_context();

        middleware
            .on_error(&context, &GatewayError::RateLimitExceeded { retry_after_secs: 1 })
            .await
            .unwrap();
        middleware
            .on_error(&context, &GatewayError::upstream_timeout("ai"))
            .await
            .unwrap();

        let metrics = middleware.collector.gather().unwrap();
        assert!(metrics.contains(r#"bff_rate_limited_total{route="chat"} 1"#));
        assert!(metrics.contains(r#"bff_upstream_errors_total{service="ai",status="504"} 1"#));
    }
}
