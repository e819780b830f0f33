//! Gateway components for the BFF
//!
//! - `auth`, `rate_limiter`, `validation`: the gates every user request passes
//! - `routes`, `forwarder`, `stream`, `upload`: proxying in buffered, SSE and multipart modes
//! - `health_check`: concurrent dependency health
//! - `middleware`, `redact`, `trace_context`, `metrics`: audit logging and observability
//! - `gateway`: the request pipeline tying them together

pub mod auth;
pub mod forwarder;
pub mod gateway;
pub mod health_check;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod redact;
pub mod routes;
pub mod stream;
pub mod trace_context;
pub mod upload;
pub mod validation;

pub use auth::AuthVerifier;
pub use forwarder::{ProxyRequest, RequestForwarder};
pub use gateway::Gateway;
pub use health_check::{HealthAggregator, HealthReport, HealthStatus};
pub use http::GatewayBody;
pub use metrics::MetricsCollector;
pub use middleware::{AuditMiddleware, Middleware, MiddlewareChain, RequestContext};
pub use rate_limiter::FixedWindowRateLimiter;
pub use routes::RouteTable;
pub use stream::StreamRelay;
