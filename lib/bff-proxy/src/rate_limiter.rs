//! Fixed-window rate limiting keyed by client address
//!
//! Every client key owns one window: a start instant and a counter. The first
//! request after a window expires starts a new one. Rejected requests are
//! counted too, so hammering a limited client never earns extra budget.
//! Expired windows are swept by a background task so idle clients do not
//! accumulate in the map.

use bff_core::{GatewayError, RateLimitConfig};
use dashmap::DashMap;
use hyper::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Key used when the client address cannot be determined
pub const ANONYMOUS_CLIENT: &str = "anonymous";

struct RateLimitWindow {
    count: u32,
    window_start: Instant,
}

/// Result of counting one request against its client's window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Convert a rejection into the error reported to the client
    pub fn into_result(self) -> bff_core::Result<u32> {
        match self {
            Self::Allowed { remaining } => Ok(remaining),
            Self::Rejected { retry_after } => Err(GatewayError::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs_f64().ceil().max(1.0) as u64,
            }),
        }
    }
}

pub struct FixedWindowRateLimiter {
    windows: Arc<DashMap<String, RateLimitWindow>>,
    window: Duration,
    max_requests: u32,
}

impl FixedWindowRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        info!(
            window_secs = config.window.as_secs(),
            max_requests = config.max_requests,
            trust_forwarded_for = config.trust_forwarded_for,
            "Fixed-window rate limiter configured"
        );

        Self {
            windows: Arc::new(DashMap::new()),
            window: config.window,
            max_requests: config.max_requests,
        }
    }

    /// Count one request for `key` and decide whether it may proceed.
    ///
    /// The entry guard holds the shard lock for the whole read-modify-write,
    /// so concurrent requests for the same key are serialized.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| RateLimitWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);

        if entry.count > self.max_requests {
            let retry_after = self.window.saturating_sub(now.duration_since(entry.window_start));
            debug!(client = %key, count = entry.count, "Rate limit exceeded");
            RateLimitDecision::Rejected { retry_after }
        } else {
            RateLimitDecision::Allowed {
                remaining: self.max_requests - entry.count,
            }
        }
    }

    /// Remove windows that have expired. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.window_start) < self.window);
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(
                removed,
                remaining = self.windows.len(),
                "Purged expired rate limit windows"
            );
        }
        removed
    }

    /// Number of clients with a live or not-yet-purged window
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Spawn a task that purges expired windows once per window length.
    /// The task ends when the returned handle is aborted or the runtime stops.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.window);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.purge_expired();
            }
        })
    }
}

/// Resolve the key a request is counted under.
///
/// `X-Forwarded-For` is only honoured when the gateway runs behind a trusted
/// proxy; otherwise any client could pick its own key.
pub fn client_key(peer: Option<SocketAddr>, headers: &HeaderMap, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string())
}
