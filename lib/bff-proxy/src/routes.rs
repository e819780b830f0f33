//! Route table: every gateway route declares its gates and transport mode up front

use crate::validation::{chat_request_schema, chat_stream_query_schema, Schema};
use bff_core::{BackendService, GatewayError, Result};
use hyper::Method;
use tracing::debug;

/// How a route's input is checked before any backend call
#[derive(Debug, Clone)]
pub enum Validation {
    None,
    JsonBody(Schema),
    Query(Schema),
    /// Upload policy applied while reading the multipart body
    Multipart,
}

/// Where the verified `user_id` goes on a buffered upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPlacement {
    /// Added as a `user_id` field of the JSON body
    JsonField,
    /// Added as a `user_id` query parameter
    Query,
}

#[derive(Debug, Clone)]
pub enum TransportMode {
    /// Answered by the gateway from dependency health checks
    Health,
    /// Answered by the gateway from its metrics registry
    Metrics,
    Buffered {
        service: BackendService,
        method: Method,
        upstream_path: &'static str,
        identity: IdentityPlacement,
    },
    /// Server-sent events relayed from a backend GET
    Streaming {
        service: BackendService,
        upstream_path: &'static str,
    },
    /// Single-file multipart relay
    Upload {
        service: BackendService,
        upstream_path: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Route {
    pub name: &'static str,
    pub method: Method,
    pub path: &'static str,
    pub requires_auth: bool,
    pub rate_limited: bool,
    pub validation: Validation,
    pub mode: TransportMode,
}

impl Route {
    /// Route served by the gateway itself: no auth, no rate limit
    fn operational(name: &'static str, path: &'static str, mode: TransportMode) -> Self {
        Self {
            name,
            method: Method::GET,
            path,
            requires_auth: false,
            rate_limited: false,
            validation: Validation::None,
            mode,
        }
    }

    /// Authenticated, rate-limited user route
    fn user(name: &'static str, method: Method, path: &'static str, validation: Validation, mode: TransportMode) -> Self {
        Self {
            name,
            method,
            path,
            requires_auth: true,
            rate_limited: true,
            validation,
            mode,
        }
    }
}

pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// The gateway's public surface
    pub fn standard() -> Self {
        Self::new(vec![
            Route::operational("health", "/api/health", TransportMode::Health),
            Route::operational("metrics", "/metrics", TransportMode::Metrics),
            Route::user(
                "chat",
                Method::POST,
                "/api/chat",
                Validation::JsonBody(chat_request_schema()),
                TransportMode::Buffered {
                    service: BackendService::Ai,
                    method: Method::POST,
                    upstream_path: "/chat",
                    identity: IdentityPlacement::JsonField,
                },
            ),
            Route::user(
                "chat_stream",
                Method::GET,
                "/api/chat/stream",
                Validation::Query(chat_stream_query_schema()),
                TransportMode::Streaming {
                    service: BackendService::Ai,
                    upstream_path: "/stream",
                },
            ),
            Route::user(
                "document_upload",
                Method::POST,
                "/api/documents/upload",
                Validation::Multipart,
                TransportMode::Upload {
                    service: BackendService::Document,
                    upstream_path: "/documents/upload",
                },
            ),
            Route::user(
                "conversations",
                Method::GET,
                "/api/conversations",
                Validation::None,
                TransportMode::Buffered {
                    service: BackendService::Ai,
                    method: Method::GET,
                    upstream_path: "/conversations",
                    identity: IdentityPlacement::Query,
                },
            ),
        ])
    }

    /// Find the route for a request. A known path with the wrong method is 405, not 404.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<&Route> {
        let mut path_known = false;
        for route in &self.routes {
            if !Self::match_path(path, route.path) {
                continue;
            }
            path_known = true;
            if Self::match_method(method, &route.method) {
                debug!(route = route.name, "Matched route");
                return Ok(route);
            }
        }

        if path_known {
            Err(GatewayError::MethodNotAllowed(format!("{} {}", method, path)))
        } else {
            Err(GatewayError::NotFound(path.to_string()))
        }
    }

    /// Exact match, ignoring one trailing slash on the request path
    pub fn match_path(path: &str, pattern: &str) -> bool {
        if pattern == path {
            return true;
        }
        path.len() > 1 && path.strip_suffix('/') == Some(pattern)
    }

    pub fn match_method(method: &Method, allowed: &Method) -> bool {
        method == allowed
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_path_match() {
        assert!(RouteTable::match_path("/api/chat", "/api/chat"));
        assert!(RouteTable::match_path("/api/chat/", "/api/chat"));
        assert!(!RouteTable::match_path("/api/chat/stream", "/api/chat"));
        assert!(!RouteTable::match_path("/api/chatter", "/api/chat"));
    }

    #[test]
    fn test_method_match() {
        assert!(RouteTable::match_method(&Method::GET, &Method::GET));
        assert!(!RouteTable::match_method(&Method::HEAD, &Method::GET));
        assert!(!RouteTable::match_method(&Method::DELETE, &Method::POST));
    }

    #[test]
    fn test_resolve_standard_routes() {
        let table = RouteTable::standard();

        let chat = table.resolve(&Method::POST, "/api/chat").unwrap();
        assert_eq!(chat.name, "chat");
        assert!(chat.requires_auth && chat.rate_limited);
        assert!(matches!(chat.validation, Validation::JsonBody(_)));

        let stream = table.resolve(&Method::GET, "/api/chat/stream").unwrap();
        assert!(matches!(stream.mode, TransportMode::Streaming { service: BackendService::Ai, .. }));

        let upload = table.resolve(&Method::POST, "/api/documents/upload").unwrap();
        assert!(matches!(upload.mode, TransportMode::Upload { service: BackendService::Document, .. }));
    }

    #[test]
    fn test_operational_routes_skip_gates() {
        let table = RouteTable::standard();
        for path in ["/api/health", "/metrics"] {
            let route = table.resolve(&Method::GET, path).unwrap();
            assert!(!route.requires_auth);
            assert!(!route.rate_limited);
        }
    }

    #[test]
    fn test_unknown_path_and_wrong_method() {
        let table = RouteTable::standard();
        assert!(matches!(
            table.resolve(&Method::GET, "/api/nope"),
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            table.resolve(&Method::GET, "/api/chat"),
            Err(GatewayError::MethodNotAllowed(_))
        ));
    }

    #[test]
    fn test_every_user_route_is_gated() {
        let table = RouteTable::standard();
        for route in table.routes() {
            let operational = matches!(route.mode, TransportMode::Health | TransportMode::Metrics);
            assert_eq!(route.requires_auth, !operational, "{}", route.name);
            assert_eq!(route.rate_limited, !operational, "{}", route.name);
        }
    }
}
