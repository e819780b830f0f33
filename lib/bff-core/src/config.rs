//! Environment-driven gateway configuration
//!
//! Every option has a default suitable for local development. Invalid values
//! are logged and replaced by the default rather than aborting startup.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Fixed-window rate limiting settings
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Length of one counting window
    pub window: Duration,
    /// Requests allowed per client within one window
    pub max_requests: u32,
    /// Key clients by the first `X-Forwarded-For` entry instead of the peer address
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
            trust_forwarded_for: false,
        }
    }
}

/// Outbound call deadlines
#[derive(Clone, Debug, PartialEq)]
pub struct TimeoutConfig {
    /// Interactive buffered calls (chat, conversations)
    pub request: Duration,
    /// Document upload relay
    pub upload: Duration,
    /// Total lifetime of one streaming relay
    pub stream: Duration,
    /// Token verification round trip
    pub auth: Duration,
    /// Single dependency health check
    pub health_check: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            upload: Duration::from_secs(120),
            stream: Duration::from_secs(300),
            auth: Duration::from_secs(5),
            health_check: Duration::from_millis(3000),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayConfig {
    pub port: u16,
    pub auth_service_url: String,
    pub ai_service_url: String,
    pub document_service_url: String,
    pub rate_limit: RateLimitConfig,
    pub timeouts: TimeoutConfig,
    /// Zero disables the verified-token cache
    pub auth_cache_ttl: Duration,
    pub max_upload_bytes: usize,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_service_url: "http://auth-service:8003".to_string(),
            ai_service_url: "http://ai-service:8000".to_string(),
            document_service_url: "http://document-service:8001".to_string(),
            rate_limit: RateLimitConfig::default(),
            timeouts: TimeoutConfig::default(),
            auth_cache_ttl: Duration::ZERO,
            max_upload_bytes: 50 * 1024 * 1024,
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl GatewayConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let rate_defaults = &defaults.rate_limit;
        let timeout_defaults = &defaults.timeouts;

        let string = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or_default(&lookup, key, default.as_secs()))
        };

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or_else(|| defaults.cors_allowed_origins.clone());

        let max_requests = match parse_or_default(&lookup, "RATE_LIMIT_MAX_REQUESTS", rate_defaults.max_requests) {
            0 => {
                warn!(
                    env_var = "RATE_LIMIT_MAX_REQUESTS",
                    default = rate_defaults.max_requests,
                    "Zero is not a usable limit, using default"
                );
                rate_defaults.max_requests
            }
            n => n,
        };

        let window = match secs("RATE_LIMIT_WINDOW_SECS", rate_defaults.window) {
            d if d.is_zero() => rate_defaults.window,
            d => d,
        };

        Self {
            port: parse_or_default(&lookup, "PORT", defaults.port),
            auth_service_url: string("AUTH_SERVICE_URL", &defaults.auth_service_url),
            ai_service_url: string("AI_SERVICE_URL", &defaults.ai_service_url),
            document_service_url: string("DOCUMENT_SERVICE_URL", &defaults.document_service_url),
            rate_limit: RateLimitConfig {
                window,
                max_requests,
                trust_forwarded_for: parse_or_default(
                    &lookup,
                    "RATE_LIMIT_TRUST_FORWARDED_FOR",
                    rate_defaults.trust_forwarded_for,
                ),
            },
            timeouts: TimeoutConfig {
                request: secs("REQUEST_TIMEOUT_SECS", timeout_defaults.request),
                upload: secs("UPLOAD_TIMEOUT_SECS", timeout_defaults.upload),
                stream: secs("STREAM_TIMEOUT_SECS", timeout_defaults.stream),
                auth: secs("AUTH_TIMEOUT_SECS", timeout_defaults.auth),
                health_check: Duration::from_millis(parse_or_default(
                    &lookup,
                    "HEALTH_CHECK_TIMEOUT_MS",
                    timeout_defaults.health_check.as_millis() as u64,
                )),
            },
            auth_cache_ttl: secs("AUTH_CACHE_TTL_SECS", defaults.auth_cache_ttl),
            max_upload_bytes: parse_or_default(&lookup, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            cors_allowed_origins,
        }
    }
}

fn parse_or_default<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    env_var = key,
                    value = %raw,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = GatewayConfig::from_lookup(|_| None);
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.max_upload_bytes, 52_428_800);
        assert!(config.auth_cache_ttl.is_zero());
    }

    #[test]
    fn test_overrides() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("PORT", "9000"),
            ("AI_SERVICE_URL", "http://localhost:8000"),
            ("RATE_LIMIT_WINDOW_SECS", "10"),
            ("RATE_LIMIT_MAX_REQUESTS", "5"),
            ("RATE_LIMIT_TRUST_FORWARDED_FOR", "true"),
            ("UPLOAD_TIMEOUT_SECS", "600"),
            ("HEALTH_CHECK_TIMEOUT_MS", "250"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
        ]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.ai_service_url, "http://localhost:8000");
        assert_eq!(config.rate_limit.window, Duration::from_secs(10));
        assert_eq!(config.rate_limit.max_requests, 5);
        assert!(config.rate_limit.trust_forwarded_for);
        assert_eq!(config.timeouts.upload, Duration::from_secs(600));
        assert_eq!(config.timeouts.health_check, Duration::from_millis(250));
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("PORT", "not-a-port"),
            ("RATE_LIMIT_MAX_REQUESTS", "0"),
            ("RATE_LIMIT_WINDOW_SECS", "0"),
            ("AUTH_SERVICE_URL", "   "),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.auth_service_url, "http://auth-service:8003");
    }
}
