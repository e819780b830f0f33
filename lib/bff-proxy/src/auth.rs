//! Bearer token verification against the external auth service

use bff_core::{GatewayError, Identity, Result};
use hyper::{header, HeaderMap};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const TOKEN_CACHE_CAPACITY: usize = 1024;

/// Pull the token out of `Authorization: Bearer <token>`.
/// The scheme is matched case-insensitively.
pub fn extract_bearer(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| GatewayError::MissingCredential("authorization header absent".to_string()))?
        .to_str()
        .map_err(|_| GatewayError::MissingCredential("authorization header is not ascii".to_string()))?;

    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| GatewayError::MissingCredential("authorization header malformed".to_string()))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(GatewayError::MissingCredential(format!("unsupported scheme '{}'", scheme)));
    }

    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(GatewayError::MissingCredential("bearer token empty or malformed".to_string()));
    }
    Ok(token.to_string())
}

/// Short-lived cache of successful verifications, keyed by token digest
struct TokenCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, (Identity, Instant)>>,
}

impl TokenCache {
    fn new(ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(TOKEN_CACHE_CAPACITY).expect("BUG: capacity is non-zero");
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn digest(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    fn get(&self, token: &str) -> Option<Identity> {
        let key = Self::digest(token);
        let mut entries = self.entries.lock().ok()?;
        let cached = entries
            .get(&key)
            .map(|(identity, stored)| (identity.clone(), stored.elapsed() < self.ttl));
        match cached {
            Some((identity, true)) => Some(identity),
            Some((_, false)) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, token: &str, identity: &Identity) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(Self::digest(token), (identity.clone(), Instant::now()));
        }
    }
}

pub struct AuthVerifier {
    client: reqwest::Client,
    verify_url: String,
    timeout: Duration,
    cache: Option<TokenCache>,
}

impl AuthVerifier {
    /// `cache_ttl` of zero disables caching: every request pays one round trip.
    pub fn new(client: reqwest::Client, verify_url: String, timeout: Duration, cache_ttl: Duration) -> Self {
        let cache = (!cache_ttl.is_zero()).then(|| TokenCache::new(cache_ttl));
        Self {
            client,
            verify_url,
            timeout,
            cache,
        }
    }

    pub fn caching_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Verify the request's bearer token and resolve the caller's identity
    pub async fn verify(&self, headers: &HeaderMap) -> Result<Identity> {
        let token = extract_bearer(headers)?;
        self.verify_token(&token).await
    }

    /// Any failure, including a timeout or unreachable auth service, is `InvalidCredential`.
    /// There is no retry.
    pub async fn verify_token(&self, token: &str) -> Result<Identity> {
        if let Some(identity) = self.cache.as_ref().and_then(|c| c.get(token)) {
            debug!(user_id = %identity.user_id, "Token verified from cache");
            return Ok(identity);
        }

        let request = self.client.get(&self.verify_url).bearer_auth(token).send();
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "Auth service request failed");
                return Err(GatewayError::InvalidCredential("auth service unreachable".to_string()));
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Auth service timed out");
                return Err(GatewayError::InvalidCredential("auth service timed out".to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Auth service rejected token");
            return Err(GatewayError::InvalidCredential(format!("auth service returned {}", status.as_u16())));
        }

        let identity: Identity = match tokio::time::timeout(self.timeout, response.json()).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                warn!(error = %e, "Auth service returned an unreadable identity");
                return Err(GatewayError::InvalidCredential("identity unreadable".to_string()));
            }
            Err(_) => return Err(GatewayError::InvalidCredential("auth service timed out".to_string())),
        };

        if identity.user_id.trim().is_empty() {
            return Err(GatewayError::InvalidCredential("identity has no user_id".to_string()));
        }

        if let Some(cache) = &self.cache {
            cache.insert(token, &identity);
        }
        Ok(identity)
    }
}
