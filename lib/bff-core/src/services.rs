//! Directory of the backend services the gateway fronts

use crate::{GatewayConfig, GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Backend dependency of the gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendService {
    Auth,
    Ai,
    Document,
}

impl BackendService {
    pub const ALL: [BackendService; 3] = [Self::Auth, Self::Ai, Self::Document];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Ai => "ai",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for BackendService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Information about a registered backend
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceInfo {
    pub service: BackendService,
    pub base_url: String,
    pub health_path: String,
}

impl ServiceInfo {
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, self.health_path)
    }
}

/// ServiceDirectory maps each backend to its base URL. Built once at startup.
#[derive(Clone, Debug, Default)]
pub struct ServiceDirectory {
    services: BTreeMap<BackendService, ServiceInfo>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut directory = Self::new();
        directory.register(BackendService::Auth, &config.auth_service_url);
        directory.register(BackendService::Ai, &config.ai_service_url);
        directory.register(BackendService::Document, &config.document_service_url);
        directory
    }

    /// Register or replace a backend. Trailing slashes are stripped from the base URL.
    pub fn register(&mut self, service: BackendService, base_url: &str) {
        let base_url = base_url.trim_end_matches('/').to_string();
        debug!(service = %service, "Registered backend service");
        self.services.insert(
            service,
            ServiceInfo {
                service,
                base_url,
                health_path: "/health".to_string(),
            },
        );
    }

    pub fn get(&self, service: BackendService) -> Result<&ServiceInfo> {
        self.services
            .get(&service)
            .ok_or_else(|| GatewayError::Internal(format!("backend '{}' is not configured", service)))
    }

    /// Absolute URL for `path` on the given backend
    pub fn url(&self, service: BackendService, path: &str) -> Result<String> {
        Ok(format!("{}{}", self.get(service)?.base_url, path))
    }

    /// `(name, health URL)` pairs for every registered backend, in stable order
    pub fn health_targets(&self) -> Vec<(String, String)> {
        self.services
            .values()
            .map(|info| (info.service.name().to_string(), info.health_url()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_registers_all_backends() {
        let directory = ServiceDirectory::from_config(&GatewayConfig::default());
        assert_eq!(directory.len(), BackendService::ALL.len());
        assert_eq!(
            directory.url(BackendService::Ai, "/chat").unwrap(),
            "http://ai-service:8000/chat"
        );
    }

    #[test]
    fn test_trailing_slash_is_stripped() {
        let mut directory = ServiceDirectory::new();
        directory.register(BackendService::Document, "http://docs:8001/");
        assert_eq!(
            directory.url(BackendService::Document, "/documents/upload").unwrap(),
            "http://docs:8001/documents/upload"
        );
    }

    #[test]
    fn test_missing_backend_is_internal_error() {
        let directory = ServiceDirectory::new();
        assert!(matches!(
            directory.get(BackendService::Auth),
            Err(GatewayError::Internal(_))
        ));
    }

    #[test]
    fn test_health_targets_are_ordered() {
        let directory = ServiceDirectory::from_config(&GatewayConfig::default());
        let names: Vec<String> = directory.health_targets().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["auth", "ai", "document"]);
    }
}
