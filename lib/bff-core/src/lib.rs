//! Core domain types for the BFF gateway
//!
//! This library provides:
//! - The resolved caller `Identity`
//! - The gateway error taxonomy and its HTTP mapping
//! - Environment-driven gateway configuration
//! - The directory of backend services the gateway fronts

pub mod config;
pub mod error;
pub mod identity;
pub mod services;

pub use config::{GatewayConfig, RateLimitConfig, TimeoutConfig};
pub use error::{GatewayError, Result};
pub use identity::Identity;
pub use services::{BackendService, ServiceDirectory, ServiceInfo};
