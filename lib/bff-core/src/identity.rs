//! Caller identity resolved from a bearer token
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity returned by the auth service's verification endpoint.
///
/// Attached to a single request and never persisted by the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "roles_or_null")]
    pub roles: BTreeSet<String>,
}

fn roles_or_null<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let roles: Option<BTreeSet<String>> = Option::deserialize(deserializer)?;
    Ok(roles.unwrap_or_default())
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: String::new(),
            email: None,
            roles: BTreeSet::new(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}
