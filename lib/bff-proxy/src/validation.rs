//! Declarative schemas for request bodies and query strings
//!
//! Validation is fail-fast: the first violated constraint is reported and
//! nothing else is checked. Fields the schema does not declare are rejected
//! rather than silently dropped.

use bff_core::{GatewayError, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_CONTEXT_CHARS: usize = 5000;

static UUID_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Canonical 8-4-4-4-12 hex identifier, either case
pub fn uuid_pattern() -> &'static Regex {
    UUID_PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("BUG: uuid pattern is a valid regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    pattern: Option<(&'static Regex, &'static str)>,
}

impl FieldRule {
    pub fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
            min_len: None,
            max_len: None,
            pattern: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Bounds in characters, inclusive
    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_len = Some(min);
        self.max_len = Some(max);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_len = Some(max);
        self
    }

    /// `description` names the expected format in the error message
    pub fn pattern(mut self, regex: &'static Regex, description: &'static str) -> Self {
        self.pattern = Some((regex, description));
        self
    }

    fn check(&self, value: &Value) -> Result<()> {
        if !self.field_type.matches(value) {
            return Err(GatewayError::validation(
                self.name,
                format!("must be a {}", self.field_type.name()),
            ));
        }

        if let Value::String(s) = value {
            let len = s.chars().count();
            if let Some(min) = self.min_len {
                if len < min {
                    return Err(GatewayError::validation(
                        self.name,
                        format!("must be at least {} characters", min),
                    ));
                }
            }
            if let Some(max) = self.max_len {
                if len > max {
                    return Err(GatewayError::validation(
                        self.name,
                        format!("must be at most {} characters", max),
                    ));
                }
            }
            if let Some((regex, description)) = self.pattern {
                if !regex.is_match(s) {
                    return Err(GatewayError::validation(self.name, format!("must be a valid {}", description)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub name: &'static str,
    pub fields: Vec<FieldRule>,
}

impl Schema {
    pub fn new(name: &'static str, fields: Vec<FieldRule>) -> Self {
        Self { name, fields }
    }

    fn rule(&self, field: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|r| r.name == field)
    }

    /// Validate a JSON document. An explicit `null` on an optional field counts as absent.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let object = value
            .as_object()
            .ok_or_else(|| GatewayError::validation("body", "must be a JSON object"))?;

        if let Some(unknown) = object.keys().find(|k| self.rule(k).is_none()) {
            return Err(GatewayError::validation(unknown.as_str(), "unknown field"));
        }

        for rule in &self.fields {
            match object.get(rule.name) {
                None | Some(Value::Null) if rule.required => {
                    return Err(GatewayError::validation(rule.name, "is required"));
                }
                None | Some(Value::Null) => {}
                Some(v) => rule.check(v)?,
            }
        }
        Ok(())
    }

    /// Validate decoded query pairs. Returns them as a JSON object of strings.
    /// A repeated parameter is rejected.
    pub fn validate_query(&self, pairs: &[(String, String)]) -> Result<Value> {
        let mut seen = HashSet::new();
        let mut object = Map::new();
        for (key, value) in pairs {
            if !seen.insert(key.as_str()) {
                return Err(GatewayError::validation(key.as_str(), "must not be repeated"));
            }
            object.insert(key.clone(), Value::String(value.clone()));
        }

        let value = Value::Object(object);
        self.validate(&value)?;
        Ok(value)
    }
}

/// `POST /api/chat` body
pub fn chat_request_schema() -> Schema {
    Schema::new(
        "chat_request",
        vec![
            FieldRule::string("message").required().length(1, MAX_MESSAGE_CHARS),
            FieldRule::string("context").max_length(MAX_CONTEXT_CHARS),
            FieldRule::string("conversation_id").pattern(uuid_pattern(), "uuid"),
        ],
    )
}

/// `GET /api/chat/stream` query string
pub fn chat_stream_query_schema() -> Schema {
    Schema::new(
        "chat_stream_query",
        vec![
            FieldRule::string("message").required().length(1, MAX_MESSAGE_CHARS),
            FieldRule::string("conversation_id").pattern(uuid_pattern(), "uuid"),
        ],
    )
}

/// Decode a raw query string into ordered pairs
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return Vec::new();
    };
    match reqwest::Url::parse("http://gateway.invalid/") {
        Ok(mut url) => {
            url.set_query(Some(query));
            url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect()
        }
        Err(_) => Vec::new(),
    }
}
