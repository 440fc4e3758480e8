use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(String);

impl FeedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user or group identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a process graph materialized in the flow engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphRef(String);

impl GraphRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// FeedState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedState {
    New,
    Disabled,
    Enabled,
}

impl FeedState {
    /// Parse a requested state, treating anything unrecognized as `New`.
    pub fn parse_or_new(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("DISABLED") => FeedState::Disabled,
            Some("ENABLED") => FeedState::Enabled,
            _ => FeedState::New,
        }
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedState::New => write!(f, "NEW"),
            FeedState::Disabled => write!(f, "DISABLED"),
            FeedState::Enabled => write!(f, "ENABLED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Property
// ---------------------------------------------------------------------------

/// Identity of a property: the owning processor plus the property name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKey {
    pub processor_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub processor_id: String,
    #[serde(default)]
    pub processor_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
    /// Belongs to the feed's input processor.
    #[serde(default)]
    pub input_port: bool,
}

impl Property {
    pub fn new(
        processor_id: impl Into<String>,
        processor_name: impl Into<String>,
        name: impl Into<String>,
        value: Option<&str>,
    ) -> Self {
        let value = value.map(str::to_string);
        Self {
            processor_id: processor_id.into(),
            processor_name: processor_name.into(),
            name: name.into(),
            default_value: value.clone(),
            value,
            sensitive: false,
            input_port: false,
        }
    }

    pub fn key(&self) -> PropertyKey {
        PropertyKey {
            processor_id: self.processor_id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    pub fn is_modified_from_default(&self) -> bool {
        self.value != self.default_value
    }

    pub fn with_default(mut self, default: Option<&str>) -> Self {
        self.default_value = default.map(str::to_string);
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn input(mut self) -> Self {
        self.input_port = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Connection from one of this template's output ports into a reusable
/// template's input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConnection {
    pub reusable_input_port: String,
    pub feed_output_port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Template identifier inside the flow engine.
    pub flow_template_id: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    /// Referenced by other templates rather than instantiated directly.
    #[serde(default)]
    pub reusable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<PortConnection>,
}

impl Template {
    pub fn uses_reusable_template(&self) -> bool {
        !self.connections.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub strategy: String,
    pub period: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    pub category: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub state: FeedState,
    pub properties: Vec<Property>,
    pub template_id: String,
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphRef>,
    #[serde(default)]
    pub reusable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_processor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feed {
    /// `category.name`, the form used in logs and messages.
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.category, &self.name)
    }
}

pub fn qualified_name(category: &str, name: &str) -> String {
    format!("{category}.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_new_falls_back_for_unknown_values() {
        assert_eq!(FeedState::parse_or_new(Some("enabled")), FeedState::Enabled);
        assert_eq!(FeedState::parse_or_new(Some("DISABLED")), FeedState::Disabled);
        assert_eq!(FeedState::parse_or_new(Some("paused")), FeedState::New);
        assert_eq!(FeedState::parse_or_new(None), FeedState::New);
    }

    #[test]
    fn feed_state_serializes_uppercase() {
        let json = serde_json::to_string(&FeedState::Disabled).unwrap();
        assert_eq!(json, "\"DISABLED\"");
    }
}
