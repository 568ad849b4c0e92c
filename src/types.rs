//! Core audit types for the a3s-audit system
//!
//! All wire-facing types use camelCase JSON serialization.

use crate::error::{AuditError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of entity an audit event refers to
///
/// Closed set of entities known to the platform plus `Other` for forward
/// compatibility with entity kinds added after this build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Content,
    Inquiry,
    Donation,
    User,
    Media,
    Category,
    Other(String),
}

impl EntityType {
    /// Wire name of this entity kind
    pub fn as_str(&self) -> &str {
        match self {
            Self::Content => "content",
            Self::Inquiry => "inquiry",
            Self::Donation => "donation",
            Self::User => "user",
            Self::Media => "media",
            Self::Category => "category",
            Self::Other(name) => name,
        }
    }

    /// Entities whose snapshots hold personal or financial data
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Inquiry | Self::Donation | Self::User)
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Other(name) if name.trim().is_empty())
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "content" => Self::Content,
            "inquiry" => Self::Inquiry,
            "donation" => Self::Donation,
            "user" => Self::User,
            "media" => Self::Media,
            "category" => Self::Category,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for EntityType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation performed on an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Publish,
    Archive,
    Access,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Publish => "publish",
            Self::Archive => "archive",
            Self::Access => "access",
        }
    }

    /// Parse a wire name back into an operation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "publish" => Some(Self::Publish),
            "archive" => Some(Self::Archive),
            "access" => Some(Self::Access),
            _ => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque before/after representations of the entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

impl DataSnapshot {
    pub fn is_empty(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// One fact about one operation on one entity
///
/// Built by a domain service at the moment of mutation or access, then handed
/// to the audit pipeline. Never mutated after it reaches persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique audit identifier (aud-<uuid>), also the persistence idempotency key
    pub audit_id: String,

    pub entity_type: EntityType,

    pub entity_id: String,

    /// `None` only for partially populated events received from callers
    #[serde(default)]
    pub operation_type: Option<OperationType>,

    /// UTC creation time
    pub audit_time: DateTime<Utc>,

    pub user_id: String,

    pub correlation_id: String,

    #[serde(default)]
    pub trace_id: String,

    #[serde(default)]
    pub data_snapshot: DataSnapshot,

    #[serde(default)]
    pub environment: String,

    #[serde(default)]
    pub app_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Free-form tags (justification, legal basis, change ticket, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Create a new event with generated audit ID, correlation ID and UTC timestamp
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        operation: OperationType,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            audit_id: format!("aud-{}", uuid::Uuid::new_v4()),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation_type: Some(operation),
            audit_time: Utc::now(),
            user_id: user_id.into(),
            correlation_id: format!("cor-{}", uuid::Uuid::new_v4()),
            trace_id: String::new(),
            data_snapshot: DataSnapshot::default(),
            environment: String::new(),
            app_version: String::new(),
            request_url: None,
            ip_address: None,
            user_agent: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach distributed trace context
    pub fn with_trace_context(
        mut self,
        trace_id: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        self.trace_id = trace_id.into();
        if let Some(correlation_id) = correlation_id {
            self.correlation_id = correlation_id;
        }
        self
    }

    /// Attach the originating request context
    pub fn with_request_context(
        mut self,
        request_url: impl Into<String>,
        ip_address: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        self.request_url = Some(request_url.into());
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Attach deployment environment and application version
    pub fn with_environment_context(
        mut self,
        environment: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        self.environment = environment.into();
        self.app_version = app_version.into();
        self
    }

    /// Replace both snapshots
    pub fn with_data_snapshot(
        mut self,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        self.data_snapshot = DataSnapshot { before, after };
        self
    }

    pub fn with_before_data(mut self, before: serde_json::Value) -> Self {
        self.data_snapshot.before = Some(before);
        self
    }

    pub fn with_after_data(mut self, after: serde_json::Value) -> Self {
        self.data_snapshot.after = Some(after);
        self
    }

    /// Add a metadata tag
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the required fields, reporting the first one missing
    ///
    /// Order: audit_id, entity_type, entity_id, operation_type, audit_time, user_id.
    pub fn validate(&self) -> Result<()> {
        if self.audit_id.trim().is_empty() {
            return Err(AuditError::missing("audit_id"));
        }
        if self.entity_type.is_empty() {
            return Err(AuditError::missing("entity_type"));
        }
        if self.entity_id.trim().is_empty() {
            return Err(AuditError::missing("entity_id"));
        }
        if self.operation_type.is_none() {
            return Err(AuditError::missing("operation_type"));
        }
        if self.audit_time == DateTime::<Utc>::default() {
            return Err(AuditError::missing("audit_time"));
        }
        if self.user_id.trim().is_empty() {
            return Err(AuditError::missing("user_id"));
        }
        Ok(())
    }

    /// The operation, or a validation error for partially populated events
    pub fn operation(&self) -> Result<OperationType> {
        self.operation_type
            .ok_or_else(|| AuditError::missing("operation_type"))
    }
}

/// Half-open time window `[start, end)` used for retrieval and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AuditPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(AuditError::validation(
                "period",
                format!("end {} is not after start {}", end, start),
            ));
        }
        Ok(Self { start, end })
    }

    /// The window ending now and reaching back `duration`
    pub fn last(duration: chrono::Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - duration,
            end,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}
