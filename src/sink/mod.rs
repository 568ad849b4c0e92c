//! Durable log sink trait, the core abstraction for audit storage backends
//!
//! A sink accepts sealed records and answers time-ranged, actor-scoped
//! queries. It is treated as append-mostly: the pipeline never updates or
//! deletes what it wrote.

use crate::error::Result;
use crate::record::AuditRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod file;
pub mod memory;
pub mod nats;

/// Core trait for audit sinks
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably write one sealed record to `endpoint`
    ///
    /// Writes are idempotent on the endpoint and the record's audit ID:
    /// replaying a record that is already stored there succeeds without
    /// creating a duplicate.
    async fn write(&self, endpoint: &str, record: &AuditRecord) -> Result<()>;

    /// Records matching the query, oldest first, at most one per endpoint
    /// and audit ID
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>>;

    /// Sink name (e.g., "memory", "file", "nats")
    fn name(&self) -> &str;

    /// Health check: returns true if the sink is reachable
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Time-ranged, optionally actor- and endpoint-scoped query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    /// Inclusive lower bound on audit time
    pub start: DateTime<Utc>,

    /// Exclusive upper bound on audit time
    pub end: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl AuditQuery {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            user_id: None,
            endpoint: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn at_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Whether a stored record matches this query
    ///
    /// A record is in the window when either the time the sink stored it or
    /// the audit time it claims falls inside `[start, end)`. The stored time
    /// is assigned by the sink, so rewriting `audit_time` cannot move a
    /// record out of the window it was written in.
    pub fn matches(&self, stored: &StoredRecord) -> bool {
        if let Some(wanted) = &self.endpoint {
            if *wanted != stored.endpoint {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if stored.record.user_id() != Some(user.as_str()) {
                return false;
            }
        }
        self.in_window(stored.stored_at)
            || matches!(stored.record.audit_time(), Some(t) if self.in_window(t))
    }

    fn in_window(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// A record as kept by a sink, tagged with the endpoint it was written to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub endpoint: String,
    pub record: AuditRecord,
    /// Assigned by the sink on write, never taken from the record
    pub stored_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn new(endpoint: impl Into<String>, record: AuditRecord) -> Self {
        Self {
            endpoint: endpoint.into(),
            record,
            stored_at: Utc::now(),
        }
    }

    /// Key a sink dedupes writes on
    pub fn key(&self) -> (&str, Option<&str>) {
        (self.endpoint.as_str(), self.record.audit_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(user: &str, at: DateTime<Utc>) -> AuditRecord {
        let mut r = AuditRecord::new();
        r.set_field("audit_id", "aud-1").unwrap();
        r.set_field("user_id", user).unwrap();
        r.set_field("audit_time", at.to_rfc3339()).unwrap();
        r.seal().unwrap();
        r
    }

    fn stored(endpoint: &str, record: AuditRecord, stored_at: DateTime<Utc>) -> StoredRecord {
        StoredRecord {
            endpoint: endpoint.to_string(),
            record,
            stored_at,
        }
    }

    fn stored_at_audit_time(user: &str, at: DateTime<Utc>) -> StoredRecord {
        stored("audit-events", record(user, at), at)
    }

    #[test]
    fn test_query_matches_window_and_user() {
        let now = Utc::now();
        let query = AuditQuery::between(now - Duration::hours(1), now).for_user("alice");

        assert!(query.matches(&stored_at_audit_time("alice", now - Duration::minutes(5))));
        assert!(!query.matches(&stored_at_audit_time("bob", now - Duration::minutes(5))));
        assert!(!query.matches(&stored_at_audit_time("alice", now - Duration::hours(2))));
        assert!(!query.matches(&stored_at_audit_time("alice", now)));
    }

    #[test]
    fn test_query_endpoint_scope() {
        let now = Utc::now();
        let query = AuditQuery::between(now - Duration::hours(1), now).at_endpoint("inquiries");
        let r = record("alice", now - Duration::minutes(1));
        assert!(query.matches(&stored("inquiries", r.clone(), now - Duration::minutes(1))));
        assert!(!query.matches(&stored("content", r, now - Duration::minutes(1))));
    }

    #[test]
    fn test_replayed_record_matches_by_audit_time() {
        let now = Utc::now();
        let query = AuditQuery::between(now - Duration::hours(3), now - Duration::hours(1));
        // Sealed two hours ago, written by outbox recovery just now
        let r = record("alice", now - Duration::hours(2));
        assert!(query.matches(&stored("audit-events", r, now)));
    }

    #[test]
    fn test_record_without_time_matches_by_stored_time() {
        let now = Utc::now();
        let mut r = AuditRecord::new();
        r.set_field("user_id", "alice").unwrap();
        let query = AuditQuery::between(now - Duration::hours(1), now);

        assert!(query.matches(&stored("audit-events", r.clone(), now - Duration::minutes(1))));
        assert!(!query.matches(&stored("audit-events", r, now - Duration::hours(2))));
    }

    #[test]
    fn test_rewritten_audit_time_stays_in_stored_window() {
        let now = Utc::now();
        let mut raw = serde_json::to_value(record("alice", now - Duration::minutes(1))).unwrap();
        raw["fields"]["audit_time"] = serde_json::json!("1970-01-01T00:00:00Z");
        let r: AuditRecord = serde_json::from_value(raw).unwrap();

        let query = AuditQuery::between(now - Duration::hours(1), now);
        assert!(query.matches(&stored("audit-events", r, now - Duration::minutes(1))));
    }

    #[test]
    fn test_stored_record_key() {
        let s = stored("inquiries", record("alice", Utc::now()), Utc::now());
        assert_eq!(s.key(), ("inquiries", Some("aud-1")));
    }
}
