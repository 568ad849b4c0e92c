//! NATS JetStream sink configuration

use crate::framework::ComplianceFramework;
use serde::{Deserialize, Serialize};

/// Storage backend for the JetStream stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Disk-backed; the only choice that satisfies zero-loss in production
    #[default]
    File,
    /// Memory-backed, for tests
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsSinkConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Records are published to `<prefix>.<endpoint>.<entity_type>`
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    #[serde(default)]
    pub storage: StorageType,

    /// Maximum age of stored records; defaults to the longest retention window
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Server-side deduplication window keyed on the audit ID
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Messages pulled per fetch when answering queries
    #[serde(default = "default_query_batch_size")]
    pub query_batch_size: usize,
}

impl Default for NatsSinkConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
            stream_name: default_stream_name(),
            subject_prefix: default_subject_prefix(),
            storage: StorageType::default(),
            max_age_secs: default_max_age_secs(),
            duplicate_window_secs: default_duplicate_window_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            query_batch_size: default_query_batch_size(),
        }
    }
}

impl NatsSinkConfig {
    /// Subject for a record written to `endpoint`
    pub fn record_subject(&self, endpoint: &str, entity_type: &str) -> String {
        format!(
            "{}.{}.{}",
            self.subject_prefix,
            subject_token(endpoint),
            subject_token(entity_type)
        )
    }

    /// Wildcard subject covering one endpoint, or every endpoint
    pub fn filter_subject(&self, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) => format!("{}.{}.>", self.subject_prefix, subject_token(endpoint)),
            None => format!("{}.>", self.subject_prefix),
        }
    }

    pub fn stream_subjects(&self) -> Vec<String> {
        vec![self.filter_subject(None)]
    }
}

/// Make a value safe to use as a single subject token
fn subject_token(value: &str) -> String {
    let token: String = value
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

fn default_url() -> String {
    "nats://127.0.0.1:4222".into()
}
fn default_stream_name() -> String {
    "AUDIT_RECORDS".into()
}
fn default_subject_prefix() -> String {
    "audit".into()
}
fn default_max_age_secs() -> u64 {
    u64::from(ComplianceFramework::max_retention_days()) * 86_400
}
fn default_duplicate_window_secs() -> u64 {
    120
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_query_batch_size() -> usize {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        let config = NatsSinkConfig::default();
        assert_eq!(
            config.record_subject("audit-events", "content"),
            "audit.audit-events.content"
        );
        assert_eq!(config.filter_subject(Some("inquiries")), "audit.inquiries.>");
        assert_eq!(config.stream_subjects(), vec!["audit.>".to_string()]);
    }

    #[test]
    fn test_subject_tokens_are_sanitized() {
        let config = NatsSinkConfig::default();
        assert_eq!(
            config.record_subject("eu.west *", "news>letter"),
            "audit.eu_west__.news_letter"
        );
        assert_eq!(config.record_subject("", "content"), "audit._.content");
    }

    #[test]
    fn test_default_max_age_covers_retention() {
        let config = NatsSinkConfig::default();
        assert_eq!(config.max_age_secs, 2555 * 86_400);
        assert_eq!(config.storage, StorageType::File);
    }
}
