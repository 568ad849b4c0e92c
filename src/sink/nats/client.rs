//! NATS JetStream client: connect, append records, query by time window

use super::config::{NatsSinkConfig, StorageType};
use crate::error::{AuditError, Result};
use crate::record::AuditRecord;
use crate::sink::{AuditQuery, StoredRecord};
use async_nats::jetstream;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Records published up to this many minutes before the window start are
/// still scanned, to tolerate producer clock skew.
const CLOCK_SKEW_MINUTES: i64 = 5;

/// NATS JetStream client
///
/// Owns the connection and the audit stream lifecycle.
pub struct NatsClient {
    client: async_nats::Client,

    jetstream: jetstream::Context,

    /// Audit stream, locked because `info()` takes `&mut self`
    stream: Mutex<jetstream::stream::Stream>,

    config: Arc<NatsSinkConfig>,
}

impl NatsClient {
    /// Connect and make sure the audit stream exists
    pub async fn connect(config: NatsSinkConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| AuditError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Audit sink connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Append a record, waiting for the JetStream ack
    ///
    /// The endpoint and audit ID are sent as `Nats-Msg-Id` so the server drops
    /// replays that fall inside the duplicate window. Later replays are
    /// dropped by `fetch`.
    pub async fn append(&self, endpoint: &str, record: &AuditRecord) -> Result<u64> {
        let audit_id = record
            .audit_id()
            .ok_or_else(|| AuditError::missing("audit_id"))?;
        let entity_type = record.field_str("entity_type").unwrap_or("unknown");
        let subject = self.config.record_subject(endpoint, entity_type);

        let stored = StoredRecord::new(endpoint, record.clone());
        let payload = serde_json::to_vec(&stored)?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", msg_id(endpoint, audit_id).as_str());

        let publish_error = |reason: String| AuditError::Persistence {
            endpoint: subject.clone(),
            reason,
        };

        let ack_fut = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        let timeout_secs = self.config.request_timeout_secs;
        let ack = tokio::time::timeout(Duration::from_secs(timeout_secs), ack_fut)
            .await
            .map_err(|_| {
                AuditError::Timeout(format!(
                    "No JetStream ack within {}s for '{}'",
                    timeout_secs, subject
                ))
            })?
            .map_err(|e| publish_error(format!("ack failed: {}", e)))?;

        tracing::debug!(
            audit_id = %audit_id,
            subject = %subject,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Audit record appended"
        );

        Ok(ack.sequence)
    }

    /// Scan the stream from the window start and return matching records
    pub async fn fetch(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let config = jetstream::consumer::pull::Config {
            filter_subject: self.config.filter_subject(query.endpoint.as_deref()),
            deliver_policy: jetstream::consumer::DeliverPolicy::ByStartTime {
                start_time: to_offset(query.start - chrono::Duration::minutes(CLOCK_SKEW_MINUTES)),
            },
            ack_policy: jetstream::consumer::AckPolicy::None,
            ..Default::default()
        };

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| {
                AuditError::Connection(format!("Failed to create query consumer: {}", e))
            })?;

        let batch_size = self.config.query_batch_size.max(1);
        let mut matched = Matched::new(query);

        loop {
            let batch = consumer
                .fetch()
                .max_messages(batch_size)
                .expires(Duration::from_secs(self.config.request_timeout_secs))
                .messages()
                .await
                .map_err(|e| AuditError::Connection(format!("Failed to fetch records: {}", e)))?;

            let mut batch = std::pin::pin!(batch);
            let mut received = 0;
            while let Some(msg) = batch.next().await {
                match msg {
                    Ok(msg) => {
                        received += 1;
                        matched.push(&msg.subject, &msg.payload);
                    }
                    Err(e) => {
                        return Err(AuditError::Connection(format!(
                            "Error fetching audit records: {}",
                            e
                        )));
                    }
                }
            }

            if received < batch_size {
                break;
            }
        }

        Ok(matched.into_records())
    }

    /// Whether the underlying connection is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    /// Get stream info
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| AuditError::Connection(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsSinkConfig {
        &self.config
    }
}

/// Message and sequence counters of the audit stream
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

fn msg_id(endpoint: &str, audit_id: &str) -> String {
    format!("{}:{}", endpoint, audit_id)
}

/// Records of a fetch that match the query, first copy per endpoint and
/// audit ID
struct Matched<'q> {
    query: &'q AuditQuery,
    seen: HashSet<(String, String)>,
    records: Vec<AuditRecord>,
}

impl<'q> Matched<'q> {
    fn new(query: &'q AuditQuery) -> Self {
        Self {
            query,
            seen: HashSet::new(),
            records: Vec::new(),
        }
    }

    fn push(&mut self, subject: &str, payload: &[u8]) {
        let stored = match serde_json::from_slice::<StoredRecord>(payload) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "Skipping undecodable audit message");
                return;
            }
        };
        if !self.query.matches(&stored) {
            return;
        }
        if let Some(audit_id) = stored.record.audit_id() {
            if !self.seen.insert((stored.endpoint.clone(), audit_id.to_string())) {
                tracing::debug!(audit_id = %audit_id, subject = %subject, "Duplicate audit message skipped");
                return;
            }
        }
        self.records.push(stored.record);
    }

    fn into_records(self) -> Vec<AuditRecord> {
        self.records
    }
}

fn to_offset(t: DateTime<Utc>) -> time::OffsetDateTime {
    let secs = t.timestamp();
    let nanos = t.timestamp_subsec_nanos();
    time::OffsetDateTime::from_unix_timestamp(secs)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
        + time::Duration::nanoseconds(i64::from(nanos))
}

/// Connection options: timeouts and optional token auth
fn build_connect_options(config: &NatsSinkConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(token) = &config.token {
        opts = opts.token(token.to_string());
    }

    opts
}

/// Get or create the audit stream with limits retention and a dedupe window
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsSinkConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_age: Duration::from_secs(config.max_age_secs),
        duplicate_window: Duration::from_secs(config.duplicate_window_secs),
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            AuditError::Connection(format!(
                "Audit stream '{}' unavailable: {}",
                config.stream_name, e
            ))
        })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream audit stream ready"
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(endpoint: &str, audit_id: &str, user: &str) -> Vec<u8> {
        let mut record = AuditRecord::new();
        record.set_field("audit_id", audit_id).unwrap();
        record.set_field("user_id", user).unwrap();
        record.set_field("audit_time", Utc::now().to_rfc3339()).unwrap();
        record.seal().unwrap();
        serde_json::to_vec(&StoredRecord::new(endpoint, record)).unwrap()
    }

    fn last_hour() -> AuditQuery {
        let now = Utc::now();
        AuditQuery::between(now - chrono::Duration::hours(1), now + chrono::Duration::seconds(5))
    }

    #[test]
    fn test_replayed_messages_collapse_to_first_copy() {
        let query = last_hour();
        let mut matched = Matched::new(&query);
        let first = payload("audit-events", "aud-1", "alice");

        matched.push("audit.audit-events.content", &first);
        matched.push("audit.audit-events.content", &payload("audit-events", "aud-2", "bob"));
        // Outbox replay after the duplicate window closed
        matched.push("audit.audit-events.content", &payload("audit-events", "aud-1", "alice"));

        let records = matched.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].audit_id(), Some("aud-1"));
        assert_eq!(records[1].audit_id(), Some("aud-2"));
        let original: StoredRecord = serde_json::from_slice(&first).unwrap();
        assert_eq!(records[0], original.record);
    }

    #[test]
    fn test_same_audit_id_kept_per_endpoint() {
        let query = last_hour();
        let mut matched = Matched::new(&query);
        matched.push("audit.inquiries.inquiry", &payload("inquiries", "aud-1", "alice"));
        matched.push("audit.content.content", &payload("content", "aud-1", "alice"));
        assert_eq!(matched.into_records().len(), 2);
    }

    #[test]
    fn test_undecodable_and_unmatched_messages_skipped() {
        let query = last_hour().for_user("alice");
        let mut matched = Matched::new(&query);
        matched.push("audit.x", b"{not json");
        matched.push("audit.x", &payload("audit-events", "aud-1", "bob"));
        matched.push("audit.x", &payload("audit-events", "aud-2", "alice"));

        let records = matched.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].audit_id(), Some("aud-2"));
    }

    #[test]
    fn test_msg_id_scoped_to_endpoint() {
        assert_eq!(msg_id("inquiries", "aud-1"), "inquiries:aud-1");
        assert_ne!(msg_id("inquiries", "aud-1"), msg_id("content", "aud-1"));
    }

    #[test]
    fn test_to_offset_preserves_instant() {
        let t = DateTime::parse_from_rfc3339("2026-05-01T10:15:30.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let offset = to_offset(t);
        assert_eq!(offset.unix_timestamp(), t.timestamp());
        assert_eq!(offset.millisecond(), 250);
    }
}
