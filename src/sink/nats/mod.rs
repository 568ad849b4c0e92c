//! NATS JetStream audit sink
//!
//! Persists sealed records to a file-backed JetStream stream with
//! server-side deduplication on the audit ID.

mod client;
mod config;

pub use client::{NatsClient, StreamInfo};
pub use config::{NatsSinkConfig, StorageType};

use crate::error::Result;
use crate::record::AuditRecord;
use crate::sink::{AuditQuery, AuditSink};
use async_trait::async_trait;

/// NATS JetStream audit sink
///
/// Wraps `NatsClient` and implements the `AuditSink` trait.
pub struct NatsSink {
    client: NatsClient,
}

impl NatsSink {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsSinkConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl AuditSink for NatsSink {
    async fn write(&self, endpoint: &str, record: &AuditRecord) -> Result<()> {
        self.client.append(endpoint, record).await.map(|_| ())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        self.client.fetch(query).await
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        if !self.client.is_connected() {
            return Ok(false);
        }
        self.client.stream_info().await.map(|_| true)
    }
}
