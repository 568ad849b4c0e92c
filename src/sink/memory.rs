//! In-memory audit sink for testing and single-process use

use super::{AuditQuery, AuditSink, StoredRecord};
use crate::error::{AuditError, Result};
use crate::record::AuditRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// In-memory sink backed by a `Vec`
///
/// Also offers outage and latency injection so retry, timeout and recovery
/// paths can be exercised without a network.
#[derive(Default)]
pub struct MemorySink {
    records: Arc<RwLock<Vec<StoredRecord>>>,
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    write_delay_ms: AtomicU64,
    write_attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Every stored record, in write order
    pub async fn records(&self) -> Vec<StoredRecord> {
        self.records.read().await.clone()
    }

    /// Simulate a full outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with a transient error
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every write by `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total write calls seen, including failed ones
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Replace a stored record in place, bypassing sealing checks
    ///
    /// Every copy with the same audit ID is replaced; the stored time is kept.
    ///
    /// Used by fixtures that simulate storage-level tampering or migration.
    pub async fn overwrite(&self, record: AuditRecord) -> Result<()> {
        let audit_id = record
            .audit_id()
            .ok_or_else(|| AuditError::missing("audit_id"))?
            .to_string();
        let mut records = self.records.write().await;
        let mut replaced = false;
        for stored in records
            .iter_mut()
            .filter(|s| s.record.audit_id() == Some(audit_id.as_str()))
        {
            stored.record = record.clone();
            replaced = true;
        }
        if !replaced {
            return Err(AuditError::NotFound(format!("Audit record not found: {}", audit_id)));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write(&self, endpoint: &str, record: &AuditRecord) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.unavailable.load(Ordering::SeqCst) || self.take_injected_failure() {
            return Err(AuditError::Persistence {
                endpoint: endpoint.to_string(),
                reason: "memory sink unavailable".to_string(),
            });
        }

        let audit_id = record
            .audit_id()
            .ok_or_else(|| AuditError::missing("audit_id"))?;

        let mut records = self.records.write().await;
        if records
            .iter()
            .any(|s| s.key() == (endpoint, Some(audit_id)))
        {
            tracing::debug!(audit_id = %audit_id, endpoint = %endpoint, "Duplicate audit record ignored");
            return Ok(());
        }

        records.push(StoredRecord::new(endpoint, record.clone()));
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|s| query.matches(s))
            .map(|s| s.record.clone())
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn health(&self) -> Result<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }
}
