//! Zero-loss audit persistence
//!
//! Every event is validated and sealed on its own, then written with bounded
//! retries. A record that still cannot be written goes to the recovery
//! outbox and raises a persistence-failure alert; it is counted as failed
//! either way, so `success_count + failure_count` always equals the input
//! size.

use crate::alert::{AlertSystem, Severity, TriggerKind};
use crate::config::{AuditConfig, PersistenceConfig};
use crate::error::{AuditError, ErrorKind, Result};
use crate::framework::ComplianceFramework;
use crate::logger::AuditLogger;
use crate::outbox::{MemoryOutbox, Outbox, OutboxEntry};
use crate::record::AuditRecord;
use crate::sink::{AuditQuery, AuditSink};
use crate::types::{AuditEvent, AuditPeriod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Why one item of a batch was not persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    /// Position in the input batch
    pub index: usize,
    pub audit_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of persisting one event or a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceResult {
    pub success_count: usize,
    pub failure_count: usize,
    /// Per-item failures in input order
    pub errors: Vec<ItemError>,
    /// Failed items that were handed to the recovery outbox
    pub queued_for_recovery: usize,
}

impl PersistenceResult {
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }

    pub fn is_complete(&self) -> bool {
        self.failure_count == 0
    }

    fn succeed(&mut self) {
        self.success_count += 1;
    }

    fn fail(&mut self, index: usize, audit_id: Option<&str>, error: &AuditError) {
        self.failure_count += 1;
        self.errors.push(ItemError {
            index,
            audit_id: audit_id.map(str::to_string),
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    /// Whether exhausted writes fall back to the outbox
    pub enabled: bool,
    /// Entries waiting in the outbox
    pub pending: usize,
    pub last_recovery: Option<DateTime<Utc>>,
}

/// Writes sealed audit records to a durable sink
pub struct AuditPersistence {
    config: PersistenceConfig,
    framework: ComplianceFramework,
    endpoint: String,
    logger: Arc<AuditLogger>,
    sink: Arc<dyn AuditSink>,
    outbox: Arc<dyn Outbox>,
    alerts: Arc<AlertSystem>,
    last_recovery: RwLock<Option<DateTime<Utc>>>,
    /// Held for a whole recovery pass
    recovering: Mutex<()>,
}

impl AuditPersistence {
    /// Build a persistence component, failing fast on an unusable config
    pub fn new(
        config: &AuditConfig,
        sink: Arc<dyn AuditSink>,
        alerts: Arc<AlertSystem>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            sink = sink.name(),
            max_attempts = config.persistence.max_attempts,
            recovery_enabled = config.persistence.recovery_enabled,
            "Audit persistence initialized"
        );

        Ok(Self {
            config: config.persistence.clone(),
            framework: config.default_framework.clone(),
            endpoint: config.default_endpoint.clone(),
            logger: Arc::new(AuditLogger::new(config)),
            sink,
            outbox: Arc::new(MemoryOutbox::default()),
            alerts,
            last_recovery: RwLock::new(None),
            recovering: Mutex::new(()),
        })
    }

    /// Use a specific enricher, e.g. one with an encryptor attached
    pub fn with_logger(mut self, logger: Arc<AuditLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Use a specific recovery outbox
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn logger(&self) -> &Arc<AuditLogger> {
        &self.logger
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub fn outbox(&self) -> &Arc<dyn Outbox> {
        &self.outbox
    }

    pub fn default_endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Seal and persist each event under the default framework
    ///
    /// Invalid events are counted as failures without being sent; the rest
    /// of the batch carries on.
    pub async fn persist_events(
        &self,
        events: &[AuditEvent],
        endpoint: &str,
    ) -> Result<PersistenceResult> {
        check_endpoint(endpoint)?;

        let mut result = PersistenceResult::default();
        let mut failed_writes = Vec::new();

        for (index, event) in events.iter().enumerate() {
            let record = match self.logger.seal_event(event, &self.framework) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        audit_id = %event.audit_id,
                        index,
                        error = %e,
                        "Audit event rejected before write"
                    );
                    if e.kind() == ErrorKind::Encryption {
                        self.alerts
                            .trigger_with_detail(
                                TriggerKind::EncryptionFailure,
                                Severity::High,
                                format!("{}: {}", event.audit_id, e),
                            )
                            .await;
                    }
                    result.fail(index, Some(&event.audit_id), &e);
                    continue;
                }
            };

            self.persist_one(index, endpoint, &record, &mut result, &mut failed_writes)
                .await;
        }

        self.alert_failed_writes(endpoint, &failed_writes).await;
        log_result(endpoint, &result);
        Ok(result)
    }

    /// Persist records that are already sealed
    ///
    /// Unsealed or tampered records are refused, never written.
    pub async fn persist_records(
        &self,
        records: &[AuditRecord],
        endpoint: &str,
    ) -> Result<PersistenceResult> {
        check_endpoint(endpoint)?;

        let mut result = PersistenceResult::default();
        let mut failed_writes = Vec::new();

        for (index, record) in records.iter().enumerate() {
            if !record.verify() {
                let e = AuditError::Integrity {
                    tampered: 1,
                    detail: "record is unsealed or its hash does not match".to_string(),
                };
                tracing::error!(audit_id = ?record.audit_id(), index, "Refusing to persist unverifiable audit record");
                result.fail(index, record.audit_id(), &e);
                continue;
            }
            self.persist_one(index, endpoint, record, &mut result, &mut failed_writes)
                .await;
        }

        self.alert_failed_writes(endpoint, &failed_writes).await;
        log_result(endpoint, &result);
        Ok(result)
    }

    async fn persist_one(
        &self,
        index: usize,
        endpoint: &str,
        record: &AuditRecord,
        result: &mut PersistenceResult,
        failed_writes: &mut Vec<String>,
    ) {
        let audit_id = record.audit_id().unwrap_or_default().to_string();

        let error = match self.write_with_retry(endpoint, record).await {
            Ok(()) => {
                result.succeed();
                return;
            }
            Err(e) => e,
        };

        tracing::error!(
            audit_id = %audit_id,
            endpoint = %endpoint,
            error = %error,
            "Audit record could not be persisted"
        );

        if self.config.recovery_enabled {
            let entry = OutboxEntry::new(endpoint, record.clone(), error.to_string());
            match self.outbox.enqueue(entry).await {
                Ok(()) => result.queued_for_recovery += 1,
                Err(outbox_err) => tracing::error!(
                    audit_id = %audit_id,
                    error = %outbox_err,
                    "Recovery outbox rejected audit record"
                ),
            }
        }

        failed_writes.push(audit_id.clone());
        result.fail(index, Some(&audit_id), &error);
    }

    /// Write one record, retrying transient failures with exponential backoff
    ///
    /// Each attempt runs under the configured write timeout; an attempt that
    /// times out counts as failed.
    async fn write_with_retry(&self, endpoint: &str, record: &AuditRecord) -> Result<()> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match self.write_once(endpoint, record).await {
                Ok(()) => {
                    tracing::debug!(
                        audit_id = ?record.audit_id(),
                        endpoint = %endpoint,
                        attempt,
                        "Audit record persisted"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= max_attempts {
                return Err(error);
            }

            let delay = self.config.backoff(attempt);
            tracing::warn!(
                audit_id = ?record.audit_id(),
                endpoint = %endpoint,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Audit write failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn write_once(&self, endpoint: &str, record: &AuditRecord) -> Result<()> {
        let timeout = self.config.write_timeout();
        match tokio::time::timeout(timeout, self.sink.write(endpoint, record)).await {
            Ok(result) => result,
            Err(_) => Err(AuditError::Timeout(format!(
                "write to '{}' exceeded {}ms",
                endpoint,
                timeout.as_millis()
            ))),
        }
    }

    async fn alert_failed_writes(&self, endpoint: &str, audit_ids: &[String]) {
        if audit_ids.is_empty() {
            return;
        }
        self.alerts
            .trigger_with_detail(
                TriggerKind::PersistenceFailure,
                Severity::Critical,
                format!(
                    "{} record(s) not persisted to '{}': {}",
                    audit_ids.len(),
                    endpoint,
                    audit_ids.join(", ")
                ),
            )
            .await;
    }

    /// Replay the recovery outbox against the sink
    ///
    /// One attempt per entry. Written entries leave the outbox; the rest stay
    /// queued with their attempt count bumped. Entries whose hash no longer
    /// verifies are never written and stay queued for investigation.
    ///
    /// Passes run one at a time. An entry that left the outbox while the pass
    /// was running, e.g. through another `AuditPersistence` sharing the same
    /// outbox, counts as delivered.
    pub async fn recover(&self) -> Result<PersistenceResult> {
        let _pass = self.recovering.lock().await;
        let pending = self.outbox.pending().await?;
        let mut result = PersistenceResult::default();
        let mut tampered = Vec::new();

        for (index, entry) in pending.iter().enumerate() {
            let audit_id = entry.audit_id().unwrap_or_default();

            if !entry.record.verify() {
                let e = AuditError::Integrity {
                    tampered: 1,
                    detail: format!("queued record {} failed verification", audit_id),
                };
                tampered.push(audit_id.to_string());
                result.fail(index, Some(audit_id), &e);
                continue;
            }

            match self.write_once(&entry.endpoint, &entry.record).await {
                Ok(()) => {
                    if !self.outbox.remove(audit_id).await? {
                        tracing::debug!(audit_id = %audit_id, "Outbox entry already removed");
                    }
                    result.succeed();
                }
                Err(e) => match self.outbox.mark_attempt(audit_id, &e.to_string()).await {
                    Ok(()) => result.fail(index, Some(audit_id), &e),
                    Err(AuditError::NotFound(_)) => {
                        tracing::debug!(audit_id = %audit_id, "Outbox entry delivered by another pass");
                        result.succeed();
                    }
                    Err(other) => return Err(other),
                },
            }
        }

        if !tampered.is_empty() {
            self.alerts
                .trigger_with_detail(
                    TriggerKind::TamperingDetected,
                    Severity::Critical,
                    format!("outbox entries failed verification: {}", tampered.join(", ")),
                )
                .await;
        }

        *self.last_recovery.write().await = Some(Utc::now());

        tracing::info!(
            replayed = result.success_count,
            still_pending = result.failure_count,
            "Audit outbox recovery finished"
        );
        Ok(result)
    }

    pub async fn get_recovery_status(&self) -> Result<RecoveryStatus> {
        Ok(RecoveryStatus {
            enabled: self.config.recovery_enabled,
            pending: self.outbox.count().await?,
            last_recovery: *self.last_recovery.read().await,
        })
    }

    /// Records matching a query, oldest first
    pub async fn retrieve_records(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut records = self.sink.query(query).await?;
        records.sort_by_key(|r| r.audit_time());
        Ok(records)
    }

    /// Every event `user_id` produced in `[start, end)`, oldest first
    ///
    /// Encrypted records are decrypted when an encryptor is attached. A record
    /// that fails verification aborts retrieval with an integrity error.
    pub async fn retrieve_events(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        if user_id.trim().is_empty() {
            return Err(AuditError::missing("user_id"));
        }
        let period = AuditPeriod::new(start, end)?;
        let query = AuditQuery::between(period.start, period.end).for_user(user_id);
        let records = self.retrieve_records(&query).await?;

        let tampered: Vec<&str> = records
            .iter()
            .filter(|r| !r.verify())
            .map(|r| r.audit_id().unwrap_or("<missing>"))
            .collect();
        if !tampered.is_empty() {
            let detail = tampered.join(", ");
            self.alerts
                .trigger_with_detail(TriggerKind::TamperingDetected, Severity::Critical, detail.clone())
                .await;
            return Err(AuditError::Integrity {
                tampered: tampered.len(),
                detail,
            });
        }

        records.iter().map(|r| self.restore_event(r)).collect()
    }

    fn restore_event(&self, record: &AuditRecord) -> Result<AuditEvent> {
        match (record.encrypted_envelope()?, self.logger.encryptor()) {
            (Some(envelope), Some(encryptor)) => encryptor.decrypt(&envelope),
            (Some(envelope), None) => Err(AuditError::KeyUnavailable {
                key_id: envelope.key_id,
                reason: format!(
                    "record {} is encrypted and no encryptor is attached",
                    envelope.original_audit_id
                ),
            }),
            (None, _) => record.to_event(),
        }
    }
}

fn check_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.trim().is_empty() {
        return Err(AuditError::validation("endpoint", "sink endpoint cannot be empty"));
    }
    Ok(())
}

fn log_result(endpoint: &str, result: &PersistenceResult) {
    if result.is_complete() {
        tracing::debug!(
            endpoint = %endpoint,
            persisted = result.success_count,
            "Audit batch persisted"
        );
    } else {
        tracing::warn!(
            endpoint = %endpoint,
            persisted = result.success_count,
            failed = result.failure_count,
            queued = result.queued_for_recovery,
            "Audit batch partially persisted"
        );
    }
}
