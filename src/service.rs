//! Caller-facing audit service
//!
//! `AuditService` wires the enricher, persistence, outbox, alerting and the
//! compliance trail together behind the entry points domain services use.
//! Every call either awaits the durable write or hands the record to the
//! outbox; nothing is dispatched without its outcome being observed.

use crate::alert::{AlertSystem, AuditAlert, Severity, TriggerKind};
use crate::compliance::ComplianceAuditTrail;
use crate::config::AuditConfig;
use crate::crypto::AuditEncryptor;
use crate::error::{AuditError, ErrorKind, Result};
use crate::framework::ComplianceFramework;
use crate::logger::AuditLogger;
use crate::outbox::{Outbox, OutboxEntry};
use crate::persistence::{AuditPersistence, PersistenceResult, RecoveryStatus};
use crate::record::AuditRecord;
use crate::sink::AuditSink;
use crate::types::{AuditEvent, OperationType};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Builder for `AuditService`
pub struct AuditServiceBuilder {
    config: AuditConfig,
    sink: Arc<dyn AuditSink>,
    alerts: Option<Arc<AlertSystem>>,
    outbox: Option<Arc<dyn Outbox>>,
    encryptor: Option<Arc<dyn AuditEncryptor>>,
}

impl AuditServiceBuilder {
    pub fn alerts(mut self, alerts: Arc<AlertSystem>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn AuditEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Validate the config and assemble the service
    pub fn build(self) -> Result<AuditService> {
        let max_alerts = self.config.max_alerts;
        let alerts = self
            .alerts
            .unwrap_or_else(|| Arc::new(AlertSystem::with_capacity(max_alerts)));

        let mut logger = AuditLogger::new(&self.config);
        if let Some(encryptor) = self.encryptor {
            logger = logger.with_encryptor(encryptor);
        }
        let logger = Arc::new(logger);

        let mut persistence = AuditPersistence::new(&self.config, self.sink.clone(), alerts.clone())?
            .with_logger(logger.clone());
        if let Some(outbox) = self.outbox {
            persistence = persistence.with_outbox(outbox);
        }

        Ok(AuditService {
            config: self.config,
            sink: self.sink,
            logger,
            persistence: Arc::new(persistence),
            alerts,
        })
    }
}

/// Single entry point for producing, persisting and reviewing audit records
pub struct AuditService {
    config: AuditConfig,
    sink: Arc<dyn AuditSink>,
    logger: Arc<AuditLogger>,
    persistence: Arc<AuditPersistence>,
    alerts: Arc<AlertSystem>,
}

impl AuditService {
    pub fn builder(config: AuditConfig, sink: Arc<dyn AuditSink>) -> AuditServiceBuilder {
        AuditServiceBuilder {
            config,
            sink,
            alerts: None,
            outbox: None,
            encryptor: None,
        }
    }

    /// Service with a fresh alert system and in-memory outbox
    pub fn new(config: AuditConfig, sink: Arc<dyn AuditSink>) -> Result<Self> {
        Self::builder(config, sink).build()
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn alerts(&self) -> &Arc<AlertSystem> {
        &self.alerts
    }

    pub fn persistence(&self) -> &Arc<AuditPersistence> {
        &self.persistence
    }

    pub fn logger(&self) -> &Arc<AuditLogger> {
        &self.logger
    }

    fn endpoint(&self) -> &str {
        &self.config.default_endpoint
    }

    /// Enrich and seal an event, raising an alert if encryption fails closed
    async fn seal(&self, event: &AuditEvent, framework: &ComplianceFramework) -> Result<AuditRecord> {
        match self.logger.seal_event(event, framework) {
            Ok(record) => Ok(record),
            Err(e) => {
                if e.kind() == ErrorKind::Encryption {
                    self.alerts
                        .trigger_with_detail(
                            TriggerKind::EncryptionFailure,
                            Severity::High,
                            format!("{}: {}", event.audit_id, e),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Seal an event and persist it to the default endpoint
    ///
    /// Returns the sealed record once the sink has accepted it. If the write
    /// failed, the error says so; with recovery enabled the record is already
    /// in the outbox.
    pub async fn log_audit_event(
        &self,
        event: &AuditEvent,
        framework: &ComplianceFramework,
    ) -> Result<AuditRecord> {
        let record = self.seal(event, framework).await?;
        let result = self
            .persistence
            .persist_records(std::slice::from_ref(&record), self.endpoint())
            .await?;

        match result.errors.into_iter().next() {
            None => Ok(record),
            Some(failure) => Err(AuditError::Persistence {
                endpoint: self.endpoint().to_string(),
                reason: if result.queued_for_recovery > 0 {
                    format!("{} (queued for recovery)", failure.message)
                } else {
                    failure.message
                },
            }),
        }
    }

    /// Batch variant under the default framework
    pub async fn persist_audit_events(
        &self,
        events: &[AuditEvent],
        endpoint: &str,
    ) -> Result<PersistenceResult> {
        self.persistence.persist_events(events, endpoint).await
    }

    /// Record an access event and wait for it to be persisted
    pub async fn log_access(&self, event: &AuditEvent) -> Result<AuditRecord> {
        if event.operation()? != OperationType::Access {
            return Err(AuditError::validation(
                "operation_type",
                format!("expected access, got {}", event.operation()?),
            ));
        }
        self.log_audit_event(event, &self.config.default_framework)
            .await
    }

    /// Record a denied administrative access and raise a security alert
    ///
    /// The alert is raised even if the access record cannot be persisted; the
    /// persistence error is then returned.
    pub async fn report_unauthorized_access(&self, event: &AuditEvent) -> Result<AuditAlert> {
        let event = event.clone().with_metadata("authorization", "denied");
        let alert = self
            .alerts
            .trigger_with_detail(
                TriggerKind::UnauthorizedAdminAccess,
                Severity::High,
                format!(
                    "user {} on {}/{} ({})",
                    event.user_id,
                    event.entity_type,
                    event.entity_id,
                    event.audit_id
                ),
            )
            .await;

        self.log_access(&event).await?;
        Ok(alert)
    }

    /// Seal an event and hand it to the outbox, returning its audit ID
    ///
    /// The outbox write is the durability boundary; `flush` or an
    /// `OutboxWorker` moves the record to the sink.
    pub async fn enqueue(&self, event: &AuditEvent, framework: &ComplianceFramework) -> Result<String> {
        let record = self.seal(event, framework).await?;
        let entry = OutboxEntry::new(self.endpoint(), record, "dispatched");
        self.persistence.outbox().enqueue(entry).await?;

        tracing::debug!(audit_id = %event.audit_id, "Audit event dispatched to outbox");
        Ok(event.audit_id.clone())
    }

    /// Move everything waiting in the outbox to the sink
    pub async fn flush(&self) -> Result<PersistenceResult> {
        self.persistence.recover().await
    }

    pub async fn get_recovery_status(&self) -> Result<RecoveryStatus> {
        self.persistence.get_recovery_status().await
    }

    pub async fn retrieve_events(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        self.persistence.retrieve_events(user_id, start, end).await
    }

    /// Compliance views over the default endpoint for one framework
    pub fn compliance_trail(&self, framework: ComplianceFramework) -> ComplianceAuditTrail {
        ComplianceAuditTrail::new(framework, self.sink.clone(), self.alerts.clone())
            .with_endpoint(self.endpoint())
    }

    /// Start draining the outbox every `every`
    pub fn spawn_outbox_worker(&self, every: Duration) -> OutboxWorker {
        OutboxWorker::spawn(self.persistence.clone(), every)
    }
}

/// Background task that replays the outbox on an interval
pub struct OutboxWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Option<PersistenceResult>>,
}

impl OutboxWorker {
    pub fn spawn(persistence: Arc<AuditPersistence>, every: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = None;

            tracing::info!(interval_ms = every.as_millis() as u64, "Audit outbox worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
                if let Some(result) = drain(&persistence).await {
                    last = Some(result);
                }
            }

            // One last pass so a clean shutdown leaves nothing behind that
            // the sink would accept
            if let Some(result) = drain(&persistence).await {
                last = Some(result);
            }
            tracing::info!("Audit outbox worker stopped");
            last
        });

        Self { shutdown, handle }
    }

    /// Stop the worker, returning the result of the last replay that ran
    pub async fn shutdown(self) -> Result<Option<PersistenceResult>> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| AuditError::Outbox(format!("outbox worker failed: {}", e)))
    }
}

async fn drain(persistence: &AuditPersistence) -> Option<PersistenceResult> {
    match persistence.outbox().count().await {
        Ok(0) => return None,
        Ok(_) => {}
        Err(e) => {
            tracing::error!(error = %e, "Failed to read audit outbox");
            return None;
        }
    }

    match persistence.recover().await {
        Ok(result) => Some(result),
        Err(e) => {
            tracing::error!(error = %e, "Audit outbox replay failed");
            None
        }
    }
}
