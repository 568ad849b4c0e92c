//! Compliance audit trail
//!
//! Read-only views over the sink for one framework: retention lookup,
//! integrity verification over a period, and framework-specific reports.
//! A report is only produced over records that all verify; tampering turns
//! into an alert plus an `Integrity` error, never a partial report.

use crate::alert::{AlertSystem, Severity, TriggerKind};
use crate::error::{AuditError, Result};
use crate::framework::{ComplianceFramework, ReportSection, RetentionPolicy, UNSPECIFIED};
use crate::logger::UNKNOWN;
use crate::record::{fields, AuditRecord};
use crate::sink::{AuditQuery, AuditSink};
use crate::types::AuditPeriod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One record whose fields no longer match its hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TamperedRecord {
    pub audit_id: Option<String>,
    /// Hash stored at seal time, `None` if the record was never sealed
    pub stored_hash: Option<String>,
    pub computed_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainIntegrity {
    pub valid: bool,
    pub period: AuditPeriod,
    pub records_checked: usize,
    pub tampered: Vec<TamperedRecord>,
    /// Tampering alert raised for this check, if any
    pub alert_id: Option<String>,
    pub verified_at: DateTime<Utc>,
}

impl ChainIntegrity {
    /// Turn an invalid result into an `Integrity` error
    pub fn into_result(self) -> Result<Self> {
        if self.valid {
            return Ok(self);
        }
        let ids: Vec<&str> = self
            .tampered
            .iter()
            .map(|t| t.audit_id.as_deref().unwrap_or("<missing>"))
            .collect();
        Err(AuditError::Integrity {
            tampered: self.tampered.len(),
            detail: ids.join(", "),
        })
    }
}

/// Framework-specific aggregate over a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section", rename_all = "camelCase")]
pub enum SectionSummary {
    #[serde(rename_all = "camelCase")]
    AccessJustifications {
        /// Access events per stated justification
        by_justification: BTreeMap<String, usize>,
        unjustified: usize,
    },
    #[serde(rename_all = "camelCase")]
    SecurityControls {
        by_control: BTreeMap<String, usize>,
        changes: usize,
        changes_with_ticket: usize,
        changes_without_ticket: usize,
        /// Changes whose approver is also the actor
        self_approved: usize,
    },
    #[serde(rename_all = "camelCase")]
    LawfulBasis {
        by_legal_basis: BTreeMap<String, usize>,
        by_purpose: BTreeMap<String, usize>,
        unspecified: usize,
    },
    #[serde(rename_all = "camelCase")]
    AccessReview {
        access_events: usize,
        /// Access events per actor
        by_actor: BTreeMap<String, usize>,
        /// Access events missing IP or user agent
        incomplete_context: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    /// Report ID (`rpt-<uuid>`)
    pub report_id: String,
    pub framework: ComplianceFramework,
    pub period: AuditPeriod,
    pub retention: RetentionPolicy,
    pub total_records: usize,
    pub by_operation: BTreeMap<String, usize>,
    pub by_entity_type: BTreeMap<String, usize>,
    pub unique_actors: usize,
    pub sections: Vec<SectionSummary>,
    /// The integrity check the report was built on; always valid
    pub integrity: ChainIntegrity,
    pub generated_at: DateTime<Utc>,
}

/// Reporting and verification for one compliance framework
pub struct ComplianceAuditTrail {
    framework: ComplianceFramework,
    sink: Arc<dyn AuditSink>,
    alerts: Arc<AlertSystem>,
    endpoint: Option<String>,
}

impl ComplianceAuditTrail {
    pub fn new(
        framework: ComplianceFramework,
        sink: Arc<dyn AuditSink>,
        alerts: Arc<AlertSystem>,
    ) -> Self {
        Self {
            framework,
            sink,
            alerts,
            endpoint: None,
        }
    }

    /// Restrict every query to one sink endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn framework(&self) -> &ComplianceFramework {
        &self.framework
    }

    pub fn get_retention_policy(&self) -> RetentionPolicy {
        self.framework.retention_policy()
    }

    fn query(&self, period: &AuditPeriod) -> AuditQuery {
        let query = AuditQuery::between(period.start, period.end);
        match &self.endpoint {
            Some(endpoint) => query.at_endpoint(endpoint.clone()),
            None => query,
        }
    }

    fn governed<'a>(&self, records: &'a [AuditRecord]) -> Vec<&'a AuditRecord> {
        records
            .iter()
            .filter(|r| r.compliance_level() == Some(self.framework.as_str()))
            .collect()
    }

    /// Re-hash every record stored in the period and compare to its seal
    ///
    /// Covers all records in the window, whatever framework they were sealed
    /// under. Any mismatch raises a critical tampering alert.
    pub async fn verify_chain_integrity(&self, period: &AuditPeriod) -> Result<ChainIntegrity> {
        let records = self.sink.query(&self.query(period)).await?;
        Ok(self.check(period, &records).await)
    }

    async fn check(&self, period: &AuditPeriod, records: &[AuditRecord]) -> ChainIntegrity {
        let tampered: Vec<TamperedRecord> = records
            .iter()
            .filter(|r| !r.verify())
            .map(|r| TamperedRecord {
                audit_id: r.audit_id().map(str::to_string),
                stored_hash: r.integrity_hash().map(str::to_string),
                computed_hash: r.recompute_hash().ok(),
            })
            .collect();

        let alert_id = if tampered.is_empty() {
            None
        } else {
            let ids: Vec<&str> = tampered
                .iter()
                .map(|t| t.audit_id.as_deref().unwrap_or("<missing>"))
                .collect();
            tracing::error!(
                framework = %self.framework,
                tampered = tampered.len(),
                records = records.len(),
                audit_ids = %ids.join(","),
                "Audit record tampering detected"
            );
            let alert = self
                .alerts
                .trigger_with_detail(
                    TriggerKind::TamperingDetected,
                    Severity::Critical,
                    format!("{} tampered record(s): {}", tampered.len(), ids.join(", ")),
                )
                .await;
            Some(alert.id)
        };

        tracing::info!(
            framework = %self.framework,
            records = records.len(),
            valid = tampered.is_empty(),
            "Audit chain integrity verified"
        );

        ChainIntegrity {
            valid: tampered.is_empty(),
            period: *period,
            records_checked: records.len(),
            tampered,
            alert_id,
            verified_at: Utc::now(),
        }
    }

    /// Aggregate the framework's records over a period
    ///
    /// Fails with `AuditError::Integrity` if any record in the period does not
    /// verify.
    pub async fn generate_compliance_report(&self, period: &AuditPeriod) -> Result<ComplianceReport> {
        let records = self.sink.query(&self.query(period)).await?;
        let integrity = self.check(period, &records).await.into_result()?;
        let governed = self.governed(&records);

        let mut by_operation = BTreeMap::new();
        let mut by_entity_type = BTreeMap::new();
        let mut actors = BTreeSet::new();
        for record in &governed {
            bump(&mut by_operation, record.field_str(fields::OPERATION_TYPE));
            bump(&mut by_entity_type, record.field_str(fields::ENTITY_TYPE));
            if let Some(user) = record.user_id() {
                actors.insert(user);
            }
        }

        let sections = self
            .framework
            .profile()
            .map(|p| p.report_sections)
            .unwrap_or_default()
            .iter()
            .map(|section| summarize(*section, &governed))
            .collect();

        let report = ComplianceReport {
            report_id: format!("rpt-{}", uuid::Uuid::new_v4()),
            framework: self.framework.clone(),
            period: *period,
            retention: self.get_retention_policy(),
            total_records: governed.len(),
            by_operation,
            by_entity_type,
            unique_actors: actors.len(),
            sections,
            integrity,
            generated_at: Utc::now(),
        };

        tracing::info!(
            report_id = %report.report_id,
            framework = %self.framework,
            records = report.total_records,
            "Compliance report generated"
        );
        Ok(report)
    }

    /// Records of this framework whose retention window has ended at `now`
    ///
    /// The sink is append-only; callers decide what to do with these.
    pub async fn expired_records(&self, now: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        let policy = self.get_retention_policy();
        let cutoff = now - policy.duration();
        let query = AuditQuery::between(DateTime::<Utc>::default(), cutoff);
        let query = match &self.endpoint {
            Some(endpoint) => query.at_endpoint(endpoint.clone()),
            None => query,
        };

        let records = self.sink.query(&query).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.compliance_level() == Some(self.framework.as_str()))
            .filter(|r| matches!(r.audit_time(), Some(t) if policy.is_expired(t, now)))
            .collect())
    }
}

fn bump(counts: &mut BTreeMap<String, usize>, key: Option<&str>) {
    *counts
        .entry(key.unwrap_or(UNSPECIFIED).to_string())
        .or_default() += 1;
}

fn is_access(record: &AuditRecord) -> bool {
    record.field_str(fields::OPERATION_TYPE) == Some("access")
}

fn is_change(record: &AuditRecord) -> bool {
    matches!(
        record.field_str(fields::OPERATION_TYPE),
        Some("insert" | "update" | "delete" | "publish" | "archive")
    )
}

fn specified<'a>(record: &'a AuditRecord, field: &str) -> Option<&'a str> {
    record.field_str(field).filter(|v| *v != UNSPECIFIED)
}

fn summarize(section: ReportSection, records: &[&AuditRecord]) -> SectionSummary {
    match section {
        ReportSection::AccessJustifications => {
            let mut by_justification = BTreeMap::new();
            let mut unjustified = 0;
            for record in records.iter().filter(|r| is_access(r)) {
                match specified(record, "access_justification") {
                    Some(reason) => bump(&mut by_justification, Some(reason)),
                    None => unjustified += 1,
                }
            }
            SectionSummary::AccessJustifications {
                by_justification,
                unjustified,
            }
        }
        ReportSection::SecurityControls => {
            let mut by_control = BTreeMap::new();
            let mut changes = 0;
            let mut changes_with_ticket = 0;
            let mut self_approved = 0;
            for record in records {
                bump(&mut by_control, record.field_str("control_category"));
                if !is_change(record) {
                    continue;
                }
                changes += 1;
                if specified(record, "change_ticket").is_some() {
                    changes_with_ticket += 1;
                }
                if let (Some(approver), Some(actor)) = (specified(record, "approver"), record.user_id()) {
                    if approver == actor {
                        self_approved += 1;
                    }
                }
            }
            SectionSummary::SecurityControls {
                by_control,
                changes,
                changes_with_ticket,
                changes_without_ticket: changes - changes_with_ticket,
                self_approved,
            }
        }
        ReportSection::LawfulBasis => {
            let mut by_legal_basis = BTreeMap::new();
            let mut by_purpose = BTreeMap::new();
            let mut unspecified = 0;
            for record in records {
                match specified(record, "legal_basis") {
                    Some(basis) => bump(&mut by_legal_basis, Some(basis)),
                    None => unspecified += 1,
                }
                bump(&mut by_purpose, record.field_str("processing_purpose"));
            }
            SectionSummary::LawfulBasis {
                by_legal_basis,
                by_purpose,
                unspecified,
            }
        }
        ReportSection::AccessReview => {
            let mut by_actor = BTreeMap::new();
            let mut access_events = 0;
            let mut incomplete_context = 0;
            for record in records.iter().filter(|r| is_access(r)) {
                access_events += 1;
                bump(&mut by_actor, Some(record.user_id().unwrap_or(UNKNOWN)));
                if record.field("access_context_complete") != Some(&serde_json::Value::Bool(true)) {
                    incomplete_context += 1;
                }
            }
            SectionSummary::AccessReview {
                access_events,
                by_actor,
                incomplete_context,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::logger::AuditLogger;
    use crate::sink::memory::MemorySink;
    use crate::types::{AuditEvent, EntityType, OperationType};
    use chrono::Duration;
    use serde_json::json;

    struct Fixture {
        sink: Arc<MemorySink>,
        alerts: Arc<AlertSystem>,
        logger: AuditLogger,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                sink: Arc::new(MemorySink::new()),
                alerts: Arc::new(AlertSystem::new()),
                logger: AuditLogger::new(&AuditConfig::default()),
            }
        }

        fn trail(&self, framework: ComplianceFramework) -> ComplianceAuditTrail {
            ComplianceAuditTrail::new(framework, self.sink.clone(), self.alerts.clone())
        }

        async fn store(&self, event: AuditEvent, framework: ComplianceFramework) -> AuditRecord {
            let record = self.logger.seal_event(&event, &framework).unwrap();
            self.sink.write("audit-events", &record).await.unwrap();
            record
        }
    }

    fn access(user: &str) -> AuditEvent {
        AuditEvent::new(EntityType::User, "user-record-1", OperationType::Access, user)
            .with_request_context("/admin/users/1", "10.1.1.1", "Mozilla/5.0")
    }

    fn update(user: &str) -> AuditEvent {
        AuditEvent::new(EntityType::Content, "post-1", OperationType::Update, user)
            .with_before_data(json!({"title": "a"}))
            .with_after_data(json!({"title": "b"}))
    }

    fn last_hour() -> AuditPeriod {
        AuditPeriod::new(Utc::now() - Duration::hours(1), Utc::now() + Duration::seconds(1)).unwrap()
    }

    #[test]
    fn test_retention_policy_lookup() {
        let fx = Fixture::new();
        assert_eq!(fx.trail(ComplianceFramework::Hipaa).get_retention_policy().retention_days, 2190);
        assert_eq!(fx.trail(ComplianceFramework::General).get_retention_policy().retention_days, 90);
        assert_eq!(
            fx.trail(ComplianceFramework::from("internal-x"))
                .get_retention_policy()
                .retention_days,
            90
        );
    }

    #[tokio::test]
    async fn test_integrity_valid_for_untouched_records() {
        let fx = Fixture::new();
        fx.store(access("alice"), ComplianceFramework::Hipaa).await;
        fx.store(update("bob"), ComplianceFramework::Sox).await;

        let integrity = fx
            .trail(ComplianceFramework::Hipaa)
            .verify_chain_integrity(&last_hour())
            .await
            .unwrap();
        assert!(integrity.valid);
        assert_eq!(integrity.records_checked, 2);
        assert!(integrity.alert_id.is_none());
        assert!(fx.alerts.list_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_tampering_is_flagged_and_alerted() {
        let fx = Fixture::new();
        let record = fx.store(access("alice"), ComplianceFramework::Hipaa).await;

        let mut raw = serde_json::to_value(&record).unwrap();
        raw["fields"]["user_id"] = json!("mallory");
        fx.sink.overwrite(serde_json::from_value(raw).unwrap()).await.unwrap();

        let trail = fx.trail(ComplianceFramework::Hipaa);
        let integrity = trail.verify_chain_integrity(&last_hour()).await.unwrap();
        assert!(!integrity.valid);
        assert_eq!(integrity.tampered.len(), 1);
        assert_eq!(integrity.tampered[0].audit_id, record.audit_id().map(str::to_string));
        assert_ne!(integrity.tampered[0].stored_hash, integrity.tampered[0].computed_hash);

        let alert_id = integrity.alert_id.clone().unwrap();
        let alerts = fx.alerts.list_alerts().await;
        assert_eq!(alerts[0].id, alert_id);
        assert_eq!(alerts[0].trigger, TriggerKind::TamperingDetected);

        assert!(matches!(
            integrity.into_result(),
            Err(AuditError::Integrity { tampered: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_report_refused_when_tampered() {
        let fx = Fixture::new();
        let record = fx.store(access("alice"), ComplianceFramework::Hipaa).await;
        let mut raw = serde_json::to_value(&record).unwrap();
        raw["fields"]["access_justification"] = json!("treatment");
        fx.sink.overwrite(serde_json::from_value(raw).unwrap()).await.unwrap();

        let result = fx
            .trail(ComplianceFramework::Hipaa)
            .generate_compliance_report(&last_hour())
            .await;
        assert!(matches!(result, Err(AuditError::Integrity { .. })));
    }

    #[tokio::test]
    async fn test_hipaa_report_sections() {
        let fx = Fixture::new();
        fx.store(access("alice").with_metadata("justification", "treatment"), ComplianceFramework::Hipaa)
            .await;
        fx.store(access("alice"), ComplianceFramework::Hipaa).await;
        fx.store(
            AuditEvent::new(EntityType::User, "user-record-2", OperationType::Access, "bob"),
            ComplianceFramework::Hipaa,
        )
        .await;
        // Other frameworks are not part of this report
        fx.store(update("carol"), ComplianceFramework::Sox).await;

        let report = fx
            .trail(ComplianceFramework::Hipaa)
            .generate_compliance_report(&last_hour())
            .await
            .unwrap();

        assert_eq!(report.total_records, 3);
        assert_eq!(report.unique_actors, 2);
        assert_eq!(report.by_operation.get("access"), Some(&3));
        assert_eq!(report.retention.retention_days, 2190);
        assert!(report.integrity.valid);
        assert_eq!(report.integrity.records_checked, 4);

        match &report.sections[0] {
            SectionSummary::AccessJustifications {
                by_justification,
                unjustified,
            } => {
                assert_eq!(by_justification.get("treatment"), Some(&1));
                assert_eq!(*unjustified, 2);
            }
            other => panic!("unexpected section {:?}", other),
        }
        match &report.sections[1] {
            SectionSummary::AccessReview {
                access_events,
                by_actor,
                incomplete_context,
            } => {
                assert_eq!(*access_events, 3);
                assert_eq!(by_actor.get("alice"), Some(&2));
                assert_eq!(*incomplete_context, 1);
            }
            other => panic!("unexpected section {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sox_report_tracks_change_tickets() {
        let fx = Fixture::new();
        fx.store(
            update("dev-1")
                .with_metadata("change_ticket", "CHG-100")
                .with_metadata("approver", "lead-1"),
            ComplianceFramework::Sox,
        )
        .await;
        fx.store(
            update("dev-2").with_metadata("approver", "dev-2"),
            ComplianceFramework::Sox,
        )
        .await;

        let report = fx
            .trail(ComplianceFramework::Sox)
            .generate_compliance_report(&last_hour())
            .await
            .unwrap();

        match &report.sections[0] {
            SectionSummary::SecurityControls {
                by_control,
                changes,
                changes_with_ticket,
                changes_without_ticket,
                self_approved,
            } => {
                assert_eq!(by_control.get("itgc-change-management"), Some(&2));
                assert_eq!(*changes, 2);
                assert_eq!(*changes_with_ticket, 1);
                assert_eq!(*changes_without_ticket, 1);
                assert_eq!(*self_approved, 1);
            }
            other => panic!("unexpected section {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_custom_framework_report_has_no_sections() {
        let fx = Fixture::new();
        let framework = ComplianceFramework::from("internal-x");
        fx.store(update("alice"), framework.clone()).await;

        let report = fx
            .trail(framework)
            .generate_compliance_report(&last_hour())
            .await
            .unwrap();
        assert_eq!(report.total_records, 1);
        assert!(report.sections.is_empty());
    }

    #[tokio::test]
    async fn test_expired_records() {
        let fx = Fixture::new();
        let mut old = update("alice");
        old.audit_time = Utc::now() - Duration::days(120);
        fx.store(old.clone(), ComplianceFramework::General).await;
        fx.store(update("bob"), ComplianceFramework::General).await;

        let trail = fx.trail(ComplianceFramework::General);
        let expired = trail.expired_records(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].audit_id(), Some(old.audit_id.as_str()));

        // Nothing has outlived the six-year window
        let hipaa = fx.trail(ComplianceFramework::Hipaa);
        assert!(hipaa.expired_records(Utc::now()).await.unwrap().is_empty());
    }
}
