//! Compliance field enrichment
//!
//! `AuditLogger` turns an `AuditEvent` into a sealed `AuditRecord`: core event
//! fields, then the framework profile's tags, then operation-specific fields.
//! Sensitive events are encrypted first when an encryptor is attached, and the
//! record carries the envelope instead of the plaintext snapshots.

use crate::config::AuditConfig;
use crate::crypto::{AuditEncryptor, EncryptedAuditEvent};
use crate::error::{AuditError, Result};
use crate::framework::{ComplianceFramework, UNSPECIFIED};
use crate::record::{fields, AuditRecord};
use crate::types::{AuditEvent, OperationType};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Sentinel for access context the caller did not supply
pub const UNKNOWN: &str = "unknown";

/// How snapshot data lands in the record
enum SnapshotFields<'a> {
    Plain,
    Encrypted(&'a EncryptedAuditEvent),
}

/// Compliance field enricher and sealer
pub struct AuditLogger {
    environment: String,
    app_version: String,
    encrypt_sensitive: bool,
    encryptor: Option<Arc<dyn AuditEncryptor>>,
}

impl AuditLogger {
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            environment: config.environment.clone(),
            app_version: config.app_version.clone(),
            encrypt_sensitive: config.encryption.enabled,
            encryptor: None,
        }
    }

    /// Attach the encryptor used for sensitive entities
    pub fn with_encryptor(mut self, encryptor: Arc<dyn AuditEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn encryptor(&self) -> Option<&Arc<dyn AuditEncryptor>> {
        self.encryptor.as_ref()
    }

    /// Enrich and seal an event with plaintext snapshots
    pub fn enrich(&self, event: &AuditEvent, framework: &ComplianceFramework) -> Result<AuditRecord> {
        self.build(event, framework, SnapshotFields::Plain)
    }

    /// Validate, encrypt if the entity is sensitive, then enrich and seal
    ///
    /// Fails closed: a sensitive event is never sealed in plaintext while
    /// encryption is enabled.
    pub fn seal_event(
        &self,
        event: &AuditEvent,
        framework: &ComplianceFramework,
    ) -> Result<AuditRecord> {
        event.validate()?;

        if !(self.encrypt_sensitive && event.entity_type.is_sensitive()) {
            return self.build(event, framework, SnapshotFields::Plain);
        }

        let encryptor = self.encryptor.as_ref().ok_or_else(|| {
            AuditError::Encryption(format!(
                "Encryption enabled but no encryptor configured for sensitive entity '{}'",
                event.entity_type
            ))
        })?;
        let encrypted = encryptor.encrypt(event)?;
        self.build(event, framework, SnapshotFields::Encrypted(&encrypted))
    }

    fn build(
        &self,
        event: &AuditEvent,
        framework: &ComplianceFramework,
        snapshots: SnapshotFields<'_>,
    ) -> Result<AuditRecord> {
        event.validate()?;
        let operation = event.operation()?;
        check_snapshots(event, operation)?;

        let mut record = AuditRecord::new();
        self.write_core(&mut record, event, &snapshots)?;
        write_framework(&mut record, event, framework)?;
        write_operation(&mut record, event, operation)?;
        record.seal()?;

        tracing::debug!(
            audit_id = %event.audit_id,
            framework = %framework,
            operation = %operation,
            encrypted = matches!(snapshots, SnapshotFields::Encrypted(_)),
            "Audit event enriched"
        );
        Ok(record)
    }

    fn write_core(
        &self,
        record: &mut AuditRecord,
        event: &AuditEvent,
        snapshots: &SnapshotFields<'_>,
    ) -> Result<()> {
        let environment = if event.environment.is_empty() {
            &self.environment
        } else {
            &event.environment
        };
        let app_version = if event.app_version.is_empty() {
            &self.app_version
        } else {
            &event.app_version
        };

        record.set_field(fields::AUDIT_ID, event.audit_id.as_str())?;
        record.set_field(fields::ENTITY_TYPE, event.entity_type.as_str())?;
        record.set_field(fields::ENTITY_ID, event.entity_id.as_str())?;
        record.set_field(fields::OPERATION_TYPE, event.operation()?.as_str())?;
        record.set_field(fields::AUDIT_TIME, event.audit_time.to_rfc3339())?;
        record.set_field(fields::USER_ID, event.user_id.as_str())?;
        record.set_field(fields::CORRELATION_ID, event.correlation_id.as_str())?;
        record.set_field(fields::TRACE_ID, event.trace_id.as_str())?;
        record.set_field(fields::ENVIRONMENT, environment.as_str())?;
        record.set_field(fields::APP_VERSION, app_version.as_str())?;

        if let Some(url) = &event.request_url {
            record.set_field(fields::REQUEST_URL, url.as_str())?;
        }
        if let Some(ip) = &event.ip_address {
            record.set_field(fields::IP_ADDRESS, ip.as_str())?;
        }
        if let Some(ua) = &event.user_agent {
            record.set_field(fields::USER_AGENT, ua.as_str())?;
        }
        if !event.metadata.is_empty() {
            record.set_field(fields::METADATA, serde_json::to_value(&event.metadata)?)?;
        }

        match snapshots {
            SnapshotFields::Plain => {
                if let Some(before) = &event.data_snapshot.before {
                    record.set_field(fields::BEFORE_DATA, before.clone())?;
                }
                if let Some(after) = &event.data_snapshot.after {
                    record.set_field(fields::AFTER_DATA, after.clone())?;
                }
            }
            SnapshotFields::Encrypted(envelope) => {
                record.set_field(fields::ENCRYPTED_EVENT, serde_json::to_value(envelope)?)?;
            }
        }
        Ok(())
    }
}

/// Snapshot requirements per operation; nothing is ever fabricated
fn check_snapshots(event: &AuditEvent, operation: OperationType) -> Result<()> {
    let snapshot = &event.data_snapshot;
    let needs_before = matches!(operation, OperationType::Delete | OperationType::Update);
    let needs_after = matches!(operation, OperationType::Insert | OperationType::Update);

    if needs_before && snapshot.before.is_none() {
        return Err(AuditError::validation(
            fields::BEFORE_DATA,
            format!("{} events require a before snapshot", operation),
        ));
    }
    if needs_after && snapshot.after.is_none() {
        return Err(AuditError::validation(
            fields::AFTER_DATA,
            format!("{} events require an after snapshot", operation),
        ));
    }
    Ok(())
}

fn write_framework(
    record: &mut AuditRecord,
    event: &AuditEvent,
    framework: &ComplianceFramework,
) -> Result<()> {
    record.set_field(fields::COMPLIANCE_LEVEL, framework.as_str())?;

    let Some(profile) = framework.profile() else {
        tracing::warn!(
            audit_id = %event.audit_id,
            framework = %framework,
            "Unknown compliance framework, enriching core fields only"
        );
        record.set_field(fields::COMPLIANCE_MODE, "core-only")?;
        return Ok(());
    };

    record.set_field(fields::COMPLIANCE_MODE, "full")?;
    record.set_field("retention_days", profile.retention_days)?;
    for (key, value) in profile.static_fields {
        record.set_field(*key, *value)?;
    }
    for (field, metadata_key) in profile.metadata_fields {
        let value = event
            .metadata
            .get(*metadata_key)
            .map(String::as_str)
            .unwrap_or(UNSPECIFIED);
        record.set_field(*field, value)?;
    }
    Ok(())
}

fn write_operation(
    record: &mut AuditRecord,
    event: &AuditEvent,
    operation: OperationType,
) -> Result<()> {
    let snapshot = &event.data_snapshot;
    match operation {
        OperationType::Insert => {
            record.set_field("change_kind", "creation")?;
        }
        OperationType::Update => {
            record.set_field("change_kind", "modification")?;
            if let (Some(before), Some(after)) = (&snapshot.before, &snapshot.after) {
                record.set_field("changed_fields", changed_fields(before, after))?;
            }
        }
        OperationType::Delete => {
            record.set_field("change_kind", "removal")?;
            if let Some(before) = &snapshot.before {
                record.set_field("before_state_digest", digest(before)?)?;
            }
        }
        OperationType::Publish => {
            record.set_field("state_transition", "published")?;
        }
        OperationType::Archive => {
            record.set_field("state_transition", "archived")?;
        }
        OperationType::Access => {
            let ip = event.ip_address.as_deref().filter(|s| !s.is_empty());
            let ua = event.user_agent.as_deref().filter(|s| !s.is_empty());
            record.set_field("access_ip", ip.unwrap_or(UNKNOWN))?;
            record.set_field("access_user_agent", ua.unwrap_or(UNKNOWN))?;
            record.set_field("access_context_complete", ip.is_some() && ua.is_some())?;
        }
    }
    Ok(())
}

/// Sorted top-level keys whose values differ between two snapshots
fn changed_fields(before: &Value, after: &Value) -> Value {
    match (before.as_object(), after.as_object()) {
        (Some(b), Some(a)) => {
            let keys: BTreeSet<&String> = b.keys().chain(a.keys()).collect();
            let changed: Vec<Value> = keys
                .into_iter()
                .filter(|k| b.get(*k) != a.get(*k))
                .map(|k| Value::String(k.clone()))
                .collect();
            Value::Array(changed)
        }
        _ if before != after => Value::Array(vec![Value::String("$".to_string())]),
        _ => Value::Array(Vec::new()),
    }
}

fn digest(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
