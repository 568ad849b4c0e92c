//! Sealed, hash-verified audit records
//!
//! An `AuditRecord` collects named fields while mutable, then `seal()` computes a
//! SHA-256 integrity hash over a canonical serialization and freezes it. Fields
//! live in a `BTreeMap`, so the canonical form is key-sorted regardless of the
//! order fields were set in. Nested JSON objects are sorted too (serde_json's
//! default map is ordered).

use crate::crypto::EncryptedAuditEvent;
use crate::error::{AuditError, Result};
use crate::types::{AuditEvent, DataSnapshot, EntityType, OperationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Prefix mixed into every hash so the canonical form can evolve
const HASH_DOMAIN: &[u8] = b"a3s-audit-record-v1\n";

/// Field names shared between the enricher, sinks and retrieval
pub mod fields {
    pub const AUDIT_ID: &str = "audit_id";
    pub const ENTITY_TYPE: &str = "entity_type";
    pub const ENTITY_ID: &str = "entity_id";
    pub const OPERATION_TYPE: &str = "operation_type";
    pub const AUDIT_TIME: &str = "audit_time";
    pub const USER_ID: &str = "user_id";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const TRACE_ID: &str = "trace_id";
    pub const ENVIRONMENT: &str = "environment";
    pub const APP_VERSION: &str = "app_version";
    pub const REQUEST_URL: &str = "request_url";
    pub const IP_ADDRESS: &str = "ip_address";
    pub const USER_AGENT: &str = "user_agent";
    pub const BEFORE_DATA: &str = "before_data";
    pub const AFTER_DATA: &str = "after_data";
    pub const METADATA: &str = "metadata";
    pub const ENCRYPTED_EVENT: &str = "encrypted_event";
    pub const COMPLIANCE_LEVEL: &str = "compliance_level";
    pub const COMPLIANCE_MODE: &str = "compliance_mode";
}

/// Immutable-once-sealed audit record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    fields: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    integrity_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    sealed_at: Option<DateTime<Utc>>,
}

impl AuditRecord {
    /// Create an empty, mutable record
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field on an unsealed record
    ///
    /// Returns `AuditError::Sealed` once the record is sealed; the field map is
    /// left untouched in that case.
    pub fn set_field(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Result<()> {
        let key = key.into();
        if self.is_sealed() {
            tracing::warn!(field = %key, "Rejected mutation of sealed audit record");
            return Err(AuditError::Sealed { field: key });
        }
        self.fields.insert(key, value.into());
        Ok(())
    }

    /// Seal the record, returning its integrity hash
    ///
    /// Sealing twice returns the existing hash; it is never recomputed.
    pub fn seal(&mut self) -> Result<String> {
        if let Some(hash) = &self.integrity_hash {
            return Ok(hash.clone());
        }
        let hash = compute_hash(&self.fields)?;
        self.integrity_hash = Some(hash.clone());
        self.sealed_at = Some(Utc::now());

        tracing::debug!(
            audit_id = ?self.audit_id(),
            fields = self.fields.len(),
            "Audit record sealed"
        );
        Ok(hash)
    }

    pub fn is_sealed(&self) -> bool {
        self.integrity_hash.is_some()
    }

    pub fn integrity_hash(&self) -> Option<&str> {
        self.integrity_hash.as_deref()
    }

    pub fn sealed_at(&self) -> Option<DateTime<Utc>> {
        self.sealed_at
    }

    pub fn fields(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// String value of a field, if present and a string
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// Recompute the hash over the current fields and compare to the stored one
    ///
    /// Unsealed records never verify.
    pub fn verify(&self) -> bool {
        match (&self.integrity_hash, compute_hash(&self.fields)) {
            (Some(stored), Ok(actual)) => *stored == actual,
            _ => false,
        }
    }

    /// Recompute the hash over the current fields
    pub fn recompute_hash(&self) -> Result<String> {
        compute_hash(&self.fields)
    }

    pub fn audit_id(&self) -> Option<&str> {
        self.field_str(fields::AUDIT_ID)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.field_str(fields::USER_ID)
    }

    pub fn audit_time(&self) -> Option<DateTime<Utc>> {
        self.field_str(fields::AUDIT_TIME)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn compliance_level(&self) -> Option<&str> {
        self.field_str(fields::COMPLIANCE_LEVEL)
    }

    /// The encryption envelope, for records of sensitive entities
    pub fn encrypted_envelope(&self) -> Result<Option<EncryptedAuditEvent>> {
        match self.field(fields::ENCRYPTED_EVENT) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Rebuild the event this record was sealed from
    ///
    /// Snapshots of encrypted records stay inside the envelope; the returned
    /// event carries none.
    pub fn to_event(&self) -> Result<AuditEvent> {
        let required = |key: &str| {
            self.field_str(key)
                .map(str::to_string)
                .ok_or_else(|| AuditError::missing(key))
        };
        let optional = |key: &str| self.field_str(key).map(str::to_string);

        let operation = required(fields::OPERATION_TYPE)?;
        let operation_type = OperationType::parse(&operation).ok_or_else(|| {
            AuditError::validation(
                fields::OPERATION_TYPE,
                format!("unrecognised operation '{}'", operation),
            )
        })?;
        let audit_time = self
            .audit_time()
            .ok_or_else(|| AuditError::missing(fields::AUDIT_TIME))?;
        let metadata = match self.field(fields::METADATA) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => BTreeMap::new(),
        };

        Ok(AuditEvent {
            audit_id: required(fields::AUDIT_ID)?,
            entity_type: EntityType::from(required(fields::ENTITY_TYPE)?),
            entity_id: required(fields::ENTITY_ID)?,
            operation_type: Some(operation_type),
            audit_time,
            user_id: required(fields::USER_ID)?,
            correlation_id: optional(fields::CORRELATION_ID).unwrap_or_default(),
            trace_id: optional(fields::TRACE_ID).unwrap_or_default(),
            data_snapshot: DataSnapshot {
                before: self.field(fields::BEFORE_DATA).cloned(),
                after: self.field(fields::AFTER_DATA).cloned(),
            },
            environment: optional(fields::ENVIRONMENT).unwrap_or_default(),
            app_version: optional(fields::APP_VERSION).unwrap_or_default(),
            request_url: optional(fields::REQUEST_URL),
            ip_address: optional(fields::IP_ADDRESS),
            user_agent: optional(fields::USER_AGENT),
            metadata,
        })
    }
}

/// SHA-256 over the domain prefix and the key-sorted JSON encoding of `fields`
fn compute_hash(fields: &BTreeMap<String, serde_json::Value>) -> Result<String> {
    let canonical = serde_json::to_vec(fields)?;
    let mut hasher = Sha256::new();
    hasher.update(HASH_DOMAIN);
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> AuditRecord {
        let mut record = AuditRecord::new();
        record.set_field("audit_id", "aud-1").unwrap();
        record.set_field("user_id", "user-7").unwrap();
        record
            .set_field("after_data", json!({"title": "Hello", "body": "World"}))
            .unwrap();
        record
    }

    #[test]
    fn test_seal_sets_hash_and_freezes() {
        let mut record = sample();
        assert!(!record.is_sealed());
        assert!(record.integrity_hash().is_none());

        let hash = record.seal().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(record.is_sealed());
        assert!(record.sealed_at().is_some());
        assert_eq!(record.integrity_hash(), Some(hash.as_str()));
    }

    #[test]
    fn test_seal_twice_keeps_hash() {
        let mut record = sample();
        let first = record.seal().unwrap();
        let sealed_at = record.sealed_at();
        let second = record.seal().unwrap();
        assert_eq!(first, second);
        assert_eq!(record.sealed_at(), sealed_at);
    }

    #[test]
    fn test_set_field_after_seal_is_rejected() {
        let mut record = sample();
        record.seal().unwrap();
        let before = record.fields().clone();

        let err = record.set_field("user_id", "attacker").unwrap_err();
        assert!(matches!(err, AuditError::Sealed { ref field } if field == "user_id"));

        let err = record.set_field("new_field", 1).unwrap_err();
        assert!(matches!(err, AuditError::Sealed { .. }));

        assert_eq!(record.fields(), &before);
        assert!(record.verify());
    }

    #[test]
    fn test_hash_independent_of_insertion_order() {
        let mut a = AuditRecord::new();
        a.set_field("b", 2).unwrap();
        a.set_field("a", "one").unwrap();
        a.set_field("c", json!({"y": 1, "x": 2})).unwrap();

        let mut b = AuditRecord::new();
        b.set_field("c", json!({"x": 2, "y": 1})).unwrap();
        b.set_field("a", "one").unwrap();
        b.set_field("b", 2).unwrap();

        assert_eq!(a.seal().unwrap(), b.seal().unwrap());
    }

    #[test]
    fn test_different_fields_different_hash() {
        let mut a = sample();
        let mut b = sample();
        b.set_field("user_id", "user-8").unwrap();
        assert_ne!(a.seal().unwrap(), b.seal().unwrap());
    }

    #[test]
    fn test_verify_detects_tampering_after_roundtrip() {
        let mut record = sample();
        record.seal().unwrap();
        assert!(record.verify());

        let mut raw = serde_json::to_value(&record).unwrap();
        raw["fields"]["user_id"] = json!("someone-else");
        let tampered: AuditRecord = serde_json::from_value(raw).unwrap();

        assert!(tampered.is_sealed());
        assert!(!tampered.verify());
    }

    #[test]
    fn test_unsealed_record_does_not_verify() {
        assert!(!sample().verify());
    }

    #[test]
    fn test_typed_accessors() {
        let mut record = sample();
        record
            .set_field("audit_time", "2026-03-01T12:00:00+00:00")
            .unwrap();
        assert_eq!(record.audit_id(), Some("aud-1"));
        assert_eq!(record.user_id(), Some("user-7"));
        assert_eq!(
            record.audit_time().unwrap().to_rfc3339(),
            "2026-03-01T12:00:00+00:00"
        );
    }

    #[test]
    fn test_sealed_record_is_shareable_across_threads() {
        let mut record = sample();
        let hash = record.seal().unwrap();
        let shared = std::sync::Arc::new(record);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = std::sync::Arc::clone(&shared);
                std::thread::spawn(move || r.verify() && r.fields().len() == 3)
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(shared.integrity_hash(), Some(hash.as_str()));
    }

    #[test]
    fn test_to_event_rebuilds_sealed_event() {
        use crate::config::AuditConfig;
        use crate::framework::ComplianceFramework;
        use crate::logger::AuditLogger;

        let event = AuditEvent::new(EntityType::Content, "post-1", OperationType::Update, "user-7")
            .with_before_data(json!({"title": "Draft"}))
            .with_after_data(json!({"title": "Final"}))
            .with_request_context("/api/posts/1", "10.0.0.5", "curl/8.0")
            .with_metadata("justification", "editorial fix");
        let record = AuditLogger::new(&AuditConfig::default())
            .seal_event(&event, &ComplianceFramework::Hipaa)
            .unwrap();

        let rebuilt = record.to_event().unwrap();
        assert_eq!(rebuilt.audit_id, event.audit_id);
        assert_eq!(rebuilt.audit_time, event.audit_time);
        assert_eq!(rebuilt.data_snapshot, event.data_snapshot);
        assert_eq!(rebuilt.metadata, event.metadata);
        assert_eq!(rebuilt.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(rebuilt.environment, "development");
        assert!(record.encrypted_envelope().unwrap().is_none());
    }

    #[test]
    fn test_to_event_requires_core_fields() {
        let mut record = sample();
        record.seal().unwrap();
        let err = record.to_event().unwrap_err();
        assert!(matches!(err, AuditError::Validation { ref field, .. } if field == "operation_type"));
    }
}
