//! # a3s-audit
//!
//! Tamper-evident, retention-governed compliance audit pipeline for the A3S
//! ecosystem.
//!
//! ## Overview
//!
//! `a3s-audit` turns a domain mutation or access into a sealed, hash-verified
//! `AuditRecord`, enriched with the fields its compliance framework requires,
//! optionally encrypted, and persisted to a durable sink without loss. Sinks
//! are pluggable (in-memory, JSON lines file, NATS JetStream).
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_audit::{AuditConfig, AuditEvent, AuditService, ComplianceFramework, EntityType, OperationType};
//! use a3s_audit::sink::memory::MemorySink;
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let service = AuditService::new(AuditConfig::default(), Arc::new(MemorySink::new()))?;
//!
//! let event = AuditEvent::new(EntityType::Content, "post-42", OperationType::Insert, "user-7")
//!     .with_after_data(serde_json::json!({"title": "Hello"}));
//!
//! let record = service.log_audit_event(&event, &ComplianceFramework::Hipaa).await?;
//! assert!(record.verify());
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! - **AuditEvent**: one fact about one operation, validated before sealing
//! - **AuditLogger**: framework and operation enrichment, then sealing
//! - **Aes256GcmEncryptor**: envelope encryption for sensitive entities, with key rotation
//! - **AuditPersistence**: per-item writes with retry, outbox fallback and recovery
//! - **ComplianceAuditTrail**: retention, integrity verification and reports
//! - **AlertSystem**: playbook-driven alerts with escalation and their own trail

pub mod alert;
pub mod compliance;
pub mod config;
pub mod crypto;
pub mod error;
pub mod framework;
pub mod logger;
pub mod outbox;
pub mod persistence;
pub mod record;
pub mod service;
pub mod sink;
pub mod types;

// Re-export core types
pub use alert::{
    AlertNotifier, AlertSystem, AlertTrailEntry, AuditAlert, Escalation, NotificationChannel,
    Responder, ResponseAction, Severity, TracingNotifier, TriggerKind,
};
pub use compliance::{ChainIntegrity, ComplianceAuditTrail, ComplianceReport, SectionSummary};
pub use config::{AuditConfig, EncryptionConfig, PersistenceConfig};
pub use crypto::{
    Aes256GcmEncryptor, AuditEncryptor, EncryptedAuditEvent, KeyMaterial, KeyProvider,
    MemoryKeyProvider,
};
pub use error::{AuditError, ErrorKind, Result};
pub use framework::{ComplianceFramework, RetentionPolicy};
pub use logger::AuditLogger;
pub use outbox::{FileOutbox, MemoryOutbox, Outbox, OutboxEntry};
pub use persistence::{AuditPersistence, ItemError, PersistenceResult, RecoveryStatus};
pub use record::AuditRecord;
pub use service::{AuditService, AuditServiceBuilder, OutboxWorker};
pub use sink::{AuditQuery, AuditSink, StoredRecord};
pub use types::{AuditEvent, AuditPeriod, DataSnapshot, EntityType, OperationType};

// Re-export sinks for convenience
pub use sink::file::FileSink;
pub use sink::memory::MemorySink;
pub use sink::nats::{NatsSink, NatsSinkConfig, StorageType};
