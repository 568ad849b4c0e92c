//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// A required field is missing or invalid on an event or enrichment input
    #[error("Validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Mutation attempted on a sealed record
    #[error("Record is sealed, refusing to modify field '{field}'")]
    Sealed { field: String },

    /// Durable sink rejected or could not accept a write
    #[error("Failed to persist audit record to '{endpoint}': {reason}")]
    Persistence { endpoint: String, reason: String },

    /// Sink connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation did not complete before its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Stored fields no longer match their integrity hash
    #[error("Integrity violation on {tampered} record(s): {detail}")]
    Integrity { tampered: usize, detail: String },

    /// Encryption or decryption failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// No usable key for the requested key ID
    #[error("Key '{key_id}' unavailable: {reason}")]
    KeyUnavailable { key_id: String, reason: String },

    /// Recovery queue failure
    #[error("Outbox error: {0}")]
    Outbox(String),

    /// Alert notification failure
    #[error("Failed to notify channel '{channel}': {reason}")]
    Notification { channel: String, reason: String },

    /// Requested item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure categories used for propagation and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Caller-fixable, never retried
    Validation,
    /// Sink unavailable or slow, retried with backoff
    Persistence,
    /// Tampering detected, never auto-corrected
    Integrity,
    /// Missing or expired key, fails closed
    Encryption,
    /// Misconfiguration, fails fast
    Configuration,
}

impl AuditError {
    /// Create a validation error for a named field
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing-field validation error
    pub fn missing(field: impl Into<String>) -> Self {
        Self::validation(field, "required field is missing")
    }

    /// Map this error onto the pipeline's failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Sealed { .. } | Self::NotFound(_) => {
                ErrorKind::Validation
            }
            Self::Persistence { .. }
            | Self::Connection(_)
            | Self::Timeout(_)
            | Self::Outbox(_)
            | Self::Notification { .. } => ErrorKind::Persistence,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Encryption(_) | Self::KeyUnavailable { .. } => ErrorKind::Encryption,
            Self::Config(_) | Self::Serialization(_) => ErrorKind::Configuration,
        }
    }

    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Persistence { .. } | Self::Connection(_) | Self::Timeout(_)
        )
    }
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
