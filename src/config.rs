//! Audit pipeline configuration
//!
//! One `AuditConfig` value is built at startup (from a JSON file or in code)
//! and handed to each component's constructor.

use crate::error::{AuditError, Result};
use crate::framework::ComplianceFramework;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub app_version: String,

    /// Framework used when a caller does not name one
    #[serde(default = "default_framework")]
    pub default_framework: ComplianceFramework,

    /// Sink endpoint used when a caller does not name one
    #[serde(default = "default_endpoint")]
    pub default_endpoint: String,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Alerts kept in memory; acknowledged ones are evicted first
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            app_version: String::new(),
            default_framework: default_framework(),
            default_endpoint: default_endpoint(),
            persistence: PersistenceConfig::default(),
            encryption: EncryptionConfig::default(),
            max_alerts: default_max_alerts(),
        }
    }
}

fn default_environment() -> String {
    "development".into()
}

fn default_framework() -> ComplianceFramework {
    ComplianceFramework::General
}

fn default_endpoint() -> String {
    "audit-events".into()
}

fn default_max_alerts() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    /// Must stay true: audit events are never silently dropped
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Write attempts per record, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Deadline for a single write attempt
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Queue records that exhaust their retries for later replay
    #[serde(default = "default_true")]
    pub recovery_enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            recovery_enabled: true,
        }
    }
}

impl PersistenceConfig {
    /// Delay before retry number `retry` (1-based), doubling up to the cap
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_backoff_ms))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    4
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_write_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    /// Encrypt events for sensitive entities before sealing
    #[serde(default)]
    pub enabled: bool,

    /// How long a retired key stays usable for decryption
    #[serde(default = "default_grace_days")]
    pub key_grace_period_days: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_grace_period_days: default_grace_days(),
        }
    }
}

impl EncryptionConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.key_grace_period_days))
    }
}

fn default_grace_days() -> u32 {
    ComplianceFramework::max_retention_days()
}

impl AuditConfig {
    /// Load configuration from a JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: AuditConfig = serde_json::from_str(&json).map_err(|e| {
            AuditError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Audit config loaded");
        Ok(config)
    }

    /// Reject configurations that would lose events or strand ciphertext
    pub fn validate(&self) -> Result<()> {
        if !self.persistence.enabled {
            return Err(AuditError::Config(
                "Audit persistence is disabled; events would be dropped".to_string(),
            ));
        }
        if self.persistence.max_attempts == 0 {
            return Err(AuditError::Config(
                "persistence.maxAttempts must be >= 1".to_string(),
            ));
        }
        if self.persistence.write_timeout_ms == 0 {
            return Err(AuditError::Config(
                "persistence.writeTimeoutMs must be > 0".to_string(),
            ));
        }
        if self.default_endpoint.trim().is_empty() {
            return Err(AuditError::Config("defaultEndpoint cannot be empty".to_string()));
        }
        if self.max_alerts == 0 {
            return Err(AuditError::Config("maxAlerts must be >= 1".to_string()));
        }
        if self.environment.trim().is_empty() {
            return Err(AuditError::Config("environment cannot be empty".to_string()));
        }
        let max_retention = ComplianceFramework::max_retention_days();
        if self.encryption.enabled && self.encryption.key_grace_period_days < max_retention {
            return Err(AuditError::Config(format!(
                "encryption.keyGracePeriodDays ({}) is shorter than the longest retention window ({} days)",
                self.encryption.key_grace_period_days, max_retention
            )));
        }
        Ok(())
    }
}
