//! Recovery outbox: sealed records waiting for a durable write
//!
//! Records land here when every write attempt against the sink failed, or
//! when a caller hands them off through `AuditService::enqueue`. The outbox
//! never evicts: a full in-memory outbox rejects new entries instead of
//! dropping old ones, and the file outbox survives restarts.

use crate::error::{AuditError, Result};
use crate::record::AuditRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// A sealed record pending replay to its endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub endpoint: String,

    pub record: AuditRecord,

    /// Last failure that sent the record here
    pub reason: String,

    pub enqueued_at: DateTime<Utc>,

    /// Replay attempts made so far
    #[serde(default)]
    pub attempts: u32,
}

impl OutboxEntry {
    pub fn new(endpoint: impl Into<String>, record: AuditRecord, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            record,
            reason: reason.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn audit_id(&self) -> Option<&str> {
        self.record.audit_id()
    }
}

/// Durable holding area for records the sink could not accept
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Store an entry; an entry with an audit ID already present replaces it
    async fn enqueue(&self, entry: OutboxEntry) -> Result<()>;

    /// Pending entries, oldest first
    async fn pending(&self) -> Result<Vec<OutboxEntry>>;

    /// Drop an entry once its record is durably stored
    async fn remove(&self, audit_id: &str) -> Result<bool>;

    /// Record a failed replay against an entry
    async fn mark_attempt(&self, audit_id: &str, reason: &str) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

fn entry_id(entry: &OutboxEntry) -> Result<&str> {
    entry.audit_id().ok_or_else(|| AuditError::missing("audit_id"))
}

fn upsert(entries: &mut Vec<OutboxEntry>, entry: OutboxEntry, audit_id: &str) {
    match entries
        .iter_mut()
        .find(|e| e.audit_id() == Some(audit_id))
    {
        Some(existing) => {
            existing.reason = entry.reason;
            existing.record = entry.record;
        }
        None => entries.push(entry),
    }
}

fn note_attempt(entries: &mut [OutboxEntry], audit_id: &str, reason: &str) -> bool {
    match entries.iter_mut().find(|e| e.audit_id() == Some(audit_id)) {
        Some(entry) => {
            entry.attempts = entry.attempts.saturating_add(1);
            entry.reason = reason.to_string();
            true
        }
        None => false,
    }
}

/// In-memory outbox for development and testing
///
/// Capacity-bounded; `enqueue` fails once the bound is reached.
pub struct MemoryOutbox {
    entries: Arc<RwLock<Vec<OutboxEntry>>>,
    capacity: usize,
}

impl MemoryOutbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            capacity,
        }
    }
}

impl Default for MemoryOutbox {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn enqueue(&self, entry: OutboxEntry) -> Result<()> {
        let audit_id = entry_id(&entry)?.to_string();
        let mut entries = self.entries.write().await;

        let present = entries.iter().any(|e| e.audit_id() == Some(audit_id.as_str()));
        if !present && entries.len() >= self.capacity {
            return Err(AuditError::Outbox(format!(
                "outbox full ({} entries), cannot queue {}",
                self.capacity, audit_id
            )));
        }

        tracing::warn!(
            audit_id = %audit_id,
            endpoint = %entry.endpoint,
            reason = %entry.reason,
            "Audit record queued for recovery"
        );
        upsert(&mut entries, entry, &audit_id);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<OutboxEntry>> {
        let mut entries = self.entries.read().await.clone();
        entries.sort_by_key(|e| e.enqueued_at);
        Ok(entries)
    }

    async fn remove(&self, audit_id: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.audit_id() != Some(audit_id));
        Ok(entries.len() < before)
    }

    async fn mark_attempt(&self, audit_id: &str, reason: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if note_attempt(&mut entries, audit_id, reason) {
            Ok(())
        } else {
            Err(AuditError::NotFound(format!("Outbox entry not found: {}", audit_id)))
        }
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// JSON file outbox
///
/// The whole queue is rewritten on each change. Writes go through a synced
/// temp file and a rename, so a crash or power loss never leaves a
/// half-written queue behind.
pub struct FileOutbox {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileOutbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<OutboxEntry>> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AuditError::Outbox(format!(
                    "Failed to read outbox file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&json).map_err(|e| {
            AuditError::Outbox(format!(
                "Failed to parse outbox file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Persist the rename itself
    #[cfg(unix)]
    async fn sync_parent(&self) -> Result<()> {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        let synced: std::io::Result<()> = async {
            tokio::fs::File::open(parent).await?.sync_all().await
        }
        .await;
        synced.map_err(|e| {
            AuditError::Outbox(format!(
                "Failed to sync outbox directory {}: {}",
                parent.display(),
                e
            ))
        })
    }

    #[cfg(not(unix))]
    async fn sync_parent(&self) -> Result<()> {
        Ok(())
    }

    /// Write to a synced temp file, rename over the queue, then sync the
    /// directory. `enqueue` returns only after all three.
    async fn save(&self, entries: &[OutboxEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AuditError::Outbox(format!(
                    "Failed to create outbox directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let written: std::io::Result<()> = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await
        }
        .await;
        written.map_err(|e| {
            AuditError::Outbox(format!(
                "Failed to write outbox file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            AuditError::Outbox(format!(
                "Failed to rename outbox file {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.sync_parent().await?;

        tracing::debug!(path = %self.path.display(), count = entries.len(), "Outbox saved");
        Ok(())
    }
}

#[async_trait]
impl Outbox for FileOutbox {
    async fn enqueue(&self, entry: OutboxEntry) -> Result<()> {
        let audit_id = entry_id(&entry)?.to_string();
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        tracing::warn!(
            audit_id = %audit_id,
            endpoint = %entry.endpoint,
            reason = %entry.reason,
            path = %self.path.display(),
            "Audit record queued for recovery"
        );
        upsert(&mut entries, entry, &audit_id);
        self.save(&entries).await
    }

    async fn pending(&self) -> Result<Vec<OutboxEntry>> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.sort_by_key(|e| e.enqueued_at);
        Ok(entries)
    }

    async fn remove(&self, audit_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|e| e.audit_id() != Some(audit_id));
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries).await?;
        Ok(true)
    }

    async fn mark_attempt(&self, audit_id: &str, reason: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if !note_attempt(&mut entries, audit_id, reason) {
            return Err(AuditError::NotFound(format!(
                "Outbox entry not found: {}",
                audit_id
            )));
        }
        self.save(&entries).await
    }

    async fn count(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(audit_id: &str) -> OutboxEntry {
        let mut record = AuditRecord::new();
        record.set_field("audit_id", audit_id).unwrap();
        record.seal().unwrap();
        OutboxEntry::new("audit-events", record, "sink unavailable")
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("a3s-audit-outbox-{}", uuid::Uuid::new_v4()))
            .join("outbox.json")
    }

    #[tokio::test]
    async fn test_memory_enqueue_and_remove() {
        let outbox = MemoryOutbox::default();
        outbox.enqueue(entry("aud-1")).await.unwrap();
        outbox.enqueue(entry("aud-2")).await.unwrap();
        assert_eq!(outbox.count().await.unwrap(), 2);

        let pending = outbox.pending().await.unwrap();
        assert_eq!(pending[0].audit_id(), Some("aud-1"));

        assert!(outbox.remove("aud-1").await.unwrap());
        assert!(!outbox.remove("aud-1").await.unwrap());
        assert_eq!(outbox.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_full_rejects_instead_of_dropping() {
        let outbox = MemoryOutbox::new(2);
        outbox.enqueue(entry("aud-1")).await.unwrap();
        outbox.enqueue(entry("aud-2")).await.unwrap();

        let result = outbox.enqueue(entry("aud-3")).await;
        assert!(matches!(result, Err(AuditError::Outbox(_))));

        let ids: Vec<_> = outbox
            .pending()
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.audit_id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["aud-1", "aud-2"]);

        // Re-queueing an existing entry is allowed at capacity
        assert!(outbox.enqueue(entry("aud-2")).await.is_ok());
    }

    #[test]
    fn test_memory_enqueue_is_idempotent() {
        let outbox = MemoryOutbox::default();
        tokio_test::block_on(async {
            outbox.enqueue(entry("aud-1")).await.unwrap();
            outbox.enqueue(entry("aud-1")).await.unwrap();
            assert_eq!(outbox.count().await.unwrap(), 1);
        });
    }

    #[tokio::test]
    async fn test_mark_attempt() {
        let outbox = MemoryOutbox::default();
        outbox.enqueue(entry("aud-1")).await.unwrap();
        outbox.mark_attempt("aud-1", "still down").await.unwrap();

        let pending = outbox.pending().await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].reason, "still down");

        assert!(outbox.mark_attempt("aud-x", "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_file_outbox_survives_reopen() {
        let path = temp_path();
        {
            let outbox = FileOutbox::new(&path);
            outbox.enqueue(entry("aud-1")).await.unwrap();
            outbox.enqueue(entry("aud-2")).await.unwrap();
        }

        let reopened = FileOutbox::new(&path);
        let pending = reopened.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|e| e.record.verify()));
        assert!(!path.with_extension("tmp").exists());

        assert!(reopened.remove("aud-1").await.unwrap());
        assert_eq!(FileOutbox::new(&path).count().await.unwrap(), 1);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_file_outbox_entry_on_disk_when_enqueue_returns() {
        let path = temp_path();
        let outbox = FileOutbox::new(&path);
        outbox.enqueue(entry("aud-1")).await.unwrap();

        // Read back with a plain std reader, outside the outbox's lock
        let on_disk: Vec<OutboxEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].audit_id(), Some("aud-1"));
        assert!(on_disk[0].record.verify());
        assert!(!path.with_extension("tmp").exists());

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_file_outbox_missing_file_is_empty() {
        let outbox = FileOutbox::new(temp_path());
        assert_eq!(outbox.count().await.unwrap(), 0);
        assert!(!outbox.remove("aud-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_outbox_corrupt_file_errors() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let outbox = FileOutbox::new(&path);
        assert!(matches!(outbox.pending().await, Err(AuditError::Outbox(_))));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
