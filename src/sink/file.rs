//! Append-only JSON Lines audit sink
//!
//! One `StoredRecord` per line. Every write is flushed and synced before it is
//! reported as persisted.

use super::{AuditQuery, AuditSink, StoredRecord};
use crate::error::{AuditError, Result};
use crate::record::AuditRecord;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct FileHandle {
    file: tokio::fs::File,
    /// Endpoint and audit ID of every line in the file, for idempotent writes
    seen: HashSet<(String, String)>,
}

pub struct FileSink {
    path: PathBuf,
    handle: Mutex<Option<FileHandle>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: Mutex::new(None),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<FileHandle> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AuditError::Config(format!(
                    "Failed to create audit log directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let seen = read_stored(&self.path)
            .await?
            .into_iter()
            .filter_map(|s| {
                s.record
                    .audit_id()
                    .map(|id| (s.endpoint.clone(), id.to_string()))
            })
            .collect();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.transient(format!("failed to open {}: {}", self.path.display(), e)))?;

        tracing::debug!(path = %self.path.display(), "Audit log file opened");
        Ok(FileHandle { file, seen })
    }

    fn transient(&self, reason: String) -> AuditError {
        AuditError::Persistence {
            endpoint: self.path.display().to_string(),
            reason,
        }
    }
}

/// Parse every well-formed line; malformed lines are logged and skipped
async fn read_stored(path: &Path) -> Result<Vec<StoredRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(AuditError::Persistence {
                endpoint: path.display().to_string(),
                reason: format!("failed to read audit log: {}", e),
            })
        }
    };

    let mut stored = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredRecord>(line) {
            Ok(record) => stored.push(record),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping malformed audit log line"
            ),
        }
    }
    Ok(stored)
}

#[async_trait]
impl AuditSink for FileSink {
    async fn write(&self, endpoint: &str, record: &AuditRecord) -> Result<()> {
        let audit_id = record
            .audit_id()
            .ok_or_else(|| AuditError::missing("audit_id"))?;

        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let handle = guard
            .as_mut()
            .ok_or_else(|| self.transient("file handle not initialized".to_string()))?;

        let key = (endpoint.to_string(), audit_id.to_string());
        if handle.seen.contains(&key) {
            tracing::debug!(audit_id = %audit_id, endpoint = %endpoint, "Duplicate audit record ignored");
            return Ok(());
        }

        let stored = StoredRecord::new(endpoint, record.clone());
        let mut line = serde_json::to_string(&stored)?;
        line.push('\n');

        let written: std::io::Result<()> = async {
            handle.file.write_all(line.as_bytes()).await?;
            handle.file.flush().await?;
            handle.file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            // Drop the handle so the next attempt reopens and re-indexes
            *guard = None;
            return Err(self.transient(format!("failed to append audit record: {}", e)));
        }

        handle.seen.insert(key);
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let _guard = self.handle.lock().await;
        Ok(read_stored(&self.path)
            .await?
            .into_iter()
            .filter(|s| query.matches(s))
            .map(|s| s.record)
            .collect())
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("a3s-audit-test-{}", uuid::Uuid::new_v4()))
            .join("nested")
            .join("audit.jsonl")
    }

    fn sealed(audit_id: &str, user: &str) -> AuditRecord {
        let mut r = AuditRecord::new();
        r.set_field("audit_id", audit_id).unwrap();
        r.set_field("user_id", user).unwrap();
        r.set_field("audit_time", Utc::now().to_rfc3339()).unwrap();
        r.seal().unwrap();
        r
    }

    fn cleanup(path: &Path) {
        let root = path.parent().and_then(Path::parent).unwrap();
        std::fs::remove_dir_all(root).unwrap();
    }

    fn window() -> AuditQuery {
        let now = Utc::now();
        AuditQuery::between(now - Duration::hours(1), now + Duration::seconds(1))
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let path = temp_path();
        let sink = FileSink::new(&path);

        sink.write("audit-events", &sealed("aud-1", "alice")).await.unwrap();
        sink.write("audit-events", &sealed("aud-2", "bob")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let all = sink.query(&window()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.verify()));

        let bob = sink.query(&window().for_user("bob")).await.unwrap();
        assert_eq!(bob.len(), 1);

        cleanup(&path);
    }

    #[tokio::test]
    async fn test_duplicates_skipped_across_reopen() {
        let path = temp_path();
        let record = sealed("aud-1", "alice");

        FileSink::new(&path).write("e", &record).await.unwrap();
        let reopened = FileSink::new(&path);
        reopened.write("e", &record).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_same_audit_id_on_two_endpoints() {
        let path = temp_path();
        let sink = FileSink::new(&path);
        let record = sealed("aud-1", "alice");
        sink.write("inquiries", &record).await.unwrap();
        sink.write("content", &record).await.unwrap();
        sink.write("content", &record).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(sink.query(&window().at_endpoint("content")).await.unwrap().len(), 1);
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let path = temp_path();
        let sink = FileSink::new(&path);
        sink.write("e", &sealed("aud-1", "alice")).await.unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        let records = sink.query(&window()).await.unwrap();
        assert_eq!(records.len(), 1);
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_query_missing_file_is_empty() {
        let sink = FileSink::new("/tmp/nonexistent-a3s-audit/audit.jsonl");
        assert!(sink.query(&window()).await.unwrap().is_empty());
    }
}
