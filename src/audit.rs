//! Audit trail for security-relevant engine events
//!
//! Each event is one JSON line in `<state dir>/audit.log`. Secret events
//! carry the scheme and a digest prefix, never a locator or a value.
//! `general.audit_log = false` turns the trail off.

use crate::config::{schema::Config, ConfigManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Something worth keeping a record of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    #[serde(rename = "secret.resolved")]
    SecretResolved { scheme: String, digest: String },
    #[serde(rename = "service.started")]
    ServiceStarted {
        operation: String,
        hostname: String,
        session: String,
    },
    #[serde(rename = "service.stopped")]
    ServiceStopped {
        operation: String,
        hostname: String,
        session: String,
    },
    #[serde(rename = "debug.attached")]
    DebugAttached { operation: String, reason: String },
    #[serde(rename = "debug.answered")]
    DebugAnswered { operation: String, resumed: bool },
    #[serde(rename = "cache.corrupt")]
    CacheCorrupt { fingerprint: String, reason: String },
}

/// One line of the trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Append-only JSON-lines audit file; cheap to clone
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config
                .general
                .audit_log
                .then(ConfigManager::audit_log_path),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an event
    ///
    /// Write failures are logged and swallowed; the trail never fails the
    /// work it describes.
    pub async fn record(&self, event: AuditEvent) {
        let Some(path) = &self.path else {
            return;
        };

        let record = AuditRecord {
            timestamp: Utc::now(),
            event,
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = append(path, &line).await {
            warn!("Failed to write audit log {}: {}", path.display(), e);
        }
    }

    /// The last `limit` readable records, oldest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let Some(path) = &self.path else {
            return Vec::new();
        };
        let Ok(content) = tokio::fs::read_to_string(path).await else {
            return Vec::new();
        };

        let mut records: Vec<AuditRecord> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
        records
    }
}

async fn append(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn started(hostname: &str) -> AuditEvent {
        AuditEvent::ServiceStarted {
            operation: "db".to_string(),
            hostname: hostname.to_string(),
            session: "1234abcd".to_string(),
        }
    }

    #[tokio::test]
    async fn events_are_tagged_json_lines() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        audit.record(started("svc-1a2b3c")).await;

        let content = tokio::fs::read_to_string(audit.path().unwrap())
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["event"], "service.started");
        assert_eq!(parsed["hostname"], "svc-1a2b3c");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn recent_keeps_the_tail_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        audit.record(started("svc-a")).await;
        audit.record(started("svc-b")).await;
        let path = audit.path().unwrap().to_path_buf();
        append(&path, "not json\n").await.unwrap();
        audit
            .record(AuditEvent::CacheCorrupt {
                fingerprint: "ab12".to_string(),
                reason: "digest mismatch".to_string(),
            })
            .await;

        let recent = audit.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event, started("svc-b"));
        assert!(matches!(recent[1].event, AuditEvent::CacheCorrupt { .. }));
    }

    #[tokio::test]
    async fn disabled_log_writes_nothing() {
        let audit = AuditLog::disabled();
        audit.record(started("svc-a")).await;
        assert!(audit.path().is_none());
        assert!(audit.recent(10).await.is_empty());
    }
}
