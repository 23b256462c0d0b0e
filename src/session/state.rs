//! Session records

use crate::error::{KilnError, KilnResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use uuid::Uuid;

/// Identity of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used in hostnames and container names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| KilnError::SessionNotFound(s.to_string()))
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closing,
    Closed,
}

/// Session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,

    /// Human-readable label (the graph file for CLI runs)
    pub name: String,

    /// Module that owns the session's services (part of service hostnames)
    pub module: String,

    /// Current status
    pub status: SessionStatus,

    /// Process that opened the session
    pub pid: u32,

    /// When session was created
    pub created_at: DateTime<Utc>,

    /// When session was last updated
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new open session
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.into(),
            module: module.into(),
            status: SessionStatus::Open,
            pid: std::process::id(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.id))
    }

    /// Save session to `dir`
    pub async fn save(&self, dir: &Path) -> KilnResult<()> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| KilnError::io("creating sessions directory", e))?;

        let path = self.file_path(dir);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .await
            .map_err(|e| KilnError::io(format!("writing session file {}", path.display()), e))
    }

    /// Delete the session file from `dir`
    pub async fn delete(&self, dir: &Path) -> KilnResult<()> {
        let path = self.file_path(dir);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KilnError::io(
                format!("deleting session file {}", path.display()),
                e,
            )),
        }
    }

    /// List every session recorded in `dir`, newest first
    pub async fn list_all(dir: &Path) -> KilnResult<Vec<Session>> {
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut sessions = vec![];
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| KilnError::io("reading sessions directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KilnError::io("reading session entry", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let content = fs::read_to_string(&path).await.ok();
                if let Some(content) = content {
                    if let Ok(session) = serde_json::from_str::<Session>(&content) {
                        sessions.push(session);
                    }
                }
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(sessions)
    }
}
