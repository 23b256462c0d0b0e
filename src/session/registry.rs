//! Live session tracking

use crate::error::{KilnError, KilnResult};
use crate::session::state::{Session, SessionId, SessionStatus};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Sessions opened by this engine
///
/// Records are mirrored to `dir` (when set) so `kiln status` can list the
/// sessions of other running processes.
pub struct SessionRegistry {
    dir: Option<PathBuf>,
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            sessions: DashMap::new(),
        }
    }

    /// Open a new session
    pub async fn open(&self, name: &str, module: &str) -> KilnResult<Session> {
        let session = Session::new(name, module);
        if let Some(dir) = &self.dir {
            session.save(dir).await?;
        }
        self.sessions.insert(session.id, session.clone());
        info!("Opened session {} ({})", session.id.short(), name);
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> KilnResult<Session> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| KilnError::SessionNotFound(id.to_string()))
    }

    /// Fail unless the session exists and is open
    pub fn ensure_open(&self, id: &SessionId) -> KilnResult<()> {
        match self.get(id)?.status {
            SessionStatus::Open => Ok(()),
            _ => Err(KilnError::SessionClosed(id.to_string())),
        }
    }

    /// Mark a session as closing; returns false if it already was
    pub fn begin_close(&self, id: &SessionId) -> KilnResult<bool> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| KilnError::SessionNotFound(id.to_string()))?;
        if session.status != SessionStatus::Open {
            return Ok(false);
        }
        session.status = SessionStatus::Closing;
        session.updated_at = Utc::now();
        Ok(true)
    }

    /// Forget a session once its resources are released
    pub async fn finish_close(&self, id: &SessionId) -> KilnResult<()> {
        if let Some((_, mut session)) = self.sessions.remove(id) {
            session.status = SessionStatus::Closed;
            if let Some(dir) = &self.dir {
                session.delete(dir).await?;
            }
            debug!("Closed session {}", id.short());
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Open)
            .count()
    }

    /// Remove records left behind by processes that never closed them
    pub async fn cleanup(&self, max_age_hours: u32) -> KilnResult<u32> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        if max_age_hours == 0 {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::hours(i64::from(max_age_hours));
        let mut cleaned = 0;
        for session in Session::list_all(dir).await? {
            if self.sessions.contains_key(&session.id) {
                continue;
            }
            if session.updated_at < cutoff {
                session.delete(dir).await?;
                cleaned += 1;
                info!("Cleaned up stale session record {}", session.id.short());
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_close_lifecycle() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(Some(dir.path().to_path_buf()));

        let session = registry.open("graph.toml", "main").await.unwrap();
        assert_eq!(registry.active_count(), 1);
        assert!(registry.ensure_open(&session.id).is_ok());
        assert_eq!(Session::list_all(dir.path()).await.unwrap().len(), 1);

        assert!(registry.begin_close(&session.id).unwrap());
        assert!(!registry.begin_close(&session.id).unwrap());
        assert!(matches!(
            registry.ensure_open(&session.id),
            Err(KilnError::SessionClosed(_))
        ));

        registry.finish_close(&session.id).await.unwrap();
        assert!(registry.list().is_empty());
        assert!(Session::list_all(dir.path()).await.unwrap().is_empty());
        assert!(matches!(
            registry.get(&session.id),
            Err(KilnError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_skips_live_sessions() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(Some(dir.path().to_path_buf()));
        let live = registry.open("live", "main").await.unwrap();

        let mut stale = Session::new("stale", "main");
        stale.updated_at = Utc::now() - Duration::hours(48);
        stale.save(dir.path()).await.unwrap();

        assert_eq!(registry.cleanup(24).await.unwrap(), 1);
        let remaining = Session::list_all(dir.path()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, live.id);
    }

    #[tokio::test]
    async fn in_memory_registry() {
        let registry = SessionRegistry::new(None);
        let a = registry.open("a", "main").await.unwrap();
        let b = registry.open("b", "main").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.cleanup(1).await.unwrap(), 0);
    }
}
