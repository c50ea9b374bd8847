use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docorch_errors::OrchestratorError;
use docorch_types::{EventLogEntry, Session, SessionId};
use tokio::fs;
use tokio::sync::RwLock;

use crate::repository::{EventLogRepository, SessionFilter, SessionRepository};

/// Reference `SessionRepository` implementation: an in-memory map flushed
/// to a single JSON snapshot file on every mutation, mirroring the
/// load-whole-snapshot/flush-whole-snapshot pattern the rest of this core's
/// file-backed collaborators use. Suitable for a single-process deployment
/// and for tests; a production deployment swaps this for a real
/// transactional database behind the same trait.
pub struct FileSessionRepository {
    path: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl FileSessionRepository {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("store.io_error", "creating session store directory", e))?;
        }
        let sessions = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io_error("store.corrupt", "parsing session snapshot", e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(io_error("store.io_error", "reading session snapshot", e)),
        };
        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn flush(&self, sessions: &HashMap<String, Session>) -> Result<(), OrchestratorError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec_pretty(sessions)
            .map_err(|e| io_error("store.io_error", "serializing session snapshot", e))?;
        fs::write(&self.path, payload)
            .await
            .map_err(|e| io_error("store.io_error", "writing session snapshot", e))
    }
}

#[async_trait]
impl SessionRepository for FileSessionRepository {
    async fn insert(&self, session: &Session) -> Result<(), OrchestratorError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.to_string(), session.clone());
        self.flush(&sessions).await
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, OrchestratorError> {
        Ok(self.sessions.read().await.get(id.as_ref()).cloned())
    }

    async fn update_with_version(
        &self,
        session: &Session,
        expected_version: u64,
    ) -> Result<bool, OrchestratorError> {
        let mut sessions = self.sessions.write().await;
        let Some(current) = sessions.get(session.id.as_ref()) else {
            return Err(OrchestratorError::not_found(
                "store.not_found",
                format!("no session `{}` to update", session.id),
            ));
        };
        if current.version != expected_version {
            return Ok(false);
        }
        sessions.insert(session.id.to_string(), session.clone());
        self.flush(&sessions).await?;
        Ok(true)
    }

    async fn list(
        &self,
        filter: &SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, OrchestratorError> {
        let sessions = self.sessions.read().await;
        let mut matched: Vec<Session> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_non_terminal(&self) -> Result<Vec<SessionId>, OrchestratorError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.id.clone())
            .collect())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>, OrchestratorError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| !s.state.is_terminal() && s.expires_at <= now)
            .cloned()
            .collect())
    }
}

/// Reference `EventLogRepository` implementation: an append-only Vec
/// flushed to a single JSONL file, one entry per line.
pub struct FileEventLogRepository {
    path: PathBuf,
    entries: RwLock<Vec<EventLogEntry>>,
}

impl FileEventLogRepository {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("store.io_error", "creating event log directory", e))?;
        }
        let entries = match fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| {
                    serde_json::from_str(line)
                        .map_err(|e| io_error("store.corrupt", "parsing event log line", e))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_error("store.io_error", "reading event log", e)),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventLogRepository for FileEventLogRepository {
    async fn append(&self, entry: EventLogEntry) -> Result<(), OrchestratorError> {
        let mut entries = self.entries.write().await;
        entries.push(entry.clone());
        if !self.path.as_os_str().is_empty() {
            let line = serde_json::to_string(&entry)
                .map_err(|e| io_error("store.io_error", "serializing event log entry", e))?;
            use tokio::io::AsyncWriteExt;
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| io_error("store.io_error", "opening event log", e))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| io_error("store.io_error", "appending event log", e))?;
            file.write_all(b"\n")
                .await
                .map_err(|e| io_error("store.io_error", "appending event log", e))?;
        }
        Ok(())
    }

    async fn latest_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EventLogEntry>, OrchestratorError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .find(|e| e.session_id == session_id.as_ref())
            .cloned())
    }
}

fn io_error(code: &'static str, what: &'static str, cause: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::internal(code, format!("{what}: {cause}")).with_cause(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docorch_types::SessionKind;

    #[tokio::test]
    async fn insert_then_find_round_trips() {
        let repo = FileSessionRepository::in_memory();
        let session = Session::new(SessionKind::Module, "ws", None, vec!["a.rs".into()], chrono::Duration::hours(1));
        repo.insert(&session).await.unwrap();
        let found = repo.find_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
    }

    #[tokio::test]
    async fn update_with_version_rejects_stale_predicate() {
        let repo = FileSessionRepository::in_memory();
        let session = Session::new(SessionKind::Module, "ws", None, vec!["a.rs".into()], chrono::Duration::hours(1));
        repo.insert(&session).await.unwrap();

        let mut updated = session.clone();
        updated.version = 2;
        assert!(repo.update_with_version(&updated, 1).await.unwrap());

        let mut stale = session.clone();
        stale.version = 2;
        assert!(!repo.update_with_version(&stale, 1).await.unwrap());
    }

    #[tokio::test]
    async fn list_applies_filter_and_pagination() {
        let repo = FileSessionRepository::in_memory();
        for i in 0..3 {
            let session = Session::new(SessionKind::Module, format!("ws-{i}"), None, vec![], chrono::Duration::hours(1));
            repo.insert(&session).await.unwrap();
        }
        let page = repo.list(&SessionFilter::default(), 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn event_log_returns_most_recent_entry_for_session() {
        let repo = FileEventLogRepository::in_memory();
        let session_id = SessionId::new();
        repo.append(EventLogEntry::new(session_id.to_string(), "session.created", serde_json::json!({})))
            .await
            .unwrap();
        repo.append(EventLogEntry::new(session_id.to_string(), "session.processing", serde_json::json!({})))
            .await
            .unwrap();
        let latest = repo.latest_for_session(&session_id).await.unwrap().unwrap();
        assert_eq!(latest.kind, "session.processing");
    }
}
