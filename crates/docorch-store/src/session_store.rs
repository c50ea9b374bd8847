use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docorch_errors::OrchestratorError;
use docorch_types::{EventLogEntry, Session, SessionId, SessionKind};
use lru::LruCache;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::repository::{EventLogRepository, SessionFilter, SessionRepository};

#[derive(Debug, Clone, Copy)]
pub struct SessionStoreConfig {
    pub ttl: chrono::Duration,
    pub cache_capacity: NonZeroUsize,
    pub sweep_interval: Duration,
    /// Bound on `update_with_retry`'s reload-and-retry loop for optimistic
    /// conflicts, per §7's "retry with reload up to a small bound".
    pub max_update_retries: u32,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::hours(24),
            cache_capacity: NonZeroUsize::new(1024).expect("nonzero"),
            sweep_interval: Duration::from_secs(60),
            max_update_retries: 5,
        }
    }
}

/// The authoritative per-session record store: a bounded LRU cache of
/// *deep copies* in front of a durable `SessionRepository`, with
/// optimistic-concurrency updates serialized per session by an in-memory
/// mutex. Never hands out a reference into the cache — every read clones.
pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    events: Arc<dyn EventLogRepository>,
    cache: Mutex<LruCache<SessionId, Session>>,
    locks: RwLock<HashMap<SessionId, Arc<Mutex<()>>>>,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        events: Arc<dyn EventLogRepository>,
        config: SessionStoreConfig,
    ) -> Self {
        Self {
            repo,
            events,
            cache: Mutex::new(LruCache::new(config.cache_capacity)),
            locks: RwLock::new(HashMap::new()),
            config,
        }
    }

    async fn lock_for(&self, id: &SessionId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn create(
        &self,
        kind: SessionKind,
        workspace_id: impl Into<String>,
        module: Option<String>,
        file_paths: Vec<String>,
    ) -> Result<Session, OrchestratorError> {
        let session = Session::new(kind, workspace_id, module, file_paths, self.config.ttl);
        self.repo.insert(&session).await?;
        self.events
            .append(EventLogEntry::new(
                session.id.to_string(),
                "session.created",
                serde_json::json!({"workspace_id": session.workspace_id, "kind": session.kind}),
            ))
            .await?;
        self.cache.lock().await.put(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Cache-then-repository lookup. Fails `not_found` if no such session
    /// exists, `expired` if its expiry has passed and it is still
    /// non-terminal (the sweeper has not yet caught up).
    pub async fn get(&self, id: &SessionId) -> Result<Session, OrchestratorError> {
        if let Some(session) = self.cache.lock().await.get(id).cloned() {
            return check_expiry(session);
        }
        let session = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| not_found(id))?;
        self.cache.lock().await.put(id.clone(), session.clone());
        check_expiry(session)
    }

    /// Optimistic update: `session.version` must equal the version
    /// currently stored. On success the stored/cached version becomes
    /// `session.version + 1`. On a predicate miss returns `conflict`; the
    /// caller reloads via `get` and retries, or uses `update_with_retry`.
    pub async fn update(&self, mut session: Session) -> Result<Session, OrchestratorError> {
        let lock = self.lock_for(&session.id).await;
        let _guard = lock.lock().await;

        let expected_version = session.version;
        session.version += 1;
        session.updated_at = Utc::now();

        let applied = self.repo.update_with_version(&session, expected_version).await?;
        if !applied {
            return Err(OrchestratorError::conflict(
                "store.conflict",
                format!(
                    "session `{}` version {expected_version} is stale; reload and retry",
                    session.id
                ),
            ));
        }
        self.cache.lock().await.put(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Reload-mutate-update loop bounded by `config.max_update_retries`,
    /// for callers that do not already hold a freshly-loaded `Session`.
    pub async fn update_with_retry(
        &self,
        id: &SessionId,
        mut mutate: impl FnMut(&mut Session),
    ) -> Result<Session, OrchestratorError> {
        let mut attempt = 0;
        loop {
            let mut session = self.get(id).await?;
            mutate(&mut session);
            match self.update(session).await {
                Ok(updated) => return Ok(updated),
                Err(err) if err.category == docorch_errors::ErrorCategory::Conflict => {
                    attempt += 1;
                    if attempt >= self.config.max_update_retries {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn list(
        &self,
        filter: SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, OrchestratorError> {
        self.repo.list(&filter, limit, offset).await
    }

    /// Every non-terminal session, routed through `get` so callers see the
    /// same cache/expiry handling as any other read. Used by the Recovery
    /// Supervisor to find work to replay at start-up.
    pub async fn list_non_terminal(&self) -> Result<Vec<Session>, OrchestratorError> {
        let ids = self.repo.list_non_terminal().await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(session) = self.get(&id).await {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// The most recent EventLog entry for a session, per §4.6 step 2.
    pub async fn latest_event(&self, id: &SessionId) -> Result<Option<EventLogEntry>, OrchestratorError> {
        self.events.latest_for_session(id).await
    }

    /// Marks every past-expiry non-terminal session `expired`, persists the
    /// change, evicts it from the cache, and emits `session.expired`.
    /// Returns the ids it swept. Intended to be driven by `CleanupSweeper`.
    pub async fn cleanup(&self) -> Result<Vec<SessionId>, OrchestratorError> {
        let now = Utc::now();
        let expired = self.repo.list_expired(now).await?;
        let mut swept = Vec::with_capacity(expired.len());
        for mut session in expired {
            let expected_version = session.version;
            session.state = docorch_types::WorkflowState::Expired;
            session.version += 1;
            session.updated_at = now;
            if self.repo.update_with_version(&session, expected_version).await? {
                self.cache.lock().await.pop(&session.id);
                self.events
                    .append(EventLogEntry::new(session.id.to_string(), "session.expired", serde_json::json!({})))
                    .await?;
                swept.push(session.id);
            }
        }
        Ok(swept)
    }
}

fn check_expiry(session: Session) -> Result<Session, OrchestratorError> {
    if session.is_expired(Utc::now()) {
        return Err(OrchestratorError::new(
            docorch_errors::ErrorCategory::NotFound,
            "store.expired",
            format!("session `{}` has expired", session.id),
        ));
    }
    Ok(session)
}

fn not_found(id: &SessionId) -> OrchestratorError {
    OrchestratorError::not_found("store.not_found", format!("no session `{id}`"))
}

/// Periodic driver for `SessionStore::cleanup`, mirroring the shape of the
/// workflow engine's and callback registry's own sweepers so all three run
/// under the same cancellation pattern.
pub struct CleanupSweeper {
    store: Arc<SessionStore>,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(store: Arc<SessionStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.store.cleanup().await {
                        Ok(swept) => {
                            for id in swept {
                                tracing::info!(session_id = %id, "session expired");
                            }
                        }
                        Err(err) => tracing::error!(error = %err, "session cleanup sweep failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_repository::{FileEventLogRepository, FileSessionRepository};

    fn store() -> SessionStore {
        SessionStore::new(
            Arc::new(FileSessionRepository::in_memory()),
            Arc::new(FileEventLogRepository::in_memory()),
            SessionStoreConfig {
                cache_capacity: NonZeroUsize::new(8).unwrap(),
                ..SessionStoreConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        let session = store.create(SessionKind::Module, "ws", None, vec!["a.rs".into()]).await.unwrap();
        let fetched = store.get(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let store = store();
        let err = store.get(&SessionId::new()).await.unwrap_err();
        assert_eq!(err.code, "store.not_found");
    }

    #[tokio::test]
    async fn concurrent_updates_serialize_and_each_bumps_version_by_one() {
        let store = Arc::new(store());
        let session = store.create(SessionKind::Module, "ws", None, vec![]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let id = session.id.clone();
            handles.push(tokio::spawn(async move {
                store.update_with_retry(&id, |s| { s.progress.processed_files += 1; }).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let final_session = store.get(&session.id).await.unwrap();
        assert_eq!(final_session.version, 11);
        assert_eq!(final_session.progress.processed_files, 10);
    }

    #[tokio::test]
    async fn stale_update_is_rejected_as_conflict() {
        let store = store();
        let session = store.create(SessionKind::Module, "ws", None, vec![]).await.unwrap();
        let updated = store.update(session.clone()).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.update(session).await.unwrap_err();
        assert_eq!(err.code, "store.conflict");
    }

    #[tokio::test]
    async fn cleanup_expires_past_ttl_sessions() {
        let store = store();
        let mut session = Session::new(SessionKind::Module, "ws", None, vec![], chrono::Duration::seconds(-1));
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.repo.insert(&session).await.unwrap();

        let swept = store.cleanup().await.unwrap();
        assert_eq!(swept, vec![session.id.clone()]);
        let reloaded = store.get(&session.id).await.unwrap();
        assert_eq!(reloaded.state, docorch_types::WorkflowState::Expired);
    }
}
