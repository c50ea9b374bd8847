use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docorch_errors::OrchestratorError;
use docorch_types::{EventLogEntry, Session, SessionId, WorkflowState};

/// Typed query parameters for `SessionRepository::list`. Every field is a
/// plain Rust value bound by the implementation, never formatted into a
/// query string — there is no code path through which a caller-supplied
/// string can become part of a query's shape.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub workspace_id: Option<String>,
    pub state: Option<WorkflowState>,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        if let Some(workspace_id) = &self.workspace_id {
            if &session.workspace_id != workspace_id {
                return false;
            }
        }
        if let Some(state) = self.state {
            if session.state != state {
                return false;
            }
        }
        true
    }
}

/// The transactional storage backend contract required by §6: row-level
/// optimistic update by version, secondary indexes on `(workspace, state)`
/// and `expires_at` (satisfied here by the implementation's own indexing
/// strategy, not by this trait). The concrete database driver behind this
/// trait is an external collaborator — out of scope for this crate, which
/// ships only the contract plus a reference file-backed implementation.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<(), OrchestratorError>;

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, OrchestratorError>;

    /// Row-level optimistic update: persists `session` (whose `version` is
    /// already the caller's intended new value) only if the currently
    /// stored row's version equals `expected_version`. Returns `false` on a
    /// predicate miss rather than erroring, so the caller can reload and
    /// retry without unwinding through an error path.
    async fn update_with_version(
        &self,
        session: &Session,
        expected_version: u64,
    ) -> Result<bool, OrchestratorError>;

    async fn list(
        &self,
        filter: &SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, OrchestratorError>;

    /// Ids of every session whose `state` is non-terminal. Used by the
    /// Session Store's sweeper and by the Recovery Supervisor.
    async fn list_non_terminal(&self) -> Result<Vec<SessionId>, OrchestratorError>;

    /// Non-terminal sessions whose `expires_at` is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>, OrchestratorError>;
}

/// Append-only audit trail, per §3's EventLog entry. One implementation
/// backs both the Recovery Supervisor's replay reads and the dispatcher's
/// writes.
#[async_trait]
pub trait EventLogRepository: Send + Sync {
    async fn append(&self, entry: EventLogEntry) -> Result<(), OrchestratorError>;

    async fn latest_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EventLogEntry>, OrchestratorError>;
}
