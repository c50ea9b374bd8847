use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit session identifier in its textual (hyphenated) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Module,
    Full,
    Component,
}

/// The documentation workflow's state names. Owned conceptually by the
/// workflow engine, but embedded in `Session` so readers never need a join
/// to know where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    AwaitingGroupings,
    Processing,
    Analyzing,
    EvolvingMemory,
    GeneratingDocs,
    ConsensusReview,
    Completed,
    Failed,
    Paused,
    Cancelled,
    Expired,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed
                | WorkflowState::Failed
                | WorkflowState::Cancelled
                | WorkflowState::Expired
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThematicGroup {
    pub theme: String,
    pub file_paths: Vec<String>,
    pub description: String,
    pub priority: i64,
    pub todo_list_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Pending,
    Processed,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub file_path: String,
    pub memory_id: String,
    pub status: NoteStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total_files: u64,
    pub processed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_theme: Option<String>,
    #[serde(default)]
    pub processed_themes: u64,
    #[serde(default)]
    pub total_themes: u64,
}

impl Progress {
    /// `processed + failed + skipped <= total` must hold at every checkpoint.
    pub fn is_consistent(&self) -> bool {
        self.processed_files + self.failed_files + self.skipped_files <= self.total_files
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub workspace_id: String,
    pub module: Option<String>,
    pub kind: SessionKind,
    pub state: WorkflowState,
    pub version: u64,
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub thematic_groups: Vec<ThematicGroup>,
    pub progress: Progress,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        kind: SessionKind,
        workspace_id: impl Into<String>,
        module: Option<String>,
        file_paths: Vec<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            workspace_id: workspace_id.into(),
            module,
            kind,
            state: WorkflowState::Created,
            version: 1,
            progress: Progress {
                total_files: file_paths.len() as u64,
                ..Progress::default()
            },
            file_paths,
            thematic_groups: Vec::new(),
            notes: Vec::new(),
            artifact_path: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_at_version_one_in_created_state() {
        let session = Session::new(
            SessionKind::Module,
            "ws-1",
            Some("core".into()),
            vec!["a.rs".into(), "b.rs".into()],
            chrono::Duration::hours(1),
        );
        assert_eq!(session.version, 1);
        assert_eq!(session.state, WorkflowState::Created);
        assert_eq!(session.progress.total_files, 2);
    }

    #[test]
    fn progress_consistency_rejects_overcounting() {
        let mut progress = Progress {
            total_files: 3,
            processed_files: 2,
            failed_files: 1,
            skipped_files: 1,
            ..Progress::default()
        };
        assert!(!progress.is_consistent());
        progress.skipped_files = 0;
        assert!(progress.is_consistent());
    }
}
