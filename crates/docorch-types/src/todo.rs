use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Import,
    Injection,
    Reference,
    Config,
}

impl DependencyKind {
    /// Ordering used when a dependency callback boosts priority: config > import > injection > reference.
    pub fn priority_boost(self) -> i64 {
        match self {
            DependencyKind::Config => 40,
            DependencyKind::Import => 30,
            DependencyKind::Injection => 20,
            DependencyKind::Reference => 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub file_path: String,
    pub status: TodoStatus,
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_kind: Option<DependencyKind>,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest instant this item may be popped again after a retry backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TodoItem {
    pub fn new(file_path: impl Into<String>, priority: i64, max_attempts: u32) -> Self {
        Self {
            file_path: file_path.into(),
            status: TodoStatus::Pending,
            priority,
            dependencies: Vec::new(),
            dependency_kind: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            started_at: None,
            finished_at: None,
            eligible_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoList {
    pub id: String,
    pub session_id: String,
    pub theme: String,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<TodoItem>,
}

impl TodoList {
    pub fn new(session_id: impl Into<String>, theme: impl Into<String>, priority: i64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            theme: theme.into(),
            priority,
            created_at: now,
            updated_at: now,
            items: Vec::new(),
        }
    }
}
