use std::collections::{HashMap, HashSet};

use chrono::Utc;
use docorch_errors::{BackoffPolicy, OrchestratorError};
use docorch_types::{DependencyKind, SessionId, TodoItem, TodoList, TodoStatus};
use tokio::sync::{Mutex, RwLock};

use crate::priority::compute_priority;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    Eligible(TodoItem),
    /// Pending work exists but every candidate is gated on an incomplete dependency.
    Blocked,
    /// Nothing pending and nothing in flight; the session's queues are empty.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Completed,
    Skipped,
    RetryScheduled,
    Exhausted,
}

struct SessionQueues {
    lists: Vec<TodoList>,
}

impl SessionQueues {
    fn find_mut(&mut self, file_path: &str) -> Option<(usize, usize)> {
        for (list_idx, list) in self.lists.iter().enumerate() {
            if let Some(item_idx) = list.items.iter().position(|i| i.file_path == file_path) {
                return Some((list_idx, item_idx));
            }
        }
        None
    }

    fn status_of(&self, file_path: &str) -> Option<TodoStatus> {
        self.lists
            .iter()
            .flat_map(|l| l.items.iter())
            .find(|i| i.file_path == file_path)
            .map(|i| i.status)
    }

    fn list_idx_for_theme(&self, theme: &str) -> Option<usize> {
        self.lists.iter().position(|l| l.theme == theme)
    }
}

/// Per-session priority queues of files pending documentation analysis: one
/// queue per thematic group for `full` sessions, a single queue for `module`
/// sessions. The session mutex serializes all mutation; across sessions
/// operations run fully in parallel.
pub struct TodoScheduler {
    sessions: RwLock<HashMap<SessionId, Mutex<SessionQueues>>>,
    backoff: BackoffPolicy,
}

impl TodoScheduler {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            backoff,
        }
    }

    /// Creates the (theme, queue_priority) lists for a session. Module
    /// sessions pass a single theme; full sessions pass one per thematic
    /// group. Calling twice for the same session replaces nothing — the
    /// second call is rejected with `conflict`.
    pub async fn create_session(
        &self,
        session_id: &SessionId,
        themes: Vec<(String, i64)>,
    ) -> Result<(), OrchestratorError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(OrchestratorError::conflict(
                "scheduler.session_exists",
                "todo queues already exist for this session",
            ));
        }
        let lists = themes
            .into_iter()
            .map(|(theme, priority)| TodoList::new(session_id.to_string(), theme, priority))
            .collect();
        sessions.insert(session_id.clone(), Mutex::new(SessionQueues { lists }));
        Ok(())
    }

    pub async fn enqueue(
        &self,
        session_id: &SessionId,
        theme: &str,
        file_path: impl Into<String>,
        max_attempts: u32,
    ) -> Result<(), OrchestratorError> {
        let sessions = self.sessions.read().await;
        let queues = sessions
            .get(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        let mut queues = queues.lock().await;
        let file_path = file_path.into();
        let priority = compute_priority(&file_path, None);
        let list_idx = queues
            .list_idx_for_theme(theme)
            .ok_or_else(|| OrchestratorError::not_found("scheduler.unknown_theme", format!("no queue for theme `{theme}`")))?;
        queues.lists[list_idx]
            .items
            .push(TodoItem::new(file_path, priority, max_attempts));
        queues.lists[list_idx].updated_at = Utc::now();
        Ok(())
    }

    /// Returns the highest-priority pending item whose dependencies are all
    /// `completed`, or `Blocked`/`Drained` when nothing is currently eligible.
    pub async fn pop_next(&self, session_id: &SessionId) -> Result<PopOutcome, OrchestratorError> {
        let sessions = self.sessions.read().await;
        let queues = sessions
            .get(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        let mut queues = queues.lock().await;

        let statuses: HashMap<String, TodoStatus> = queues
            .lists
            .iter()
            .flat_map(|l| l.items.iter())
            .map(|i| (i.file_path.clone(), i.status))
            .collect();

        let now = Utc::now();
        let mut best: Option<(usize, usize)> = None;
        let mut any_pending = false;
        let mut any_in_progress = false;

        for (list_idx, list) in queues.lists.iter().enumerate() {
            for (item_idx, item) in list.items.iter().enumerate() {
                match item.status {
                    TodoStatus::Pending => {}
                    TodoStatus::InProgress => {
                        any_in_progress = true;
                        continue;
                    }
                    _ => continue,
                }
                any_pending = true;
                if let Some(eligible_at) = item.eligible_at {
                    if eligible_at > now {
                        continue;
                    }
                }
                let deps_done = item
                    .dependencies
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&TodoStatus::Completed));
                if !deps_done {
                    continue;
                }
                let is_better = match best {
                    None => true,
                    Some((bl, bi)) => {
                        let b = &queues.lists[bl].items[bi];
                        (item.priority, std::cmp::Reverse(item_idx), std::cmp::Reverse(item.created_at))
                            > (b.priority, std::cmp::Reverse(bi), std::cmp::Reverse(b.created_at))
                    }
                };
                if is_better {
                    best = Some((list_idx, item_idx));
                }
            }
        }

        let Some((list_idx, item_idx)) = best else {
            return Ok(if any_pending || any_in_progress {
                PopOutcome::Blocked
            } else {
                PopOutcome::Drained
            });
        };

        let item = &mut queues.lists[list_idx].items[item_idx];
        item.status = TodoStatus::InProgress;
        item.started_at = Some(now);
        item.attempts += 1;
        Ok(PopOutcome::Eligible(item.clone()))
    }

    /// True if this session already has queues tracked, regardless of their
    /// contents. Lets a caller tell "queues survived" apart from "queues are
    /// gone, rebuild them" without relying on `create_session`'s conflict
    /// error as a probe.
    pub async fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Resets every `in_progress` item in the session back to `pending`,
    /// clearing its start timestamp without touching `attempts`. Used by the
    /// Recovery Supervisor on crash replay: the outbound analysis request
    /// for that item is gone, so it must be re-dispatched, but the attempt
    /// it already spent still counts against `max_attempts`. Returns the
    /// count of items reset.
    pub async fn reset_in_progress(&self, session_id: &SessionId) -> Result<u64, OrchestratorError> {
        let sessions = self.sessions.read().await;
        let queues = sessions
            .get(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        let mut queues = queues.lock().await;
        let mut reset = 0;
        for list in &mut queues.lists {
            for item in &mut list.items {
                if item.status == TodoStatus::InProgress {
                    item.status = TodoStatus::Pending;
                    item.started_at = None;
                    reset += 1;
                }
            }
        }
        Ok(reset)
    }

    /// Records the outcome of analyzing `file_path`. `error` is only
    /// consulted for a `failed` status.
    pub async fn update(
        &self,
        session_id: &SessionId,
        file_path: &str,
        status: TodoStatus,
        error: Option<String>,
    ) -> Result<UpdateOutcome, OrchestratorError> {
        let sessions = self.sessions.read().await;
        let queues = sessions
            .get(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        let mut queues = queues.lock().await;
        let (list_idx, item_idx) = queues
            .find_mut(file_path)
            .ok_or_else(|| item_not_found(file_path))?;
        queues.lists[list_idx].updated_at = Utc::now();
        let item = &mut queues.lists[list_idx].items[item_idx];

        match status {
            TodoStatus::Completed => {
                item.status = TodoStatus::Completed;
                item.finished_at = Some(Utc::now());
                Ok(UpdateOutcome::Completed)
            }
            TodoStatus::Skipped => {
                item.status = TodoStatus::Skipped;
                item.finished_at = Some(Utc::now());
                Ok(UpdateOutcome::Skipped)
            }
            TodoStatus::Failed => {
                item.last_error = error;
                if self.backoff.attempts_exhausted(item.attempts) || item.attempts >= item.max_attempts {
                    item.status = TodoStatus::Failed;
                    item.finished_at = Some(Utc::now());
                    Ok(UpdateOutcome::Exhausted)
                } else {
                    item.status = TodoStatus::Pending;
                    item.eligible_at = Some(Utc::now() + self.backoff.delay_for(item.attempts));
                    Ok(UpdateOutcome::RetryScheduled)
                }
            }
            other => Err(OrchestratorError::validation(
                "scheduler.invalid_update_status",
                format!("`{other:?}` is not a terminal/retry status for update()"),
            )),
        }
    }

    /// Idempotently adds dependency files to `requesting_path`'s item. Rejects
    /// with `dependency_cycle` if any new edge would create one, detected
    /// depth-first over the session's pending/in-progress items. Returns the
    /// number of dependency files that did not already have an item in this
    /// session's queues (i.e. were newly inserted), so the caller can fold
    /// that count into `session.progress.total_files` — every inserted item
    /// is one more file the session's progress bookkeeping must account for.
    pub async fn add_dependencies(
        &self,
        session_id: &SessionId,
        requesting_path: &str,
        deps: Vec<(String, DependencyKind)>,
    ) -> Result<u64, OrchestratorError> {
        let sessions = self.sessions.read().await;
        let queues = sessions
            .get(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        let mut queues = queues.lock().await;

        let (requesting_list_idx, requesting_item_idx) = queues
            .find_mut(requesting_path)
            .ok_or_else(|| item_not_found(requesting_path))?;

        let mut inserted = 0u64;
        for (dep_path, kind) in deps {
            if dep_path == requesting_path {
                continue;
            }
            let already_linked = queues.lists[requesting_list_idx].items[requesting_item_idx]
                .dependencies
                .iter()
                .any(|d| d == &dep_path);
            if already_linked {
                continue;
            }

            if queues.find_mut(&dep_path).is_none() {
                let priority = compute_priority(&dep_path, Some(kind));
                let mut item = TodoItem::new(dep_path.clone(), priority, default_max_attempts());
                item.dependency_kind = Some(kind);
                queues.lists[requesting_list_idx].items.push(item);
                inserted += 1;
            }

            if creates_cycle(&queues, &dep_path, requesting_path) {
                return Err(OrchestratorError::conflict(
                    "scheduler.dependency_cycle",
                    format!("adding `{dep_path}` as a dependency of `{requesting_path}` would create a cycle"),
                ));
            }

            queues.lists[requesting_list_idx].items[requesting_item_idx]
                .dependencies
                .push(dep_path);
        }
        queues.lists[requesting_list_idx].updated_at = Utc::now();
        Ok(inserted)
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// Depth-first search from `start`, following only pending/in-progress
/// items' dependency edges, looking for `target`.
fn creates_cycle(queues: &SessionQueues, start: &str, target: &str) -> bool {
    let mut stack = vec![start.to_string()];
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(path) = stack.pop() {
        if path == target {
            return true;
        }
        if !seen.insert(path.clone()) {
            continue;
        }
        for list in &queues.lists {
            if let Some(item) = list.items.iter().find(|i| i.file_path == path) {
                if matches!(item.status, TodoStatus::Pending | TodoStatus::InProgress) {
                    stack.extend(item.dependencies.iter().cloned());
                }
            }
        }
    }
    false
}

fn session_not_found(session_id: &SessionId) -> OrchestratorError {
    OrchestratorError::not_found("scheduler.session_not_found", format!("no todo queues for session `{session_id}`"))
}

fn item_not_found(file_path: &str) -> OrchestratorError {
    OrchestratorError::not_found("scheduler.item_not_found", format!("no todo item for `{file_path}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scheduler_with_module_session() -> (TodoScheduler, SessionId) {
        let scheduler = TodoScheduler::new(BackoffPolicy {
            base_ms: 1,
            multiplier: 2.0,
            cap_ms: 100,
            max_attempts: 2,
        });
        let session_id = SessionId::new();
        scheduler
            .create_session(&session_id, vec![("default".to_string(), 0)])
            .await
            .unwrap();
        (scheduler, session_id)
    }

    #[tokio::test]
    async fn reset_in_progress_returns_items_to_pending() {
        let (scheduler, session_id) = scheduler_with_module_session().await;
        scheduler.enqueue(&session_id, "default", "src/lib.rs", 3).await.unwrap();
        let popped = scheduler.pop_next(&session_id).await.unwrap();
        assert!(matches!(popped, PopOutcome::Eligible(_)));

        let reset = scheduler.reset_in_progress(&session_id).await.unwrap();
        assert_eq!(reset, 1);

        let popped_again = scheduler.pop_next(&session_id).await.unwrap();
        let PopOutcome::Eligible(item) = popped_again else { panic!("expected eligible after reset") };
        assert_eq!(item.file_path, "src/lib.rs");
        assert_eq!(item.attempts, 2, "the spent attempt still counts toward max_attempts");
    }

    #[tokio::test]
    async fn pop_next_returns_drained_for_empty_queue() {
        let (scheduler, session_id) = scheduler_with_module_session().await;
        assert_eq!(scheduler.pop_next(&session_id).await.unwrap(), PopOutcome::Drained);
    }

    #[tokio::test]
    async fn pop_next_honors_dependency_gating() {
        let (scheduler, session_id) = scheduler_with_module_session().await;
        scheduler.enqueue(&session_id, "default", "src/lib.rs", 3).await.unwrap();
        scheduler.enqueue(&session_id, "default", "src/util.rs", 3).await.unwrap();
        scheduler
            .add_dependencies(&session_id, "src/lib.rs", vec![("src/util.rs".to_string(), DependencyKind::Import)])
            .await
            .unwrap();

        let popped = scheduler.pop_next(&session_id).await.unwrap();
        let PopOutcome::Eligible(item) = popped else { panic!("expected an eligible item") };
        assert_eq!(item.file_path, "src/util.rs", "dependency must be analyzed before its dependent");

        let blocked = scheduler.pop_next(&session_id).await.unwrap();
        assert_eq!(blocked, PopOutcome::Blocked);

        scheduler
            .update(&session_id, "src/util.rs", TodoStatus::Completed, None)
            .await
            .unwrap();
        let popped = scheduler.pop_next(&session_id).await.unwrap();
        let PopOutcome::Eligible(item) = popped else { panic!("expected an eligible item") };
        assert_eq!(item.file_path, "src/lib.rs");
    }

    #[tokio::test]
    async fn failed_update_retries_until_attempts_exhausted() {
        let (scheduler, session_id) = scheduler_with_module_session().await;
        scheduler.enqueue(&session_id, "default", "src/flaky.rs", 2).await.unwrap();

        scheduler.pop_next(&session_id).await.unwrap();
        let outcome = scheduler
            .update(&session_id, "src/flaky.rs", TodoStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::RetryScheduled);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        scheduler.pop_next(&session_id).await.unwrap();
        let outcome = scheduler
            .update(&session_id, "src/flaky.rs", TodoStatus::Failed, Some("boom again".into()))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Exhausted);
    }

    #[tokio::test]
    async fn add_dependencies_is_idempotent() {
        let (scheduler, session_id) = scheduler_with_module_session().await;
        scheduler.enqueue(&session_id, "default", "src/a.rs", 3).await.unwrap();
        let first = scheduler
            .add_dependencies(&session_id, "src/a.rs", vec![("src/b.rs".to_string(), DependencyKind::Reference)])
            .await
            .unwrap();
        assert_eq!(first, 1, "src/b.rs has no existing item, so it counts as newly inserted");
        let second = scheduler
            .add_dependencies(&session_id, "src/a.rs", vec![("src/b.rs".to_string(), DependencyKind::Reference)])
            .await
            .unwrap();
        assert_eq!(second, 0, "src/b.rs already has an item; re-adding it inserts nothing new");

        let sessions = scheduler.sessions.read().await;
        let queues = sessions.get(&session_id).unwrap().lock().await;
        let a = queues.lists[0].items.iter().find(|i| i.file_path == "src/a.rs").unwrap();
        assert_eq!(a.dependencies.len(), 1);
    }

    #[tokio::test]
    async fn add_dependencies_reports_zero_for_an_already_enqueued_dependency() {
        let (scheduler, session_id) = scheduler_with_module_session().await;
        scheduler.enqueue(&session_id, "default", "src/a.rs", 3).await.unwrap();
        scheduler.enqueue(&session_id, "default", "src/b.rs", 3).await.unwrap();
        let inserted = scheduler
            .add_dependencies(&session_id, "src/a.rs", vec![("src/b.rs".to_string(), DependencyKind::Reference)])
            .await
            .unwrap();
        assert_eq!(inserted, 0, "src/b.rs already had an item from its own enqueue");
    }

    #[tokio::test]
    async fn add_dependencies_rejects_a_cycle() {
        let (scheduler, session_id) = scheduler_with_module_session().await;
        scheduler.enqueue(&session_id, "default", "src/a.rs", 3).await.unwrap();
        scheduler.enqueue(&session_id, "default", "src/b.rs", 3).await.unwrap();
        scheduler
            .add_dependencies(&session_id, "src/a.rs", vec![("src/b.rs".to_string(), DependencyKind::Import)])
            .await
            .unwrap();

        let err = scheduler
            .add_dependencies(&session_id, "src/b.rs", vec![("src/a.rs".to_string(), DependencyKind::Import)])
            .await
            .unwrap_err();
        assert_eq!(err.code, "scheduler.dependency_cycle");
    }
}
