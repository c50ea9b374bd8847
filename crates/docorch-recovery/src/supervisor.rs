use std::sync::Arc;

use docorch_callbacks::CallbackRegistry;
use docorch_errors::OrchestratorError;
use docorch_scheduler::TodoScheduler;
use docorch_store::SessionStore;
use docorch_types::{Session, SessionId, WorkflowState};
use docorch_workflow::{WorkflowEngine, WorkflowEvent};

/// Matches the Tool Dispatcher's own default (`docorch-server::dispatch`):
/// an item rebuilt from a persisted session has spent no attempts yet, so
/// it gets the same ceiling a freshly-enqueued item would.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What happened to one session during replay.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// The session's in-flight work was reset and its state's entry hook
    /// was re-invoked to resume processing.
    Resumed,
    /// Replay could not make sense of the session's persisted state; it was
    /// transitioned to `failed` with reason `recovery_error`.
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub outcomes: Vec<(SessionId, RecoveryOutcome)>,
}

impl RecoveryReport {
    pub fn resumed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, RecoveryOutcome::Resumed))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.resumed_count()
    }
}

/// Replays every non-`created`, non-terminal session from the Session Store
/// into a freshly-started `WorkflowEngine`, §4.6: the engine itself keeps no
/// durable record of its own, so after a restart it knows nothing until this
/// runs.
pub struct RecoverySupervisor {
    store: Arc<SessionStore>,
    workflow: Arc<WorkflowEngine>,
    scheduler: Arc<TodoScheduler>,
    callbacks: Arc<CallbackRegistry>,
}

impl RecoverySupervisor {
    pub fn new(
        store: Arc<SessionStore>,
        workflow: Arc<WorkflowEngine>,
        scheduler: Arc<TodoScheduler>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        Self { store, workflow, scheduler, callbacks }
    }

    /// Runs once. Sessions still in `created` are left alone — they have no
    /// outstanding work to resume, a caller simply hasn't driven them past
    /// their first event yet.
    pub async fn run(&self) -> Result<RecoveryReport, OrchestratorError> {
        let candidates = self.store.list_non_terminal().await?;
        let mut report = RecoveryReport::default();

        for session in candidates {
            if session.state == WorkflowState::Created {
                continue;
            }
            let outcome = self.recover_one(&session).await;
            if let RecoveryOutcome::Failed(ref reason) = outcome {
                tracing::error!(session_id = %session.id, reason, "session recovery failed");
            } else {
                tracing::info!(session_id = %session.id, state = %session.state, "session recovered");
            }
            report.outcomes.push((session.id, outcome));
        }

        Ok(report)
    }

    async fn recover_one(&self, session: &Session) -> RecoveryOutcome {
        let session_id = &session.id;
        match self.try_recover_one(session).await {
            Ok(()) => RecoveryOutcome::Resumed,
            Err(err) => {
                let reason = "recovery_error".to_string();
                // `force_expire` is deliberately not used here: a replay
                // failure is not the same edge as a TTL sweep, so the
                // session moves to `failed` via the normal `Fail` event.
                let _ = self
                    .workflow
                    .apply_event(session_id, WorkflowEvent::Fail { reason: reason.clone() })
                    .await;
                let _ = self
                    .store
                    .update_with_retry(session_id, |session| {
                        session.state = WorkflowState::Failed;
                    })
                    .await;
                tracing::warn!(session_id = %session_id, error = %err, "recovery replay error");
                RecoveryOutcome::Failed(reason)
            }
        }
    }

    async fn try_recover_one(&self, session: &Session) -> Result<(), OrchestratorError> {
        let session_id = &session.id;

        // §4.6 step 2: the latest EventLog entry is consulted so a future
        // extension of this supervisor can distinguish "crashed mid-event"
        // from "cleanly settled in this state"; today every non-terminal,
        // non-created state resumes the same way regardless of what the
        // last entry says.
        let _last_event = self.store.latest_event(session_id).await?;

        // Reconstruct the engine's in-memory record at the persisted state
        // before touching anything else, so the entry hook re-invoked below
        // sees the right state.
        self.workflow.seed(session_id, session.state).await;

        self.rebuild_scheduler_queues(session).await?;
        self.scheduler.reset_in_progress(session_id).await?;
        self.callbacks.cancel(session_id).await;
        self.workflow.reinvoke_entry_hook(session_id).await;
        Ok(())
    }

    /// `TodoScheduler` keeps no durable state of its own — a real process
    /// restart starts it with zero sessions — so on replay its queues for
    /// `session` are either intact (this process never actually restarted,
    /// e.g. in tests) or entirely absent. When they're absent, rebuild them
    /// from the persisted `thematic_groups`/`file_paths` rather than letting
    /// the absence propagate as `session_not_found` and hard-fail the
    /// session.
    ///
    /// Per-item state (which files were already `completed` before the
    /// crash) is not part of the persisted `Session` record, so a rebuilt
    /// queue starts every file `pending` and the session's processed/failed/
    /// skipped counters are reset to zero alongside it — resuming with a
    /// queue that disagrees with `session.progress` would itself violate
    /// the `processed + failed + skipped <= total` invariant.
    async fn rebuild_scheduler_queues(&self, session: &Session) -> Result<(), OrchestratorError> {
        if self.scheduler.has_session(&session.id).await {
            return Ok(());
        }

        if session.thematic_groups.is_empty() {
            self.scheduler
                .create_session(&session.id, vec![("module".to_string(), 0)])
                .await?;
            for path in &session.file_paths {
                self.scheduler
                    .enqueue(&session.id, "module", path.clone(), DEFAULT_MAX_ATTEMPTS)
                    .await?;
            }
        } else {
            let themes = session
                .thematic_groups
                .iter()
                .map(|group| (group.theme.clone(), group.priority))
                .collect();
            self.scheduler.create_session(&session.id, themes).await?;
            for group in &session.thematic_groups {
                for path in &group.file_paths {
                    self.scheduler
                        .enqueue(&session.id, &group.theme, path.clone(), DEFAULT_MAX_ATTEMPTS)
                        .await?;
                }
            }
        }

        self.store
            .update_with_retry(&session.id, |session| {
                session.progress.processed_files = 0;
                session.progress.failed_files = 0;
                session.progress.skipped_files = 0;
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docorch_errors::BackoffPolicy;
    use docorch_store::{FileEventLogRepository, FileSessionRepository, SessionStoreConfig};
    use docorch_types::SessionKind;
    use std::num::NonZeroUsize;

    fn harness() -> (Arc<SessionStore>, Arc<WorkflowEngine>, Arc<TodoScheduler>, Arc<CallbackRegistry>) {
        let store = Arc::new(SessionStore::new(
            Arc::new(FileSessionRepository::in_memory()),
            Arc::new(FileEventLogRepository::in_memory()),
            SessionStoreConfig {
                cache_capacity: NonZeroUsize::new(8).unwrap(),
                ..SessionStoreConfig::default()
            },
        ));
        let workflow = Arc::new(WorkflowEngine::new());
        let scheduler = Arc::new(TodoScheduler::new(BackoffPolicy::default()));
        let callbacks = Arc::new(CallbackRegistry::new());
        (store, workflow, scheduler, callbacks)
    }

    #[tokio::test]
    async fn resumes_non_terminal_non_created_sessions() {
        let (store, workflow, scheduler, callbacks) = harness();
        let mut session = store.create(SessionKind::Module, "ws", None, vec!["a.rs".into()]).await.unwrap();
        session.state = WorkflowState::Processing;
        store.update(session.clone()).await.unwrap();
        scheduler.create_session(&session.id, vec![("module".into(), 0)]).await.unwrap();

        let supervisor = RecoverySupervisor::new(store.clone(), workflow.clone(), scheduler, callbacks);
        let report = supervisor.run().await.unwrap();

        assert_eq!(report.resumed_count(), 1);
        let record = workflow.current(&session.id).await.unwrap();
        assert_eq!(record.state, WorkflowState::Processing);
    }

    #[tokio::test]
    async fn leaves_freshly_created_sessions_alone() {
        let (store, workflow, scheduler, callbacks) = harness();
        let session = store.create(SessionKind::Module, "ws", None, vec![]).await.unwrap();

        let supervisor = RecoverySupervisor::new(store, workflow.clone(), scheduler, callbacks);
        let report = supervisor.run().await.unwrap();

        assert!(report.outcomes.is_empty());
        assert!(workflow.current(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn resets_in_progress_todo_items_on_resume() {
        let (store, workflow, scheduler, callbacks) = harness();
        let mut session = store.create(SessionKind::Module, "ws", None, vec!["a.rs".into()]).await.unwrap();
        session.state = WorkflowState::Processing;
        store.update(session.clone()).await.unwrap();

        scheduler.create_session(&session.id, vec![("module".into(), 0)]).await.unwrap();
        scheduler.enqueue(&session.id, "module", "a.rs", 3).await.unwrap();
        scheduler.pop_next(&session.id).await.unwrap();

        let supervisor = RecoverySupervisor::new(store, workflow, scheduler.clone(), callbacks);
        supervisor.run().await.unwrap();

        let reset_count = scheduler.reset_in_progress(&session.id).await.unwrap();
        assert_eq!(reset_count, 0, "recovery should have already reset the in-progress item");
    }

    #[tokio::test]
    async fn resumes_a_module_session_whose_scheduler_queue_did_not_survive_a_restart() {
        let (store, workflow, scheduler, callbacks) = harness();
        let mut session = store
            .create(SessionKind::Module, "ws", Some("core".into()), vec!["a.rs".into(), "b.rs".into()])
            .await
            .unwrap();
        session.state = WorkflowState::Processing;
        session.progress.processed_files = 1;
        store.update(session.clone()).await.unwrap();

        // No `scheduler.create_session` call: this is what a fresh process
        // actually starts with, since the scheduler persists nothing.
        let supervisor = RecoverySupervisor::new(store.clone(), workflow, scheduler.clone(), callbacks);
        let report = supervisor.run().await.unwrap();

        assert_eq!(report.resumed_count(), 1, "an absent scheduler queue must not hard-fail the session");
        assert!(scheduler.has_session(&session.id).await);

        let popped = scheduler.pop_next(&session.id).await.unwrap();
        assert!(matches!(popped, docorch_scheduler::PopOutcome::Eligible(_)));

        let reloaded = store.get(&session.id).await.unwrap();
        assert_eq!(reloaded.state, WorkflowState::Processing);
        assert_eq!(reloaded.progress.processed_files, 0, "stale per-file progress cannot be trusted once the queue is rebuilt");
        assert!(reloaded.progress.is_consistent());
    }

    #[tokio::test]
    async fn resumes_a_full_session_by_rebuilding_one_queue_per_thematic_group() {
        let (store, workflow, scheduler, callbacks) = harness();
        let mut session = store.create(SessionKind::Full, "ws", None, vec![]).await.unwrap();
        session.state = WorkflowState::Analyzing;
        session.thematic_groups = vec![
            docorch_types::ThematicGroup {
                theme: "auth".into(),
                file_paths: vec!["auth/mod.rs".into()],
                description: "auth module".into(),
                priority: 1,
                todo_list_id: "list-1".into(),
            },
            docorch_types::ThematicGroup {
                theme: "db".into(),
                file_paths: vec!["db/mod.rs".into()],
                description: "db module".into(),
                priority: 0,
                todo_list_id: "list-2".into(),
            },
        ];
        session.progress.total_files = 2;
        store.update(session.clone()).await.unwrap();

        let supervisor = RecoverySupervisor::new(store.clone(), workflow, scheduler.clone(), callbacks);
        let report = supervisor.run().await.unwrap();

        assert_eq!(report.resumed_count(), 1);
        let popped = scheduler.pop_next(&session.id).await.unwrap();
        let docorch_scheduler::PopOutcome::Eligible(item) = popped else { panic!("expected the higher-priority theme's item") };
        assert_eq!(item.file_path, "auth/mod.rs");
    }
}
