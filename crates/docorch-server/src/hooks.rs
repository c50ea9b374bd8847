use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use docorch_callbacks::CallbackRegistry;
use docorch_scheduler::{PopOutcome, TodoScheduler, UpdateOutcome};
use docorch_store::SessionStore;
use docorch_types::{SessionId, TodoStatus, WorkflowState};
use docorch_wire::AnalyzeFileRequestNotification;
use docorch_workflow::{TransitionHooks, WorkflowEngine, WorkflowEvent, WorkflowRecord};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{ConsensusCollaborator, DocGenerationCollaborator, MemoryEvolutionCollaborator};

/// Outbound mailbox of `analyze_file_request` notifications awaiting
/// delivery to an agent, per session. A tool dispatcher client drains this
/// via `GET /session/{id}/notifications`; there is no push transport in this
/// core.
#[derive(Default)]
pub struct Outbox {
    pending: Mutex<HashMap<SessionId, Vec<AnalyzeFileRequestNotification>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, session_id: &SessionId, notification: AnalyzeFileRequestNotification) {
        self.pending
            .lock()
            .await
            .entry(session_id.clone())
            .or_default()
            .push(notification);
    }

    /// Drains and returns every notification queued for `session_id`.
    pub async fn drain(&self, session_id: &SessionId) -> Vec<AnalyzeFileRequestNotification> {
        self.pending.lock().await.remove(session_id).unwrap_or_default()
    }
}

/// Bridges workflow-state entry/exit to the scheduler and the callback
/// registry. `on_enter`/`on_exit` are synchronous (the engine enforces
/// non-reentrancy by guarding itself, not by letting hooks await); all real
/// work here is handed off to a detached task so it runs after the engine
/// has released its in-flight guard for this transition.
pub struct DispatcherHooks {
    pub workflow: Arc<WorkflowEngine>,
    pub scheduler: Arc<TodoScheduler>,
    pub callbacks: Arc<CallbackRegistry>,
    pub store: Arc<SessionStore>,
    pub outbox: Arc<Outbox>,
    pub callback_deadline: Duration,
    pub worker_concurrency: usize,
    pub memory_evolution: Arc<dyn MemoryEvolutionCollaborator>,
    pub doc_generation: Arc<dyn DocGenerationCollaborator>,
    pub consensus: Arc<dyn ConsensusCollaborator>,
    pub consensus_threshold: f64,
    pub consensus_max_attempts: u32,
    /// Sessions whose workers have already been spawned. `analysis_received`
    /// bounces the state `analyzing -> processing -> analyzing` on every
    /// item that doesn't finish the batch, purely to keep polled status
    /// accurate; this guard stops that bounce from spawning a fresh worker
    /// pool each time.
    spawned: StdMutex<HashSet<SessionId>>,
}

impl DispatcherHooks {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow: Arc<WorkflowEngine>,
        scheduler: Arc<TodoScheduler>,
        callbacks: Arc<CallbackRegistry>,
        store: Arc<SessionStore>,
        outbox: Arc<Outbox>,
        callback_deadline: Duration,
        worker_concurrency: usize,
        memory_evolution: Arc<dyn MemoryEvolutionCollaborator>,
        doc_generation: Arc<dyn DocGenerationCollaborator>,
        consensus: Arc<dyn ConsensusCollaborator>,
        consensus_threshold: f64,
        consensus_max_attempts: u32,
    ) -> Self {
        Self {
            workflow,
            scheduler,
            callbacks,
            store,
            outbox,
            callback_deadline,
            worker_concurrency,
            memory_evolution,
            doc_generation,
            consensus,
            consensus_threshold,
            consensus_max_attempts,
            spawned: StdMutex::new(HashSet::new()),
        }
    }
}

impl TransitionHooks for DispatcherHooks {
    fn on_enter(&self, to: WorkflowState, record: &WorkflowRecord) {
        let session_id = SessionId(record.session_id.clone());

        // A batch genuinely finishing (or the session leaving the analysis
        // loop altogether) clears the guard so a later retry respawns a
        // fresh worker pool instead of finding the guard already tripped.
        if matches!(
            to,
            WorkflowState::EvolvingMemory
                | WorkflowState::Failed
                | WorkflowState::Cancelled
                | WorkflowState::Completed
        ) {
            self.spawned.lock().unwrap().remove(&session_id);
        }
        if matches!(
            to,
            WorkflowState::Failed | WorkflowState::Cancelled | WorkflowState::Completed
        ) {
            // §5: "terminal-state sessions cancel their outstanding callbacks
            // automatically." `cancel` is async and `on_enter` is not, so this
            // hands off to a detached task rather than blocking the engine's
            // record lock on it.
            let callbacks = self.callbacks.clone();
            let cancel_session_id = session_id.clone();
            tokio::spawn(async move { callbacks.cancel(&cancel_session_id).await });
        }

        if matches!(to, WorkflowState::Analyzing) {
            if self.spawned.lock().unwrap().insert(session_id.clone()) {
                for _ in 0..self.worker_concurrency {
                    spawn_worker(
                        session_id.clone(),
                        self.workflow.clone(),
                        self.scheduler.clone(),
                        self.callbacks.clone(),
                        self.store.clone(),
                        self.outbox.clone(),
                        self.callback_deadline,
                    );
                }
            }
            return;
        }

        if matches!(to, WorkflowState::EvolvingMemory) {
            spawn_finishing_stage(
                session_id,
                self.workflow.clone(),
                self.store.clone(),
                self.memory_evolution.clone(),
                self.doc_generation.clone(),
                self.consensus.clone(),
                self.consensus_threshold,
                self.consensus_max_attempts,
            );
        }
    }
}

/// Carries a session from `evolving_memory` through to `completed` or
/// `failed`, running the three collaborator stubs in sequence and
/// persisting `session.state`/`artifact_path` after each event so a
/// concurrent `get_documentation_status` never observes a stale state.
#[allow(clippy::too_many_arguments)]
fn spawn_finishing_stage(
    session_id: SessionId,
    workflow: Arc<WorkflowEngine>,
    store: Arc<SessionStore>,
    memory_evolution: Arc<dyn MemoryEvolutionCollaborator>,
    doc_generation: Arc<dyn DocGenerationCollaborator>,
    consensus: Arc<dyn ConsensusCollaborator>,
    consensus_threshold: f64,
    consensus_max_attempts: u32,
) {
    tokio::spawn(async move {
        let Ok(session) = store.get(&session_id).await else {
            tracing::warn!(session_id = %session_id, "finishing stage could not load session");
            return;
        };

        memory_evolution.evolve(&session).await;
        if !sync_event(&workflow, &store, &session_id, WorkflowEvent::MemoryEvolved).await {
            return;
        }

        let mut attempts = 0u32;
        loop {
            let Ok(session) = store.get(&session_id).await else { return };
            let doc_outcome = doc_generation.generate(&session).await;
            let synced = store
                .update_with_retry(&session_id, |s| {
                    s.artifact_path = Some(doc_outcome.artifact_path.clone());
                })
                .await;
            if synced.is_err() {
                tracing::warn!(session_id = %session_id, "failed to persist generated artifact path");
                return;
            }
            if !sync_event(&workflow, &store, &session_id, WorkflowEvent::DocsGenerated).await {
                return;
            }

            let session = match store.get(&session_id).await {
                Ok(s) => s,
                Err(_) => return,
            };
            let review = consensus.review(&session, consensus_threshold).await;
            if review.passed() {
                let _ = sync_event(
                    &workflow,
                    &store,
                    &session_id,
                    WorkflowEvent::ConsensusOk { score: review.score, threshold: review.threshold },
                )
                .await;
                return;
            }

            attempts += 1;
            if attempts >= consensus_max_attempts {
                tracing::warn!(session_id = %session_id, attempts, "consensus review exhausted its retry budget");
                let _ = workflow
                    .apply_event(&session_id, WorkflowEvent::Fail { reason: "consensus_exhausted".to_string() })
                    .await;
                let _ = store
                    .update_with_retry(&session_id, |s| s.state = WorkflowState::Failed)
                    .await;
                return;
            }
            if !sync_event(
                &workflow,
                &store,
                &session_id,
                WorkflowEvent::ConsensusFail { score: review.score, threshold: review.threshold },
            )
            .await
            {
                return;
            }
        }
    });
}

/// Applies `event`, and on success persists the resulting state to the
/// Session Store before returning. Returns `false` (and logs) if either the
/// transition or the persist failed, so callers can stop the driver rather
/// than continue from a state the store disagrees with.
async fn sync_event(
    workflow: &WorkflowEngine,
    store: &SessionStore,
    session_id: &SessionId,
    event: WorkflowEvent,
) -> bool {
    let event_name = event.name();
    let record = match workflow.apply_event(session_id, event).await {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(session_id = %session_id, event = event_name, error = %err, "finishing stage transition rejected");
            return false;
        }
    };
    if let Err(err) = store.update_with_retry(session_id, |s| s.state = record.state).await {
        tracing::warn!(session_id = %session_id, error = %err, "failed to persist finishing-stage state");
        return false;
    }
    true
}

/// One worker: pop the next eligible TODO item, hand it to an agent via the
/// outbox, and await its callback resolution before popping the next one.
/// Several of these run concurrently per session (bounded by
/// `worker_concurrency`), matching §6's "worker concurrency" config knob.
fn spawn_worker(
    session_id: SessionId,
    workflow: Arc<WorkflowEngine>,
    scheduler: Arc<TodoScheduler>,
    callbacks: Arc<CallbackRegistry>,
    store: Arc<SessionStore>,
    outbox: Arc<Outbox>,
    deadline: Duration,
) {
    tokio::spawn(async move {
        let mut consecutive_blocked = 0;
        loop {
            let outcome = match scheduler.pop_next(&session_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "worker could not pop next item");
                    return;
                }
            };

            match outcome {
                PopOutcome::Drained => return,
                PopOutcome::Blocked => {
                    consecutive_blocked += 1;
                    if consecutive_blocked > 200 {
                        tracing::warn!(session_id = %session_id, "worker gave up waiting on blocked items");
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                PopOutcome::Eligible(item) => {
                    consecutive_blocked = 0;
                    let request_deadline = Utc::now() + chrono::Duration::from_std(deadline).unwrap_or(chrono::Duration::seconds(300));
                    let request_id = callbacks
                        .register(&session_id, &item.file_path, item.attempts, request_deadline)
                        .await;
                    outbox
                        .push(
                            &session_id,
                            AnalyzeFileRequestNotification {
                                session_id: session_id.to_string(),
                                request_id: request_id.clone(),
                                file_path: item.file_path.clone(),
                                prompt: format!("Analyze `{}` and report its structure.", item.file_path),
                            },
                        )
                        .await;

                    let outcome = callbacks.wait(&request_id).await;
                    let update_result = match outcome {
                        Ok(_analysis) => scheduler.update(&session_id, &item.file_path, TodoStatus::Completed, None).await,
                        Err(err) => {
                            scheduler
                                .update(&session_id, &item.file_path, TodoStatus::Failed, Some(err.message.clone()))
                                .await
                        }
                    };
                    match update_result {
                        Ok(outcome) => {
                            record_progress(&store, &session_id, outcome).await;
                            advance_after_item_outcome(&workflow, &store, &session_id).await;
                        }
                        Err(err) => {
                            tracing::warn!(session_id = %session_id, file_path = %item.file_path, error = %err, "failed to record item outcome");
                        }
                    }
                }
            }
        }
    });
}

/// Folds one item's outcome into the session's progress counters, the
/// source of truth §4.4 requires workers reconcile into the session on
/// flush. `RetryScheduled` touches nothing: the item is back in `pending`
/// and has not yet consumed its final outcome.
async fn record_progress(store: &SessionStore, session_id: &SessionId, outcome: UpdateOutcome) {
    let result = store
        .update_with_retry(session_id, |session| match outcome {
            UpdateOutcome::Completed => session.progress.processed_files += 1,
            UpdateOutcome::Skipped => session.progress.skipped_files += 1,
            UpdateOutcome::Exhausted => session.progress.failed_files += 1,
            UpdateOutcome::RetryScheduled => {}
        })
        .await;
    if let Err(err) = result {
        tracing::warn!(session_id = %session_id, error = %err, "failed to persist progress update");
    }
}

/// Applies `analysis_received` once every TODO item has left `pending`/
/// `in_progress`, using the session's persisted progress counters as the
/// source of truth for `processed`/`total`. Called by the dispatcher after
/// each `analyze_file_callback` resolves, since the hook above cannot call
/// back into the engine itself (reentrancy is forbidden).
pub async fn advance_after_item_outcome(
    workflow: &WorkflowEngine,
    store: &SessionStore,
    session_id: &SessionId,
) {
    let Ok(session) = store.get(session_id).await else { return };
    let processed = session.progress.processed_files + session.progress.failed_files + session.progress.skipped_files;
    let total = session.progress.total_files;
    let Ok(record) = workflow
        .apply_event(session_id, WorkflowEvent::AnalysisReceived { processed, total })
        .await
    else {
        return;
    };
    let _ = store.update_with_retry(session_id, |s| s.state = record.state).await;

    // The batch isn't done: the table's guard routed us through `processing`
    // rather than `evolving_memory`. Bounce straight back to `analyzing` so
    // polled status reflects work still in flight; the workers popping
    // items never stopped running, so this never spawns a second pool.
    if record.state == WorkflowState::Processing {
        if let Ok(record) = workflow.apply_event(session_id, WorkflowEvent::Process).await {
            let _ = store.update_with_retry(session_id, |s| s.state = record.state).await;
        }
    }
}

/// Periodic driver that ties the Session Store's TTL sweep to the other two
/// components it cannot itself depend on (§2's dependency order puts Session
/// Store, Workflow Engine, and Callback Registry as peers, all leaves). Per
/// §4.2's "no CallbackRecord outlives its owning session" and §5's
/// "terminal-state sessions cancel their outstanding callbacks
/// automatically": every session `SessionStore::cleanup` marks `expired`
/// also gets its `WorkflowRecord` force-expired and its pending callbacks
/// cancelled, so neither lags the session by one sweep interval.
pub struct ExpirySweeper {
    store: Arc<SessionStore>,
    workflow: Arc<WorkflowEngine>,
    callbacks: Arc<CallbackRegistry>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<SessionStore>, workflow: Arc<WorkflowEngine>, callbacks: Arc<CallbackRegistry>, interval: Duration) -> Self {
        Self { store, workflow, callbacks, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.store.cleanup().await {
                        Ok(swept) => {
                            for session_id in swept {
                                self.workflow.force_expire(&session_id).await;
                                self.callbacks.cancel(&session_id).await;
                                tracing::info!(session_id = %session_id, "session expired, workflow and callbacks synced");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "expiry sweep failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docorch_store::{FileEventLogRepository, FileSessionRepository, SessionStoreConfig};
    use docorch_types::SessionKind;
    use std::num::NonZeroUsize;

    #[tokio::test]
    async fn expiry_sweep_forces_workflow_and_cancels_callbacks() {
        let store = Arc::new(SessionStore::new(
            Arc::new(FileSessionRepository::in_memory()),
            Arc::new(FileEventLogRepository::in_memory()),
            SessionStoreConfig {
                ttl: chrono::Duration::milliseconds(1),
                cache_capacity: NonZeroUsize::new(8).unwrap(),
                ..SessionStoreConfig::default()
            },
        ));
        let workflow = Arc::new(WorkflowEngine::new());
        let callbacks = Arc::new(CallbackRegistry::new());

        let session = store.create(SessionKind::Module, "ws", None, vec!["a.rs".into()]).await.unwrap();
        store
            .update_with_retry(&session.id, |s| s.state = WorkflowState::Processing)
            .await
            .unwrap();
        workflow.seed(&session.id, WorkflowState::Processing).await;
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let request_id = callbacks.register(&session.id, "a.rs", 0, deadline).await;

        tokio::time::sleep(Duration::from_millis(5)).await;

        let cancel = CancellationToken::new();
        let sweeper = ExpirySweeper::new(store.clone(), workflow.clone(), callbacks.clone(), Duration::from_millis(5));
        let handle = tokio::spawn(sweeper.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        handle.await.unwrap();

        let record = workflow.current(&session.id).await.unwrap();
        assert_eq!(record.state, WorkflowState::Expired);

        let err = callbacks.wait(&request_id).await.unwrap_err();
        assert_eq!(err.code, "callback.cancelled");
    }

    #[tokio::test]
    async fn entering_a_terminal_state_cancels_outstanding_callbacks() {
        use crate::collaborators::{StubConsensus, StubDocGeneration, StubMemoryEvolution};
        use docorch_errors::BackoffPolicy;
        use docorch_scheduler::TodoScheduler;

        let store = Arc::new(SessionStore::new(
            Arc::new(FileSessionRepository::in_memory()),
            Arc::new(FileEventLogRepository::in_memory()),
            SessionStoreConfig { cache_capacity: NonZeroUsize::new(8).unwrap(), ..SessionStoreConfig::default() },
        ));
        let workflow = Arc::new(WorkflowEngine::new());
        let scheduler = Arc::new(TodoScheduler::new(BackoffPolicy::default()));
        let callbacks = Arc::new(CallbackRegistry::new());
        let outbox = Arc::new(Outbox::new());

        let hooks = Arc::new(DispatcherHooks::new(
            workflow.clone(),
            scheduler,
            callbacks.clone(),
            store.clone(),
            outbox,
            Duration::from_secs(30),
            1,
            Arc::new(StubMemoryEvolution),
            Arc::new(StubDocGeneration),
            Arc::new(StubConsensus),
            0.5,
            3,
        ));
        workflow.set_hooks(hooks).await;

        let session = store.create(SessionKind::Module, "ws", None, vec!["a.rs".into()]).await.unwrap();
        workflow.seed(&session.id, WorkflowState::Processing).await;
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let request_id = callbacks.register(&session.id, "a.rs", 0, deadline).await;

        workflow
            .apply_event(&session.id, WorkflowEvent::Fail { reason: "boom".to_string() })
            .await
            .unwrap();

        // The cancel is handed off to a detached task; give it a beat to run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = callbacks.wait(&request_id).await.unwrap_err();
        assert_eq!(err.code, "callback.cancelled");
    }
}
