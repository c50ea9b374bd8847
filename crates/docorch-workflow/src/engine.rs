use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docorch_errors::OrchestratorError;
use docorch_types::{SessionId, WorkflowState};
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::model::{TransitionRecord, WorkflowEvent, WorkflowRecord};
use crate::transitions::{self, TransitionRejection};

/// Runs before a session is allowed to settle into `to`. A failing validator
/// rolls the transition back: the session's prior state is restored and
/// `invalid_state` is returned.
pub trait EntryValidator: Send + Sync {
    fn validate(&self, to: WorkflowState, record: &WorkflowRecord) -> Result<(), OrchestratorError>;
}

/// Observes committed transitions. Hooks must not call back into the engine
/// for the same session; doing so is the one case `apply_event` itself
/// guards against and reports as `reentrancy_error`.
pub trait TransitionHooks: Send + Sync {
    fn on_exit(&self, _from: WorkflowState, _record: &WorkflowRecord) {}
    fn on_enter(&self, _to: WorkflowState, _record: &WorkflowRecord) {}
}

struct NoopHooks;
impl TransitionHooks for NoopHooks {}

struct SessionSlot {
    record: Mutex<WorkflowRecord>,
    /// Non-reentrant guard: true while a transition for this session is in
    /// flight, so a hook that tries to trigger another event on the same
    /// session is rejected instead of deadlocking on the mutex.
    in_flight: AtomicBool,
}

/// Per-session finite state machine store. Lock order contract: callers that
/// also touch the session store or TODO scheduler for the same session must
/// acquire this engine's per-session lock first.
pub struct WorkflowEngine {
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    validators: RwLock<HashMap<String, Arc<dyn EntryValidator>>>,
    hooks: RwLock<Arc<dyn TransitionHooks>>,
    state_timeouts: RwLock<HashMap<String, Duration>>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Arc::new(NoopHooks)),
            state_timeouts: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_hooks(&self, hooks: Arc<dyn TransitionHooks>) {
        *self.hooks.write().await = hooks;
    }

    pub async fn register_validator(&self, state: WorkflowState, validator: Arc<dyn EntryValidator>) {
        self.validators
            .write()
            .await
            .insert(state_key(state), validator);
    }

    pub async fn set_state_timeout(&self, state: WorkflowState, timeout: Duration) {
        self.state_timeouts
            .write()
            .await
            .insert(state_key(state), timeout);
    }

    /// Creates a fresh `WorkflowRecord` in state `created` for a new session.
    /// Idempotent if called twice for the same id: the second call is a no-op
    /// and returns the existing record.
    pub async fn create(&self, session_id: &SessionId) -> WorkflowRecord {
        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                Arc::new(SessionSlot {
                    record: Mutex::new(WorkflowRecord::new(session_id.to_string())),
                    in_flight: AtomicBool::new(false),
                })
            })
            .clone();
        drop(sessions);
        slot.record.lock().await.clone_for_read()
    }

    pub async fn current(&self, session_id: &SessionId) -> Option<WorkflowRecord> {
        let slot = self.sessions.read().await.get(session_id)?.clone();
        Some(slot.record.lock().await.clone_for_read())
    }

    /// Seeds a fresh in-memory `WorkflowRecord` at `state` rather than
    /// `created`, for the Recovery Supervisor to reconstruct engine state
    /// after a restart from the Session Store's persisted
    /// `session.state` (the engine itself keeps no durable copy of its
    /// own). A no-op if a record for this session is already tracked.
    pub async fn seed(&self, session_id: &SessionId, state: WorkflowState) -> WorkflowRecord {
        let mut sessions = self.sessions.write().await;
        let slot = sessions.entry(session_id.clone()).or_insert_with(|| {
            let mut record = WorkflowRecord::new(session_id.to_string());
            record.state = state;
            Arc::new(SessionSlot {
                record: Mutex::new(record),
                in_flight: AtomicBool::new(false),
            })
        });
        slot.record.lock().await.clone_for_read()
    }

    /// Re-invokes the current state's entry hook without altering history
    /// or state. Used by the Recovery Supervisor to restart whatever
    /// background work a state's `on_enter` hook triggers (e.g. popping the
    /// next TODO item) after a crash, without replaying the transition that
    /// originally produced this state.
    pub async fn reinvoke_entry_hook(&self, session_id: &SessionId) -> Option<WorkflowRecord> {
        let slot = self.sessions.read().await.get(session_id)?.clone();
        let record = slot.record.lock().await;
        let hooks = self.hooks.read().await.clone();
        hooks.on_enter(record.state, &record);
        Some(record.clone_for_read())
    }

    /// Forces a non-terminal session straight to `expired`, bypassing the
    /// transition table: no event in §4.3's alphabet drives this edge, it
    /// only happens when the Session Store's TTL sweeper (or the Recovery
    /// Supervisor replaying one) has already decided the session is past
    /// its expiry. A no-op if the session is already terminal.
    pub async fn force_expire(&self, session_id: &SessionId) -> Option<WorkflowRecord> {
        let slot = self.sessions.read().await.get(session_id)?.clone();
        let mut record = slot.record.lock().await;
        if record.state.is_terminal() {
            return Some(record.clone_for_read());
        }
        let from = record.state;
        record.history.push(TransitionRecord {
            from,
            to: WorkflowState::Expired,
            timestamp: Utc::now(),
            event: "expire".to_string(),
            reason: Some("session_ttl_elapsed".to_string()),
        });
        record.state = WorkflowState::Expired;
        record.state_entered_at = Utc::now();
        Some(record.clone_for_read())
    }

    /// Applies `event` to `session_id`'s current state using the single
    /// transition table in `transitions::apply`. On success the history gets
    /// one new entry and hooks fire; on guard failure or missing row nothing
    /// changes and an `invalid_state` error is returned.
    pub async fn apply_event(
        &self,
        session_id: &SessionId,
        event: WorkflowEvent,
    ) -> Result<WorkflowRecord, OrchestratorError> {
        let slot = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_id.clone())
                .or_insert_with(|| {
                    Arc::new(SessionSlot {
                        record: Mutex::new(WorkflowRecord::new(session_id.to_string())),
                        in_flight: AtomicBool::new(false),
                    })
                })
                .clone()
        };

        if slot.in_flight.swap(true, Ordering::AcqRel) {
            return Err(OrchestratorError::invalid_state(
                "workflow.reentrancy_error",
                "an event is already being applied for this session",
            ));
        }
        let result = self.apply_event_locked(&slot, event).await;
        slot.in_flight.store(false, Ordering::Release);
        result
    }

    async fn apply_event_locked(
        &self,
        slot: &SessionSlot,
        event: WorkflowEvent,
    ) -> Result<WorkflowRecord, OrchestratorError> {
        let mut record = slot.record.lock().await;
        let from = record.state;
        let event_name = event.name();

        let to = match transitions::apply(from, &event) {
            Ok(to) => to,
            Err(TransitionRejection::NoSuchTransition) => {
                return Err(OrchestratorError::invalid_state(
                    "workflow.no_such_transition",
                    format!("event `{event_name}` is not valid from state `{from}`"),
                ))
            }
            Err(TransitionRejection::GuardFailed(reason)) => {
                return Err(OrchestratorError::invalid_state(
                    "workflow.guard_failed",
                    format!("event `{event_name}` from `{from}` rejected: {reason}"),
                ))
            }
        };

        if let Some(validator) = self.validators.read().await.get(&state_key(to)).cloned() {
            if let Err(err) = validator.validate(to, &record) {
                // Roll back: the prior state is untouched because we have not
                // mutated `record` yet, so there is nothing to restore beyond
                // surfacing the error.
                return Err(err);
            }
        }

        let reason = match &event {
            WorkflowEvent::Fail { reason } | WorkflowEvent::Cancel { reason } => {
                Some(reason.clone())
            }
            _ => None,
        };

        let hooks = self.hooks.read().await.clone();
        hooks.on_exit(from, &record);

        record.history.push(TransitionRecord {
            from,
            to,
            timestamp: Utc::now(),
            event: event_name.to_string(),
            reason,
        });
        record.state = to;
        record.state_entered_at = Utc::now();
        if matches!(event, WorkflowEvent::Retry { .. }) {
            record.attempts += 1;
        }

        hooks.on_enter(to, &record);

        Ok(record.clone_for_read())
    }

    /// Scans every tracked session for a state-entry timeout breach and fails
    /// it with reason `state_timeout`. Intended to be driven by a periodic
    /// supervisor task (`TimeoutSupervisor::run`); exposed directly so tests
    /// can call it without sleeping.
    pub async fn sweep_timeouts(&self) -> Vec<SessionId> {
        let timeouts = self.state_timeouts.read().await.clone();
        let slots: Vec<(SessionId, Arc<SessionSlot>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut timed_out = Vec::new();
        for (id, slot) in slots {
            let snapshot = slot.record.lock().await.clone_for_read();
            if snapshot.state.is_terminal() {
                continue;
            }
            let Some(limit) = timeouts.get(&state_key(snapshot.state)) else {
                continue;
            };
            let elapsed = Utc::now() - snapshot.state_entered_at;
            let breached = match elapsed.to_std() {
                Ok(elapsed_std) => elapsed_std > *limit,
                Err(_) => false,
            };
            if breached {
                if self
                    .apply_event(
                        &id,
                        WorkflowEvent::Fail {
                            reason: "state_timeout".to_string(),
                        },
                    )
                    .await
                    .is_ok()
                {
                    timed_out.push(id);
                }
            }
        }
        timed_out
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRecord {
    fn clone_for_read(&self) -> WorkflowRecord {
        self.clone()
    }
}

fn state_key(state: WorkflowState) -> String {
    state.to_string()
}

/// Periodic driver for `WorkflowEngine::sweep_timeouts`, cancellable via the
/// supplied token so a graceful drain can stop it alongside the dispatcher.
pub struct TimeoutSupervisor {
    engine: Arc<WorkflowEngine>,
    interval: Duration,
}

impl TimeoutSupervisor {
    pub fn new(engine: Arc<WorkflowEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let timed_out = self.engine.sweep_timeouts().await;
                    for id in timed_out {
                        tracing::warn!(session_id = %id, "workflow state timed out");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docorch_types::SessionKind;

    #[tokio::test]
    async fn apply_event_advances_state_and_records_history() {
        let engine = WorkflowEngine::new();
        let id = SessionId::new();
        engine.create(&id).await;

        let record = engine
            .apply_event(&id, WorkflowEvent::Start { kind: SessionKind::Module })
            .await
            .unwrap();
        assert_eq!(record.state, WorkflowState::Processing);
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].from, WorkflowState::Created);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state_untouched() {
        let engine = WorkflowEngine::new();
        let id = SessionId::new();
        engine.create(&id).await;

        let err = engine.apply_event(&id, WorkflowEvent::Process).await.unwrap_err();
        assert_eq!(err.code, "workflow.no_such_transition");
        let record = engine.current(&id).await.unwrap();
        assert_eq!(record.state, WorkflowState::Created);
    }

    struct RejectGeneratingDocs;
    impl EntryValidator for RejectGeneratingDocs {
        fn validate(&self, _to: WorkflowState, _record: &WorkflowRecord) -> Result<(), OrchestratorError> {
            Err(OrchestratorError::invalid_state("test.reject", "nope"))
        }
    }

    #[tokio::test]
    async fn failing_entry_validator_rolls_back() {
        let engine = WorkflowEngine::new();
        engine
            .register_validator(WorkflowState::ConsensusReview, Arc::new(RejectGeneratingDocs))
            .await;
        let id = SessionId::new();
        engine.create(&id).await;
        engine
            .apply_event(&id, WorkflowEvent::Start { kind: SessionKind::Module })
            .await
            .unwrap();
        engine.apply_event(&id, WorkflowEvent::Process).await.unwrap();
        engine
            .apply_event(&id, WorkflowEvent::AnalysisReceived { processed: 1, total: 1 })
            .await
            .unwrap();
        engine.apply_event(&id, WorkflowEvent::MemoryEvolved).await.unwrap();

        let err = engine
            .apply_event(&id, WorkflowEvent::DocsGenerated)
            .await
            .unwrap_err();
        assert_eq!(err.code, "test.reject");
        let record = engine.current(&id).await.unwrap();
        assert_eq!(record.state, WorkflowState::GeneratingDocs);
    }

    #[tokio::test]
    async fn force_expire_bypasses_the_transition_table() {
        let engine = WorkflowEngine::new();
        let id = SessionId::new();
        engine.create(&id).await;
        engine
            .apply_event(&id, WorkflowEvent::Start { kind: SessionKind::Module })
            .await
            .unwrap();

        let record = engine.force_expire(&id).await.unwrap();
        assert_eq!(record.state, WorkflowState::Expired);
        assert_eq!(record.history.last().unwrap().event, "expire");

        let again = engine.force_expire(&id).await.unwrap();
        assert_eq!(again.state, WorkflowState::Expired);
    }

    #[tokio::test]
    async fn state_timeout_fails_the_session() {
        let engine = Arc::new(WorkflowEngine::new());
        engine
            .set_state_timeout(WorkflowState::Processing, Duration::from_millis(0))
            .await;
        let id = SessionId::new();
        engine.create(&id).await;
        engine
            .apply_event(&id, WorkflowEvent::Start { kind: SessionKind::Module })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let timed_out = engine.sweep_timeouts().await;
        assert_eq!(timed_out, vec![id.clone()]);
        let record = engine.current(&id).await.unwrap();
        assert_eq!(record.state, WorkflowState::Failed);
    }
}
