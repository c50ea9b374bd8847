use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use docorch_errors::OrchestratorError;
use docorch_types::{CallbackRecord, CallbackState, SessionId};
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Outcome = Result<Value, OrchestratorError>;

struct Entry {
    record: CallbackRecord,
    /// Taken by `wait()` the first time it is called; a second call finds
    /// `None` and fails, enforcing the single-consumer contract.
    receiver: Option<oneshot::Receiver<Outcome>>,
    sender: Option<oneshot::Sender<Outcome>>,
}

/// The only synchronization primitive shared between the outbound
/// "analyze this file" request path and the inbound callback-delivery path.
/// Session mutexes and scheduler locks are never held across a call here.
pub struct CallbackRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    /// `(session_id, file_path, attempt)` -> request_id, for idempotent registration.
    idempotency: RwLock<HashMap<(String, String, u32), String>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            idempotency: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a pending callback record and returns its request id. Calling
    /// this again with the same `(session_id, file_path, attempt)` returns
    /// the original request id rather than creating a second waiter.
    pub async fn register(
        &self,
        session_id: &SessionId,
        file_path: &str,
        attempt: u32,
        deadline: DateTime<Utc>,
    ) -> String {
        let key = (session_id.to_string(), file_path.to_string(), attempt);
        if let Some(existing) = self.idempotency.read().await.get(&key) {
            return existing.clone();
        }

        let mut idempotency = self.idempotency.write().await;
        if let Some(existing) = idempotency.get(&key) {
            return existing.clone();
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let record = CallbackRecord {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            file_path: file_path.to_string(),
            deadline,
            state: CallbackState::Pending,
            sent_at: Utc::now(),
        };
        self.entries.write().await.insert(
            request_id.clone(),
            Entry {
                record,
                receiver: Some(rx),
                sender: Some(tx),
            },
        );
        idempotency.insert(key, request_id.clone());
        request_id
    }

    /// Awaits delivery, cancellation, or timeout for `request_id`. Fails
    /// immediately with `already_awaited` if another caller already holds
    /// the waiter, and `unknown_request` if no such record exists.
    pub async fn wait(&self, request_id: &str) -> Outcome {
        let receiver = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(request_id).ok_or_else(|| unknown_request(request_id))?;
            entry.receiver.take().ok_or_else(|| {
                OrchestratorError::conflict(
                    "callback.already_awaited",
                    format!("request `{request_id}` already has a waiter"),
                )
            })?
        };
        receiver.await.unwrap_or_else(|_| {
            Err(OrchestratorError::internal(
                "callback.sender_dropped",
                "the callback's sender was dropped without resolving it",
            ))
        })
    }

    /// Atomically moves a `pending` record to `delivered` and wakes its waiter.
    pub async fn resolve(&self, request_id: &str, payload: Value) -> Result<(), OrchestratorError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(request_id).ok_or_else(|| unknown_request(request_id))?;
        if entry.record.state != CallbackState::Pending {
            return Err(OrchestratorError::conflict(
                "callback.already_resolved",
                format!("request `{request_id}` is `{:?}`, not pending", entry.record.state),
            ));
        }
        entry.record.state = CallbackState::Delivered;
        if let Some(sender) = entry.sender.take() {
            let _ = sender.send(Ok(payload));
        }
        Ok(())
    }

    /// Cancels every pending callback for `session_id`, waking each waiter
    /// with a cancellation error. Called automatically when a session
    /// reaches a terminal state.
    pub async fn cancel(&self, session_id: &SessionId) {
        let mut entries = self.entries.write().await;
        let session_id = session_id.to_string();
        for entry in entries.values_mut() {
            if entry.record.session_id != session_id || entry.record.state != CallbackState::Pending {
                continue;
            }
            entry.record.state = CallbackState::Cancelled;
            if let Some(sender) = entry.sender.take() {
                let _ = sender.send(Err(OrchestratorError::new(
                    docorch_errors::ErrorCategory::Internal,
                    "callback.cancelled",
                    "the owning session reached a terminal state",
                )));
            }
        }
    }

    /// Scans for pending records past their deadline, marks them
    /// `timed_out`, and wakes their waiters with a timeout error. Returns the
    /// request ids that were reaped.
    pub async fn reap_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let mut reaped = Vec::new();
        for (request_id, entry) in entries.iter_mut() {
            if entry.record.state == CallbackState::Pending && entry.record.deadline <= now {
                entry.record.state = CallbackState::TimedOut;
                if let Some(sender) = entry.sender.take() {
                    let _ = sender.send(Err(OrchestratorError::timeout(
                        "callback.timed_out",
                        format!("no analysis delivered for `{}` before the deadline", entry.record.file_path),
                    )));
                }
                reaped.push(request_id.clone());
            }
        }
        reaped
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_request(request_id: &str) -> OrchestratorError {
    OrchestratorError::not_found("callback.unknown_request", format!("no callback record for `{request_id}`"))
}

/// Periodic driver for `CallbackRegistry::reap_expired`.
pub struct ReaperTask {
    registry: Arc<CallbackRegistry>,
    interval: std::time::Duration,
}

impl ReaperTask {
    pub fn new(registry: Arc<CallbackRegistry>, interval: std::time::Duration) -> Self {
        Self { registry, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for request_id in self.registry.reap_expired().await {
                        tracing::warn!(request_id, "callback reaped after deadline");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent_per_attempt() {
        let registry = CallbackRegistry::new();
        let session_id = SessionId::new();
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let first = registry.register(&session_id, "src/lib.rs", 0, deadline).await;
        let second = registry.register(&session_id, "src/lib.rs", 0, deadline).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn resolve_wakes_the_waiter() {
        let registry = Arc::new(CallbackRegistry::new());
        let session_id = SessionId::new();
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let request_id = registry.register(&session_id, "src/lib.rs", 0, deadline).await;

        let waiting = {
            let registry = registry.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move { registry.wait(&request_id).await })
        };
        registry
            .resolve(&request_id, serde_json::json!({"summary": "ok"}))
            .await
            .unwrap();
        let payload = waiting.await.unwrap().unwrap();
        assert_eq!(payload["summary"], "ok");
    }

    #[tokio::test]
    async fn second_waiter_is_rejected() {
        let registry = CallbackRegistry::new();
        let session_id = SessionId::new();
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let request_id = registry.register(&session_id, "src/lib.rs", 0, deadline).await;

        let registry = Arc::new(registry);
        let first = registry.clone();
        let first_request = request_id.clone();
        tokio::spawn(async move { first.wait(&first_request).await });
        tokio::task::yield_now().await;

        let err = registry.wait(&request_id).await.unwrap_err();
        assert_eq!(err.code, "callback.already_awaited");
    }

    #[tokio::test]
    async fn reap_expired_times_out_past_deadline_requests() {
        let registry = CallbackRegistry::new();
        let session_id = SessionId::new();
        let deadline = Utc::now() - chrono::Duration::seconds(1);
        let request_id = registry.register(&session_id, "src/lib.rs", 0, deadline).await;

        let reaped = registry.reap_expired().await;
        assert_eq!(reaped, vec![request_id.clone()]);
        let err = registry.wait(&request_id).await.unwrap_err();
        assert_eq!(err.code, "callback.timed_out");
    }

    #[tokio::test]
    async fn cancel_wakes_all_pending_waiters_for_a_session() {
        let registry = Arc::new(CallbackRegistry::new());
        let session_id = SessionId::new();
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let request_id = registry.register(&session_id, "src/a.rs", 0, deadline).await;

        let registry2 = registry.clone();
        let request_id2 = request_id.clone();
        let waiting = tokio::spawn(async move { registry2.wait(&request_id2).await });
        tokio::task::yield_now().await;

        registry.cancel(&session_id).await;
        let result = waiting.await.unwrap();
        assert!(result.is_err());
    }
}
