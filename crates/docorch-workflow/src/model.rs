use chrono::{DateTime, Utc};
use docorch_types::{SessionKind, WorkflowState};
use serde::{Deserialize, Serialize};

/// The full event alphabet of the documentation workflow. Each event carries
/// exactly the guard inputs its transitions need; nothing more flows through
/// the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Start { kind: SessionKind },
    GroupingsReceived { group_count: u64 },
    Process,
    AnalysisReceived { processed: u64, total: u64 },
    Pause,
    Resume,
    Fail { reason: String },
    Cancel { reason: String },
    Complete,
    Retry { attempts: u32, max_attempts: u32 },
    MemoryEvolved,
    DocsGenerated,
    ConsensusOk { score: f64, threshold: f64 },
    ConsensusFail { score: f64, threshold: f64 },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Start { .. } => "start",
            WorkflowEvent::GroupingsReceived { .. } => "groupings_received",
            WorkflowEvent::Process => "process",
            WorkflowEvent::AnalysisReceived { .. } => "analysis_received",
            WorkflowEvent::Pause => "pause",
            WorkflowEvent::Resume => "resume",
            WorkflowEvent::Fail { .. } => "fail",
            WorkflowEvent::Cancel { .. } => "cancel",
            WorkflowEvent::Complete => "complete",
            WorkflowEvent::Retry { .. } => "retry",
            WorkflowEvent::MemoryEvolved => "memory_evolved",
            WorkflowEvent::DocsGenerated => "docs_generated",
            WorkflowEvent::ConsensusOk { .. } => "consensus_ok",
            WorkflowEvent::ConsensusFail { .. } => "consensus_fail",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub session_id: String,
    pub state: WorkflowState,
    pub history: Vec<TransitionRecord>,
    pub state_entered_at: DateTime<Utc>,
    /// Count of `fail -> retry` cycles, checked against the configured max by the `retry` guard.
    pub attempts: u32,
}

impl WorkflowRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: WorkflowState::Created,
            history: Vec::new(),
            state_entered_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Defensive copy of the transition history; callers never get a handle onto the live vec.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history.clone()
    }
}
