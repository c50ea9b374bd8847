use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Append-only audit trail entry. The Recovery Supervisor is the primary
/// reader; the Tool Dispatcher is the primary writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub session_id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl EventLogEntry {
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>, data: Value) -> Self {
        Self {
            session_id: session_id.into(),
            kind: kind.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}
