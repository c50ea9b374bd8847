use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Detail block nested inside every `ErrorEnvelope`. Mirrors
/// `docorch_errors::OrchestratorError` field-for-field but is the wire
/// shape, not the in-process type: the dispatcher is the only place that
/// translates one into the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub category: String,
    pub severity: String,
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub hints: Vec<String>,
}

/// Every tool failure returns exactly this shape. `hint` duplicates the
/// first recovery hint at the top level for callers that do not want to
/// parse `details.hints`; callers that want the full set read `details`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub details: ErrorDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}
