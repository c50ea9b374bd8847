use docorch_types::Progress;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct FullDocumentationResult {
    pub session_id: String,
    pub status: String,
    pub next_action_hint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvideThematicGroupingsResult {
    pub session_id: String,
    pub status: String,
    pub theme_count: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDocumentationResult {
    pub session_id: String,
    pub status: String,
}

/// Generic acknowledgement used by `provide_dependency_files` and
/// `analyze_file_callback`.
#[derive(Debug, Clone, Serialize)]
pub struct AckResult {
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetProjectStructureResult {
    pub workspace_id: String,
    pub paths: Vec<String>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyDocumentationResult {
    pub report_id: String,
    pub findings_summary: String,
    pub finding_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetDocumentationStatusResult {
    pub session_id: String,
    pub state: String,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

/// Outbound server-to-agent notification: "please analyze this file".
/// Responses arrive back via `analyze_file_callback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeFileRequestNotification {
    pub session_id: String,
    pub request_id: String,
    pub file_path: String,
    pub prompt: String,
}
