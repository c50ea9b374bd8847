use docorch_types::DependencyKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct FullDocumentationInput {
    pub workspace_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThematicGroupingInput {
    pub theme: String,
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvideThematicGroupingsInput {
    pub session_id: String,
    pub groupings: Vec<ThematicGroupingInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyFileInput {
    pub file_path: String,
    pub dependency_kind: DependencyKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvideDependencyFilesInput {
    pub session_id: String,
    pub requesting_path: String,
    pub deps: Vec<DependencyFileInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDocumentationInput {
    pub workspace_id: String,
    pub module_name: String,
    pub paths: Vec<String>,
    pub doc_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeFileCallbackInput {
    pub session_id: String,
    pub request_id: String,
    pub file_path: String,
    pub analysis: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetProjectStructureInput {
    pub workspace_path: String,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyDocumentationInput {
    pub doc_path: String,
    pub code_paths: Vec<String>,
    #[serde(default)]
    pub depth: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetDocumentationStatusInput {
    pub session_id: String,
}
