use std::collections::HashMap;
use std::sync::LazyLock;

use docorch_errors::{ErrorCategory, OrchestratorError, RecoveryHint};
use serde_json::{json, Value};

/// Compiled once at process start. §4.1 step 4: every tool's payload is
/// checked against its declared schema before the handler ever sees it.
static SCHEMAS: LazyLock<HashMap<&'static str, jsonschema::Validator>> = LazyLock::new(|| {
    let mut schemas = HashMap::new();
    for (method, schema) in method_schemas() {
        let validator = jsonschema::validator_for(&schema)
            .unwrap_or_else(|e| panic!("schema for `{method}` does not compile: {e}"));
        schemas.insert(method, validator);
    }
    schemas
});

fn method_schemas() -> Vec<(&'static str, Value)> {
    vec![
        (
            "full_documentation",
            json!({
                "type": "object",
                "required": ["workspace_id"],
                "properties": { "workspace_id": { "type": "string", "minLength": 1 } }
            }),
        ),
        (
            "provide_thematic_groupings",
            json!({
                "type": "object",
                "required": ["session_id", "groupings"],
                "properties": {
                    "session_id": { "type": "string", "minLength": 1 },
                    "groupings": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "required": ["theme", "file_paths"],
                            "properties": {
                                "theme": { "type": "string", "minLength": 1 },
                                "file_paths": { "type": "array", "items": { "type": "string" } },
                                "description": { "type": "string" },
                                "priority": { "type": "integer" }
                            }
                        }
                    }
                }
            }),
        ),
        (
            "provide_dependency_files",
            json!({
                "type": "object",
                "required": ["session_id", "requesting_path", "deps"],
                "properties": {
                    "session_id": { "type": "string", "minLength": 1 },
                    "requesting_path": { "type": "string", "minLength": 1 },
                    "deps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["file_path", "dependency_kind"],
                            "properties": {
                                "file_path": { "type": "string", "minLength": 1 },
                                "dependency_kind": {
                                    "type": "string",
                                    "enum": ["import", "injection", "reference", "config"]
                                }
                            }
                        }
                    }
                }
            }),
        ),
        (
            "create_documentation",
            json!({
                "type": "object",
                "required": ["workspace_id", "module_name", "paths", "doc_type"],
                "properties": {
                    "workspace_id": { "type": "string", "minLength": 1 },
                    "module_name": { "type": "string", "minLength": 1 },
                    "paths": { "type": "array", "minItems": 1, "items": { "type": "string" } },
                    "doc_type": { "type": "string", "minLength": 1 }
                }
            }),
        ),
        (
            "analyze_file_callback",
            json!({
                "type": "object",
                "required": ["session_id", "request_id", "file_path", "analysis"],
                "properties": {
                    "session_id": { "type": "string", "minLength": 1 },
                    "request_id": { "type": "string", "minLength": 1 },
                    "file_path": { "type": "string", "minLength": 1 },
                    "analysis": {}
                }
            }),
        ),
        (
            "get_project_structure",
            json!({
                "type": "object",
                "required": ["workspace_path"],
                "properties": {
                    "workspace_path": { "type": "string", "minLength": 1 },
                    "include_globs": { "type": "array", "items": { "type": "string" } },
                    "exclude_globs": { "type": "array", "items": { "type": "string" } },
                    "max_depth": { "type": "integer", "minimum": 0 },
                    "continuation_token": { "type": "string" }
                }
            }),
        ),
        (
            "verify_documentation",
            json!({
                "type": "object",
                "required": ["doc_path", "code_paths"],
                "properties": {
                    "doc_path": { "type": "string", "minLength": 1 },
                    "code_paths": { "type": "array", "items": { "type": "string" } },
                    "depth": { "type": "string" }
                }
            }),
        ),
        (
            "get_documentation_status",
            json!({
                "type": "object",
                "required": ["session_id"],
                "properties": { "session_id": { "type": "string", "minLength": 1 } }
            }),
        ),
    ]
}

/// Validates `params` against `method`'s declared schema. Fails
/// `validation_failed` naming the offending field and an example payload,
/// per §4.1 step 4. Fails `not_found` for an unknown method name.
pub fn validate(method: &str, params: &Value) -> Result<(), OrchestratorError> {
    let validator = SCHEMAS
        .get(method)
        .ok_or_else(|| OrchestratorError::not_found("dispatcher.unknown_method", format!("no such tool `{method}`")))?;

    let errors: Vec<String> = validator
        .iter_errors(params)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("at `{path}`: {e}")
            }
        })
        .collect();

    if errors.is_empty() {
        return Ok(());
    }

    Err(OrchestratorError::new(
        ErrorCategory::Validation,
        "dispatcher.validation_failed",
        format!("`{method}` payload failed schema validation: {}", errors.join("; ")),
    )
    .with_context("errors", json!(errors))
    .with_hint(RecoveryHint::new(format!(
        "see the declared schema for `{method}` and resend a conforming payload"
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_required_field() {
        let err = validate("full_documentation", &json!({})).unwrap_err();
        assert_eq!(err.code, "dispatcher.validation_failed");
    }

    #[test]
    fn accepts_a_conforming_payload() {
        validate("full_documentation", &json!({"workspace_id": "ws-1"})).unwrap();
    }

    #[test]
    fn unknown_method_is_not_found() {
        let err = validate("no_such_tool", &json!({})).unwrap_err();
        assert_eq!(err.code, "dispatcher.unknown_method");
    }
}
