use std::path::Path;

use docorch_errors::OrchestratorError;
use docorch_wire::{GetProjectStructureInput, GetProjectStructureResult, VerifyDocumentationInput};
use ignore::WalkBuilder;

const PAGE_SIZE: usize = 500;

/// Walks `workspace_path` honoring `.gitignore`/`.ignore` files (the `ignore`
/// crate, same as a working `rg`/`fd`), filtered by the caller's globs and
/// depth, then paginates the sorted result by byte offset into that list so a
/// `continuation_token` round-trips deterministically across calls.
pub fn scan(input: &GetProjectStructureInput) -> Result<GetProjectStructureResult, OrchestratorError> {
    let root = Path::new(&input.workspace_path);
    if !root.exists() {
        return Err(OrchestratorError::not_found(
            "dispatcher.workspace_not_found",
            format!("workspace path `{}` does not exist", input.workspace_path),
        ));
    }

    let mut builder = WalkBuilder::new(root);
    builder.hidden(false).git_ignore(true).git_exclude(true);
    if let Some(max_depth) = input.max_depth {
        builder.max_depth(Some(max_depth as usize));
    }

    let include = build_globset(&input.include_globs)?;
    let exclude = build_globset(&input.exclude_globs)?;

    let mut paths = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if relative_str.is_empty() {
            continue;
        }
        if let Some(include) = &include {
            if !include.is_match(&relative_str) {
                continue;
            }
        }
        if let Some(exclude) = &exclude {
            if exclude.is_match(&relative_str) {
                continue;
            }
        }
        paths.push(relative_str);
    }
    paths.sort();

    let offset: usize = match &input.continuation_token {
        None => 0,
        Some(token) => token
            .parse()
            .map_err(|_| OrchestratorError::validation("dispatcher.bad_continuation_token", "continuation_token is not a valid offset"))?,
    };
    if offset > paths.len() {
        return Err(OrchestratorError::validation(
            "dispatcher.bad_continuation_token",
            "continuation_token is past the end of the result set",
        ));
    }

    let end = (offset + PAGE_SIZE).min(paths.len());
    let page = paths[offset..end].to_vec();
    let truncated = end < paths.len();
    let continuation_token = if truncated { Some(end.to_string()) } else { None };

    Ok(GetProjectStructureResult {
        workspace_id: input.workspace_path.clone(),
        paths: page,
        truncated,
        continuation_token,
    })
}

fn build_globset(globs: &[String]) -> Result<Option<globset::GlobSet>, OrchestratorError> {
    if globs.is_empty() {
        return Ok(None);
    }
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in globs {
        let glob = globset::Glob::new(pattern)
            .map_err(|e| OrchestratorError::validation("dispatcher.bad_glob", format!("invalid glob `{pattern}`: {e}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| OrchestratorError::validation("dispatcher.bad_glob", e.to_string()))?;
    Ok(Some(set))
}

/// A heuristic cross-check, not a semantic one: a code path "counts" as
/// covered if the documentation text mentions its file stem anywhere. Good
/// enough to flag a code path nobody wrote a word about; anything deeper
/// belongs to the agent that actually reads both sides.
pub async fn verify(input: &VerifyDocumentationInput) -> Result<Vec<String>, OrchestratorError> {
    let doc_text = tokio::fs::read_to_string(&input.doc_path)
        .await
        .map_err(|e| OrchestratorError::not_found("dispatcher.doc_not_found", format!("could not read `{}`: {e}", input.doc_path)))?;

    let mut unreferenced = Vec::new();
    for code_path in &input.code_paths {
        let stem = Path::new(code_path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| code_path.clone());
        if !doc_text.contains(&stem) && !doc_text.contains(code_path.as_str()) {
            unreferenced.push(code_path.clone());
        }
    }
    Ok(unreferenced)
}
