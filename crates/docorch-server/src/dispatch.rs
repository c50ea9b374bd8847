use std::sync::Arc;

use docorch_callbacks::CallbackRegistry;
use docorch_errors::OrchestratorError;
use docorch_scheduler::TodoScheduler;
use docorch_store::SessionStore;
use docorch_types::{Progress, Session, SessionId, SessionKind, ThematicGroup};
use docorch_wire::{
    AckResult, AnalyzeFileCallbackInput, CreateDocumentationInput, CreateDocumentationResult,
    FullDocumentationInput, FullDocumentationResult, GetDocumentationStatusInput,
    GetDocumentationStatusResult, GetProjectStructureInput, GetProjectStructureResult,
    ProvideDependencyFilesInput, ProvideThematicGroupingsInput, ProvideThematicGroupingsResult,
    VerifyDocumentationInput, VerifyDocumentationResult,
};
use docorch_workflow::{WorkflowEngine, WorkflowEvent};
use serde::Serialize;
use serde_json::Value;

use crate::collaborators::WorkspaceCollaborator;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Everything a tool handler needs, already instantiated; no handler reaches
/// for ambient global state.
pub struct Handlers {
    pub store: Arc<SessionStore>,
    pub workflow: Arc<WorkflowEngine>,
    pub scheduler: Arc<TodoScheduler>,
    pub callbacks: Arc<CallbackRegistry>,
    pub workspace: Arc<dyn WorkspaceCollaborator>,
}

fn param<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, OrchestratorError> {
    serde_json::from_value(params.clone())
        .map_err(|e| OrchestratorError::validation("dispatcher.bad_params", e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("handler result always serializes")
}

impl Handlers {
    pub async fn dispatch(&self, method: &str, params: &Value) -> Result<(Value, Option<SessionId>), OrchestratorError> {
        match method {
            "full_documentation" => {
                let input: FullDocumentationInput = param(params)?;
                let result = self.full_documentation(input).await?;
                let session_id = SessionId(result.session_id.clone());
                Ok((to_json(&result), Some(session_id)))
            }
            "provide_thematic_groupings" => {
                let input: ProvideThematicGroupingsInput = param(params)?;
                let session_id = SessionId(input.session_id.clone());
                let result = self.provide_thematic_groupings(input).await?;
                Ok((to_json(&result), Some(session_id)))
            }
            "provide_dependency_files" => {
                let input: ProvideDependencyFilesInput = param(params)?;
                let session_id = SessionId(input.session_id.clone());
                let result = self.provide_dependency_files(input).await?;
                Ok((to_json(&result), Some(session_id)))
            }
            "create_documentation" => {
                let input: CreateDocumentationInput = param(params)?;
                let result = self.create_documentation(input).await?;
                let session_id = SessionId(result.session_id.clone());
                Ok((to_json(&result), Some(session_id)))
            }
            "analyze_file_callback" => {
                let input: AnalyzeFileCallbackInput = param(params)?;
                let session_id = SessionId(input.session_id.clone());
                let result = self.analyze_file_callback(input).await?;
                Ok((to_json(&result), Some(session_id)))
            }
            "get_project_structure" => {
                let input: GetProjectStructureInput = param(params)?;
                let result = self.get_project_structure(input).await?;
                Ok((to_json(&result), None))
            }
            "verify_documentation" => {
                let input: VerifyDocumentationInput = param(params)?;
                let result = self.verify_documentation(input).await?;
                Ok((to_json(&result), None))
            }
            "get_documentation_status" => {
                let input: GetDocumentationStatusInput = param(params)?;
                let session_id = SessionId(input.session_id.clone());
                let result = self.get_documentation_status(input).await?;
                Ok((to_json(&result), Some(session_id)))
            }
            other => Err(OrchestratorError::not_found(
                "dispatcher.unknown_method",
                format!("no such tool `{other}`"),
            )),
        }
    }

    async fn full_documentation(&self, input: FullDocumentationInput) -> Result<FullDocumentationResult, OrchestratorError> {
        let session = self.store.create(SessionKind::Full, input.workspace_id, None, Vec::new()).await?;
        self.workflow
            .apply_event(&session.id, WorkflowEvent::Start { kind: SessionKind::Full })
            .await?;
        self.store
            .update_with_retry(&session.id, |s| s.state = docorch_types::WorkflowState::AwaitingGroupings)
            .await?;
        Ok(FullDocumentationResult {
            session_id: session.id.to_string(),
            status: "awaiting_groupings".to_string(),
            next_action_hint: "call provide_thematic_groupings with a theme->paths map".to_string(),
        })
    }

    async fn provide_thematic_groupings(
        &self,
        input: ProvideThematicGroupingsInput,
    ) -> Result<ProvideThematicGroupingsResult, OrchestratorError> {
        let session_id = SessionId(input.session_id.clone());
        let session = self.store.get(&session_id).await?;
        if session.kind != SessionKind::Full {
            return Err(OrchestratorError::invalid_state(
                "dispatcher.wrong_session_kind",
                "provide_thematic_groupings only applies to `full` sessions",
            ));
        }

        let themes: Vec<(String, i64)> = input.groupings.iter().map(|g| (g.theme.clone(), g.priority)).collect();
        self.scheduler.create_session(&session_id, themes).await?;

        let mut total_files = 0u64;
        let mut thematic_groups = Vec::with_capacity(input.groupings.len());
        let mut file_paths = Vec::new();
        for grouping in &input.groupings {
            for path in &grouping.file_paths {
                self.scheduler
                    .enqueue(&session_id, &grouping.theme, path.clone(), DEFAULT_MAX_ATTEMPTS)
                    .await?;
                file_paths.push(path.clone());
            }
            total_files += grouping.file_paths.len() as u64;
            thematic_groups.push(ThematicGroup {
                theme: grouping.theme.clone(),
                file_paths: grouping.file_paths.clone(),
                description: grouping.description.clone(),
                priority: grouping.priority,
                todo_list_id: String::new(),
            });
        }

        let theme_count = thematic_groups.len() as u64;
        self.store
            .update_with_retry(&session_id, |s| {
                s.thematic_groups = thematic_groups.clone();
                s.file_paths = file_paths.clone();
                s.progress = Progress { total_files, ..Progress::default() };
            })
            .await?;

        self.workflow
            .apply_event(&session_id, WorkflowEvent::GroupingsReceived { group_count: theme_count })
            .await?;
        self.store
            .update_with_retry(&session_id, |s| s.state = docorch_types::WorkflowState::Processing)
            .await?;
        self.workflow.apply_event(&session_id, WorkflowEvent::Process).await?;
        self.store
            .update_with_retry(&session_id, |s| s.state = docorch_types::WorkflowState::Analyzing)
            .await?;

        Ok(ProvideThematicGroupingsResult {
            session_id: session_id.to_string(),
            status: "processing".to_string(),
            theme_count,
            total_files,
        })
    }

    async fn provide_dependency_files(&self, input: ProvideDependencyFilesInput) -> Result<AckResult, OrchestratorError> {
        let session_id = SessionId(input.session_id.clone());
        let deps = input.deps.into_iter().map(|d| (d.file_path, d.dependency_kind)).collect();
        let inserted = self.scheduler.add_dependencies(&session_id, &input.requesting_path, deps).await?;
        if inserted > 0 {
            self.store
                .update_with_retry(&session_id, |s| s.progress.total_files += inserted)
                .await?;
        }
        Ok(AckResult { acknowledged: true, detail: None })
    }

    async fn create_documentation(&self, input: CreateDocumentationInput) -> Result<CreateDocumentationResult, OrchestratorError> {
        let session = self
            .store
            .create(SessionKind::Module, input.workspace_id, Some(input.module_name), input.paths.clone())
            .await?;

        self.scheduler.create_session(&session.id, vec![("module".to_string(), 0)]).await?;
        for path in &input.paths {
            self.scheduler
                .enqueue(&session.id, "module", path.clone(), DEFAULT_MAX_ATTEMPTS)
                .await?;
        }

        self.workflow
            .apply_event(&session.id, WorkflowEvent::Start { kind: SessionKind::Module })
            .await?;
        self.store
            .update_with_retry(&session.id, |s| s.state = docorch_types::WorkflowState::Processing)
            .await?;
        self.workflow.apply_event(&session.id, WorkflowEvent::Process).await?;
        self.store
            .update_with_retry(&session.id, |s| s.state = docorch_types::WorkflowState::Analyzing)
            .await?;

        Ok(CreateDocumentationResult {
            session_id: session.id.to_string(),
            status: "processing".to_string(),
        })
    }

    async fn analyze_file_callback(&self, input: AnalyzeFileCallbackInput) -> Result<AckResult, OrchestratorError> {
        let session_id = SessionId(input.session_id.clone());
        // `resolve` wakes whichever worker is parked in `wait()` for this
        // request; that worker (see hooks.rs) is the one that actually
        // records the item outcome and advances the workflow, so this
        // handler's only job is the hand-off itself.
        self.callbacks.resolve(&input.request_id, input.analysis).await?;
        Ok(AckResult { acknowledged: true, detail: None })
    }

    async fn get_project_structure(&self, input: GetProjectStructureInput) -> Result<GetProjectStructureResult, OrchestratorError> {
        self.workspace.scan(&input)
    }

    async fn verify_documentation(&self, input: VerifyDocumentationInput) -> Result<VerifyDocumentationResult, OrchestratorError> {
        let findings = self.workspace.verify(&input).await?;
        let finding_count = findings.len() as u64;
        let summary = if findings.is_empty() {
            "every code path is referenced by the artifact".to_string()
        } else {
            format!("{} path(s) have no mention in the artifact: {}", findings.len(), findings.join(", "))
        };
        Ok(VerifyDocumentationResult {
            report_id: uuid::Uuid::new_v4().to_string(),
            findings_summary: summary,
            finding_count,
        })
    }

    async fn get_documentation_status(&self, input: GetDocumentationStatusInput) -> Result<GetDocumentationStatusResult, OrchestratorError> {
        let session_id = SessionId(input.session_id);
        let session: Session = self.store.get(&session_id).await?;
        Ok(GetDocumentationStatusResult {
            session_id: session_id.to_string(),
            state: session.state.to_string(),
            progress: session.progress,
            artifact_path: session.artifact_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalWorkspaceCollaborator;
    use docorch_errors::BackoffPolicy;
    use docorch_store::{FileEventLogRepository, FileSessionRepository, SessionStoreConfig};
    use docorch_wire::DependencyFileInput;
    use docorch_workflow::WorkflowEngine;
    use std::num::NonZeroUsize;

    async fn handlers() -> Arc<Handlers> {
        let store = Arc::new(SessionStore::new(
            Arc::new(FileSessionRepository::in_memory()),
            Arc::new(FileEventLogRepository::in_memory()),
            SessionStoreConfig { cache_capacity: NonZeroUsize::new(8).unwrap(), ..SessionStoreConfig::default() },
        ));
        Arc::new(Handlers {
            store,
            workflow: Arc::new(WorkflowEngine::new()),
            scheduler: Arc::new(TodoScheduler::new(BackoffPolicy::default())),
            callbacks: Arc::new(CallbackRegistry::new()),
            workspace: Arc::new(LocalWorkspaceCollaborator),
        })
    }

    /// A module session with a single file whose callback discovers a new
    /// dependency must grow `progress.total_files` by exactly the number of
    /// genuinely new items, or `processed + failed + skipped <= total_files`
    /// trips the moment that dependency is also completed.
    #[tokio::test]
    async fn provide_dependency_files_bumps_total_files_for_new_items() {
        let handlers = handlers().await;
        let session = handlers
            .store
            .create(SessionKind::Module, "ws", Some("mod".to_string()), vec!["src/lib.rs".to_string()])
            .await
            .unwrap();
        handlers
            .store
            .update_with_retry(&session.id, |s| s.progress.total_files = 1)
            .await
            .unwrap();
        handlers.scheduler.create_session(&session.id, vec![("module".to_string(), 0)]).await.unwrap();
        handlers
            .scheduler
            .enqueue(&session.id, "module", "src/lib.rs".to_string(), DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();

        handlers
            .provide_dependency_files(ProvideDependencyFilesInput {
                session_id: session.id.to_string(),
                requesting_path: "src/lib.rs".to_string(),
                deps: vec![DependencyFileInput {
                    file_path: "src/util.rs".to_string(),
                    dependency_kind: docorch_types::DependencyKind::Import,
                }],
            })
            .await
            .unwrap();

        let updated = handlers.store.get(&session.id).await.unwrap();
        assert_eq!(updated.progress.total_files, 2);
    }

    #[tokio::test]
    async fn provide_dependency_files_leaves_total_files_unchanged_for_an_already_known_file() {
        let handlers = handlers().await;
        let session = handlers
            .store
            .create(
                SessionKind::Module,
                "ws",
                Some("mod".to_string()),
                vec!["src/lib.rs".to_string(), "src/util.rs".to_string()],
            )
            .await
            .unwrap();
        handlers
            .store
            .update_with_retry(&session.id, |s| s.progress.total_files = 2)
            .await
            .unwrap();
        handlers.scheduler.create_session(&session.id, vec![("module".to_string(), 0)]).await.unwrap();
        handlers
            .scheduler
            .enqueue(&session.id, "module", "src/lib.rs".to_string(), DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();
        handlers
            .scheduler
            .enqueue(&session.id, "module", "src/util.rs".to_string(), DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();

        handlers
            .provide_dependency_files(ProvideDependencyFilesInput {
                session_id: session.id.to_string(),
                requesting_path: "src/lib.rs".to_string(),
                deps: vec![DependencyFileInput {
                    file_path: "src/util.rs".to_string(),
                    dependency_kind: docorch_types::DependencyKind::Import,
                }],
            })
            .await
            .unwrap();

        let updated = handlers.store.get(&session.id).await.unwrap();
        assert_eq!(updated.progress.total_files, 2);
    }
}
