//! The Tool Dispatcher's external transport: an axum `Router` wiring
//! schema validation, auth, per-workspace rate limiting, request/response
//! token budget enforcement, and dispatch into the documentation workflow.

pub mod collaborators;
mod config;
mod dispatch;
mod fs_scan;
mod hooks;
mod rate_limit;
mod schema;

pub use collaborators::{
    ConsensusCollaborator, ConsensusOutcome, DocGenerationCollaborator, DocGenerationOutcome,
    LocalWorkspaceCollaborator, MemoryEvolutionCollaborator, MemoryEvolutionOutcome, StubConsensus,
    StubDocGeneration, StubMemoryEvolution, WorkspaceCollaborator,
};
pub use config::OrchestratorConfig;
pub use dispatch::Handlers;
pub use hooks::{DispatcherHooks, ExpirySweeper, Outbox};
pub use rate_limit::RateLimiter;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use docorch_errors::{
    check_request_budget, response_exceeds_budget, BudgetLimits, Cl100kLikeCounter, ErrorCategory,
    OrchestratorError, TokenCounter,
};
use docorch_observability::{emit_tool_invocation, ToolInvocationEvent};
use docorch_store::SessionStore;
use docorch_types::SessionId;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

const CORRELATION_HEADER: &str = "x-docorch-correlation-id";
const AUTH_HEADER: &str = "x-docorch-token";
/// Cheap pre-check before the body is ever handed to `serde_json`; §4.1
/// step 1. Generous enough that no legitimate payload trips it.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub handlers: Arc<Handlers>,
    pub store: Arc<SessionStore>,
    pub outbox: Arc<Outbox>,
    pub rate_limiter: Arc<RateLimiter>,
    pub counter: Arc<dyn TokenCounter>,
    pub budget_limits: BudgetLimits,
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(
        handlers: Arc<Handlers>,
        store: Arc<SessionStore>,
        outbox: Arc<Outbox>,
        rate_limiter: Arc<RateLimiter>,
        budget_limits: BudgetLimits,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            handlers,
            store,
            outbox,
            rate_limiter,
            counter: Arc::new(Cl100kLikeCounter::new()),
            budget_limits,
            auth_token,
        }
    }
}

/// Builds the router. Auth runs ahead of everything else except the health
/// check and CORS preflight, grounded on the teacher's `auth_gate` shape:
/// absent a configured token, every request passes through unauthenticated.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(health))
        .route("/tool/{method}", post(dispatch_tool))
        .route("/session/{id}/notifications", get(drain_notifications))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS || request.uri().path() == "/global/health" {
        return next.run(request).await;
    }
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(request).await;
    };
    match extract_request_token(request.headers()) {
        Some(token) if token == expected => next.run(request).await,
        _ => error_response(OrchestratorError::new(
            ErrorCategory::Auth,
            "dispatcher.auth_invalid",
            "missing or invalid bearer token",
        )),
    }
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn drain_notifications(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    let notifications = state.outbox.drain(&SessionId(id)).await;
    Json(json!({ "notifications": notifications }))
}

async fn dispatch_tool(
    State(state): State<AppState>,
    AxumPath(method): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let result = handle_tool_call(&state, &method, &body).await;
    respond(&state, &method, &correlation_id, start, result)
}

async fn handle_tool_call(
    state: &AppState,
    method: &str,
    body: &[u8],
) -> Result<(Value, Option<SessionId>), OrchestratorError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(OrchestratorError::validation(
            "dispatcher.body_too_large",
            format!("request body exceeds the {MAX_BODY_BYTES} byte cap"),
        ));
    }
    let params: Value = serde_json::from_slice(body)
        .map_err(|e| OrchestratorError::validation("dispatcher.bad_json", e.to_string()))?;

    schema::validate(method, &params)?;
    check_request_budget(state.counter.as_ref(), &params, &state.budget_limits)?;

    let workspace_key = resolve_rate_limit_key(state, &params).await;
    state.rate_limiter.acquire(&workspace_key).await?;

    let (value, session_id) = state.handlers.dispatch(method, &params).await?;

    if let Some(usage) = response_exceeds_budget(state.counter.as_ref(), &value, &state.budget_limits) {
        let envelope = docorch_errors::build_truncation_envelope(
            state.counter.as_ref(),
            value,
            usage,
            uuid::Uuid::new_v4().to_string(),
        );
        return Ok((serde_json::to_value(&envelope).expect("envelope serializes"), session_id));
    }

    Ok((value, session_id))
}

/// `full_documentation`/`create_documentation` carry `workspace_id`
/// directly; every other tool is already scoped to an existing session, so
/// its workspace is read off the session record. Tools with neither (e.g.
/// `get_project_structure`) share one `"global"` bucket.
async fn resolve_rate_limit_key(state: &AppState, params: &Value) -> String {
    if let Some(workspace_id) = params.get("workspace_id").and_then(Value::as_str) {
        return workspace_id.to_string();
    }
    if let Some(session_id) = params.get("session_id").and_then(Value::as_str) {
        if let Ok(session) = state.store.get(&SessionId(session_id.to_string())).await {
            return session.workspace_id;
        }
        return "unknown".to_string();
    }
    "global".to_string()
}

fn respond(
    state: &AppState,
    method: &str,
    correlation_id: &str,
    start: Instant,
    result: Result<(Value, Option<SessionId>), OrchestratorError>,
) -> Response {
    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok((value, session_id)) => {
            emit_tool_invocation(ToolInvocationEvent {
                method,
                correlation_id,
                session_id: session_id.as_ref().map(|s| s.as_ref()),
                request_id: None,
                duration_ms,
                outcome: "ok",
                error_code: None,
            });
            let mut response = Json(value).into_response();
            insert_correlation_header(&mut response, correlation_id);
            response
        }
        Err(err) => {
            emit_tool_invocation(ToolInvocationEvent {
                method,
                correlation_id,
                session_id: None,
                request_id: None,
                duration_ms,
                outcome: "error",
                error_code: Some(err.code),
            });
            let mut response = error_response(err);
            insert_correlation_header(&mut response, correlation_id);
            response
        }
    }
}

fn insert_correlation_header(response: &mut Response, correlation_id: &str) {
    if let Ok(value) = axum::http::HeaderValue::from_str(correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
}

fn error_response(err: OrchestratorError) -> Response {
    let status = match err.category {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Conflict => StatusCode::CONFLICT,
        ErrorCategory::InvalidState => StatusCode::CONFLICT,
        ErrorCategory::Auth => StatusCode::UNAUTHORIZED,
        ErrorCategory::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::BudgetExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCategory::External => StatusCode::BAD_GATEWAY,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let category = json!(err.category).as_str().unwrap_or("unknown").to_string();
    let severity = json!(err.severity).as_str().unwrap_or("unknown").to_string();
    let first_hint = err.hints.first().map(|h| h.message.clone());
    let envelope = docorch_wire::ErrorEnvelope {
        code: err.code.to_string(),
        message: err.message.clone(),
        details: docorch_wire::ErrorDetails {
            category,
            severity,
            context: err.context.into_iter().collect(),
            timestamp: err.timestamp,
            hints: err.hints.into_iter().map(|h| h.message).collect(),
        },
        hint: first_hint,
        request_id: None,
        method: None,
        tool: None,
    };
    (status, Json(envelope)).into_response()
}
