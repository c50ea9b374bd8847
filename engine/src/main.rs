use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use docorch_callbacks::{CallbackRegistry, ReaperTask};
use docorch_observability::{init_process_logging, ProcessKind};
use docorch_recovery::RecoverySupervisor;
use docorch_scheduler::TodoScheduler;
use docorch_server::{
    AppState, DispatcherHooks, ExpirySweeper, Handlers, LocalWorkspaceCollaborator,
    OrchestratorConfig, Outbox, RateLimiter, StubConsensus, StubDocGeneration, StubMemoryEvolution,
};
use docorch_store::{FileEventLogRepository, FileSessionRepository, SessionStore, SessionStoreConfig};
use docorch_types::WorkflowState;
use docorch_workflow::{TimeoutSupervisor, WorkflowEngine};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "docorch-engine")]
#[command(about = "Headless documentation orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the Tool Dispatcher's HTTP surface.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 4420)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

/// Every long-lived component a running engine holds, beyond what `AppState`
/// already carries, so recovery and the periodic sweepers operate on the
/// exact same scheduler/callback registry the dispatcher's hooks use.
struct Runtime {
    app_state: AppState,
    workflow: Arc<WorkflowEngine>,
    scheduler: Arc<TodoScheduler>,
    callbacks: Arc<CallbackRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let config = OrchestratorConfig::from_env().map_err(anyhow::Error::msg)?;
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = state_dir.join("logs");
            let (_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, config.log_retention_days)?;
            tracing::info!(?log_info, "structured logging initialized");

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let runtime = build_runtime(&state_dir, &config).await?;
            log_startup_paths(&state_dir, &addr);

            run_recovery(&runtime).await?;

            let cancel = CancellationToken::new();
            spawn_sweepers(&runtime, &config, cancel.clone());

            let router = docorch_server::router(runtime.app_state);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("docorch-engine listening on http://{addr}");

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal(cancel.clone()))
                .await?;
            cancel.cancel();
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("DOCORCH_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".docorch")
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting docorch-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}

/// Wires every component per the documented transition table and config
/// knobs, and registers the dispatcher's hooks before anything can reach
/// the workflow engine.
async fn build_runtime(state_dir: &Path, config: &OrchestratorConfig) -> anyhow::Result<Runtime> {
    let session_repo = Arc::new(FileSessionRepository::open(state_dir.join("sessions.json")).await?);
    let event_repo = Arc::new(FileEventLogRepository::open(state_dir.join("events.jsonl")).await?);
    let store = Arc::new(SessionStore::new(
        session_repo,
        event_repo,
        SessionStoreConfig {
            ttl: config.session_ttl,
            cache_capacity: config.session_cache_capacity,
            sweep_interval: config.session_sweep_interval,
            max_update_retries: config.max_update_retries,
        },
    ));

    let workflow = Arc::new(WorkflowEngine::new());
    workflow
        .set_state_timeout(WorkflowState::Processing, config.callback_default_deadline)
        .await;
    workflow
        .set_state_timeout(WorkflowState::Analyzing, config.callback_default_deadline)
        .await;

    let scheduler = Arc::new(TodoScheduler::new(config.workflow_backoff));
    let callbacks = Arc::new(CallbackRegistry::new());
    let outbox = Arc::new(Outbox::new());

    let hooks = Arc::new(DispatcherHooks::new(
        workflow.clone(),
        scheduler.clone(),
        callbacks.clone(),
        store.clone(),
        outbox.clone(),
        config.callback_default_deadline,
        config.worker_concurrency,
        Arc::new(StubMemoryEvolution),
        Arc::new(StubDocGeneration),
        Arc::new(StubConsensus),
        config.consensus_threshold,
        config.consensus_max_attempts,
    ));
    workflow.set_hooks(hooks).await;

    let handlers = Arc::new(Handlers {
        store: store.clone(),
        workflow: workflow.clone(),
        scheduler: scheduler.clone(),
        callbacks: callbacks.clone(),
        workspace: Arc::new(LocalWorkspaceCollaborator),
    });

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm, config.rate_limit_burst));
    let budget_limits = docorch_errors::BudgetLimits {
        request_tokens: config.request_budget_tokens,
        response_tokens: config.response_budget_tokens,
    };

    let app_state = AppState::new(handlers, store, outbox, rate_limiter, budget_limits, config.auth_token.clone());

    Ok(Runtime { app_state, workflow, scheduler, callbacks })
}

/// Replays every non-terminal session before the dispatcher accepts its
/// first request, so no in-flight work is silently lost across a restart.
async fn run_recovery(runtime: &Runtime) -> anyhow::Result<()> {
    let supervisor = RecoverySupervisor::new(
        runtime.app_state.store.clone(),
        runtime.workflow.clone(),
        runtime.scheduler.clone(),
        runtime.callbacks.clone(),
    );
    let report = supervisor.run().await?;
    info!(resumed = report.resumed_count(), failed = report.failed_count(), "recovery replay complete");
    Ok(())
}

fn spawn_sweepers(runtime: &Runtime, config: &OrchestratorConfig, cancel: CancellationToken) {
    let expiry = ExpirySweeper::new(
        runtime.app_state.store.clone(),
        runtime.workflow.clone(),
        runtime.callbacks.clone(),
        config.session_sweep_interval,
    );
    tokio::spawn(expiry.run(cancel.clone()));

    let timeouts = TimeoutSupervisor::new(runtime.workflow.clone(), config.session_sweep_interval);
    tokio::spawn(timeouts.run(cancel.clone()));

    let reaper = ReaperTask::new(runtime.callbacks.clone(), config.callback_reap_interval);
    tokio::spawn(reaper.run(cancel));
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining");
    cancel.cancel();
}
