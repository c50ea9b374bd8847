use std::num::NonZeroUsize;
use std::time::Duration;

use docorch_errors::BackoffPolicy;

/// Every recognized environment option from spec §6, with documented
/// defaults. Invalid values (non-numeric, zero where a positive count is
/// required) fail start-up with a descriptive error rather than silently
/// falling back.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub session_ttl: chrono::Duration,
    pub session_sweep_interval: Duration,
    pub session_cache_capacity: NonZeroUsize,
    pub max_update_retries: u32,
    pub max_concurrent_sessions: usize,
    pub workflow_retry_max: u32,
    pub workflow_backoff: BackoffPolicy,
    pub callback_default_deadline: Duration,
    pub callback_reap_interval: Duration,
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    pub request_budget_tokens: u64,
    pub response_budget_tokens: u64,
    pub worker_concurrency: usize,
    /// Minimum score `consensus_review` must reach to settle a session
    /// `completed`. Left as configuration rather than a constant since
    /// different deployments run different review backends behind
    /// `ConsensusCollaborator`.
    pub consensus_threshold: f64,
    /// Bound on `consensus_fail -> generating_docs -> consensus_review`
    /// cycles before a session is failed with `consensus_exhausted`.
    pub consensus_max_attempts: u32,
    pub auth_token: Option<String>,
    pub logs_dir: std::path::PathBuf,
    pub log_retention_days: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 4420,
            session_ttl: chrono::Duration::hours(24),
            session_sweep_interval: Duration::from_secs(60),
            session_cache_capacity: NonZeroUsize::new(1024).expect("nonzero"),
            max_update_retries: 5,
            max_concurrent_sessions: 256,
            workflow_retry_max: 3,
            workflow_backoff: BackoffPolicy::default(),
            callback_default_deadline: Duration::from_secs(300),
            callback_reap_interval: Duration::from_secs(15),
            rate_limit_rpm: 600,
            rate_limit_burst: 60,
            request_budget_tokens: 25_000,
            response_budget_tokens: 25_000,
            worker_concurrency: 4,
            consensus_threshold: 0.75,
            consensus_max_attempts: 3,
            auth_token: None,
            logs_dir: std::path::PathBuf::from(".docorch/logs"),
            log_retention_days: 14,
        }
    }
}

impl OrchestratorConfig {
    /// Reads every recognized `DOCORCH_*` variable, falling back to the
    /// documented default when unset. Returns a descriptive error the first
    /// time a set variable fails to parse, rather than starting with a
    /// silently-wrong value.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(v) = env_var("DOCORCH_BIND_HOST") {
            config.bind_host = v;
        }
        config.bind_port = env_parse("DOCORCH_BIND_PORT", config.bind_port)?;
        config.session_ttl = chrono::Duration::seconds(env_parse(
            "DOCORCH_SESSION_TTL_SECS",
            config.session_ttl.num_seconds(),
        )?);
        config.session_sweep_interval = Duration::from_secs(env_parse(
            "DOCORCH_SESSION_SWEEP_INTERVAL_SECS",
            config.session_sweep_interval.as_secs(),
        )?);
        let cache_capacity: usize = env_parse(
            "DOCORCH_SESSION_CACHE_CAPACITY",
            config.session_cache_capacity.get(),
        )?;
        config.session_cache_capacity = NonZeroUsize::new(cache_capacity)
            .ok_or_else(|| "DOCORCH_SESSION_CACHE_CAPACITY must be nonzero".to_string())?;
        config.max_update_retries = env_parse("DOCORCH_MAX_UPDATE_RETRIES", config.max_update_retries)?;
        config.max_concurrent_sessions =
            env_parse("DOCORCH_MAX_CONCURRENT_SESSIONS", config.max_concurrent_sessions)?;
        config.workflow_retry_max = env_parse("DOCORCH_WORKFLOW_RETRY_MAX", config.workflow_retry_max)?;
        config.workflow_backoff.base_ms =
            env_parse("DOCORCH_WORKFLOW_BACKOFF_BASE_MS", config.workflow_backoff.base_ms)?;
        config.workflow_backoff.cap_ms =
            env_parse("DOCORCH_WORKFLOW_BACKOFF_CAP_MS", config.workflow_backoff.cap_ms)?;
        config.callback_default_deadline = Duration::from_secs(env_parse(
            "DOCORCH_CALLBACK_DEADLINE_SECS",
            config.callback_default_deadline.as_secs(),
        )?);
        config.rate_limit_rpm = env_parse("DOCORCH_RATE_LIMIT_RPM", config.rate_limit_rpm)?;
        config.rate_limit_burst = env_parse("DOCORCH_RATE_LIMIT_BURST", config.rate_limit_burst)?;
        config.request_budget_tokens =
            env_parse("DOCORCH_REQUEST_BUDGET_TOKENS", config.request_budget_tokens)?;
        config.response_budget_tokens =
            env_parse("DOCORCH_RESPONSE_BUDGET_TOKENS", config.response_budget_tokens)?;
        config.worker_concurrency = env_parse("DOCORCH_WORKER_CONCURRENCY", config.worker_concurrency)?;
        if config.worker_concurrency == 0 {
            return Err("DOCORCH_WORKER_CONCURRENCY must be nonzero".to_string());
        }
        config.consensus_threshold = env_parse("DOCORCH_CONSENSUS_THRESHOLD", config.consensus_threshold)?;
        config.consensus_max_attempts =
            env_parse("DOCORCH_CONSENSUS_MAX_ATTEMPTS", config.consensus_max_attempts)?;
        config.auth_token = env_var("DOCORCH_AUTH_TOKEN");
        if let Some(dir) = env_var("DOCORCH_LOGS_DIR") {
            config.logs_dir = std::path::PathBuf::from(dir);
        }
        config.log_retention_days = env_parse("DOCORCH_LOG_RETENTION_DAYS", config.log_retention_days)?;

        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("{name}=`{raw}` is not a valid value")),
    }
}
