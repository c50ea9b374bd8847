mod backoff;
mod budget;
mod error;

pub use backoff::BackoffPolicy;
pub use budget::{
    build_truncation_envelope, check_request_budget, response_exceeds_budget, BudgetLimits,
    BudgetUsage, Cl100kLikeCounter, TokenCounter, TruncationEnvelope,
};
pub use error::{ErrorCategory, ErrorContext, OrchestratorError, RecoveryHint, Severity};
