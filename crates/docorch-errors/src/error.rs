use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The error taxonomy. Every failure path in the core maps to exactly one of these categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    InvalidState,
    Auth,
    RateLimited,
    BudgetExceeded,
    Timeout,
    External,
    Internal,
}

impl ErrorCategory {
    /// Default severity for a category absent an explicit override at the call site.
    pub fn default_severity(self) -> Severity {
        match self {
            ErrorCategory::Internal | ErrorCategory::External => Severity::High,
            ErrorCategory::Conflict | ErrorCategory::Timeout => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

pub type ErrorContext = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryHint {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RecoveryHint {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

/// The structured error every fallible operation in the core returns. Never
/// carries free text where a field exists for the data, and never places
/// credentials or file bodies in `context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorError {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
    #[serde(default)]
    pub hints: Vec<RecoveryHint>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl OrchestratorError {
    pub fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            context: ErrorContext::new(),
            hints: Vec::new(),
            severity: category.default_severity(),
            timestamp: Utc::now(),
            cause: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_hint(mut self, hint: RecoveryHint) -> Self {
        self.hints.push(hint);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, code, message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, code, message)
            .with_hint(RecoveryHint::new("reload the resource and retry"))
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn invalid_state(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidState, code, message)
    }

    pub fn rate_limited(code: &'static str, message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::new(ErrorCategory::RateLimited, code, message)
            .with_hint(RecoveryHint::new("retry after the hinted delay").with_retry_after(retry_after_ms))
    }

    pub fn budget_exceeded(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::BudgetExceeded, code, message)
    }

    pub fn timeout(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message).with_severity(Severity::Critical)
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}:{}] {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for OrchestratorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_carries_a_retry_hint() {
        let err = OrchestratorError::conflict("session.conflict", "version mismatch");
        assert_eq!(err.category, ErrorCategory::Conflict);
        assert!(!err.hints.is_empty());
    }

    #[test]
    fn internal_errors_are_critical_by_default() {
        let err = OrchestratorError::internal("store.corrupt", "unreadable row");
        assert_eq!(err.severity, Severity::Critical);
    }
}
