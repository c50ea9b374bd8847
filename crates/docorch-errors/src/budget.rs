use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCategory, OrchestratorError, RecoveryHint};

/// Counts tokens for a piece of text. Implementations must be deterministic
/// and applied the same way on the request and response path; any
/// deterministic approximation of the wire model's real tokenizer is fine.
pub trait TokenCounter: Send + Sync {
    fn count_str(&self, text: &str) -> u64;

    fn count_value(&self, value: &Value) -> u64 {
        self.count_str(&value.to_string())
    }
}

/// A cl100k-like counter backed by `tiktoken-rs`'s bundled cl100k_base encoder.
pub struct Cl100kLikeCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl Cl100kLikeCounter {
    pub fn new() -> Self {
        Self {
            bpe: tiktoken_rs::cl100k_base().expect("bundled cl100k_base encoder"),
        }
    }
}

impl Default for Cl100kLikeCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for Cl100kLikeCounter {
    fn count_str(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub request_tokens: u64,
    pub response_tokens: u64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            request_tokens: 25_000,
            response_tokens: 25_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub tokens: u64,
    pub limit: u64,
}

impl BudgetUsage {
    pub fn exceeded(&self) -> bool {
        self.tokens > self.limit
    }
}

/// Envelope substituted for a response whose serialization exceeds budget.
/// Carries a continuation token so the remainder can be fetched rather than
/// silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationEnvelope {
    pub truncated: bool,
    pub continuation_token: String,
    pub overflow_tokens: u64,
    pub included: Value,
}

/// Checks a request payload against `limits.request_tokens`, returning a
/// structured `budget_exceeded` error (never panicking, never truncating a
/// request: the caller must shrink and resend).
pub fn check_request_budget(
    counter: &dyn TokenCounter,
    payload: &Value,
    limits: &BudgetLimits,
) -> Result<BudgetUsage, OrchestratorError> {
    let tokens = counter.count_value(payload);
    if tokens > limits.request_tokens {
        return Err(OrchestratorError::new(
            ErrorCategory::BudgetExceeded,
            "budget.request_exceeded",
            format!(
                "request is {tokens} tokens, exceeding the {} token exchange budget",
                limits.request_tokens
            ),
        )
        .with_context("tokens", tokens)
        .with_context("limit", limits.request_tokens)
        .with_hint(RecoveryHint::new("shrink the request payload and resend")));
    }
    Ok(BudgetUsage {
        tokens,
        limit: limits.request_tokens,
    })
}

/// Checks a response payload against `limits.response_tokens`. Unlike the
/// request path, an over-budget response is never silently dropped: the
/// caller wraps it in a `TruncationEnvelope` instead of returning this error.
pub fn response_exceeds_budget(
    counter: &dyn TokenCounter,
    payload: &Value,
    limits: &BudgetLimits,
) -> Option<BudgetUsage> {
    let tokens = counter.count_value(payload);
    if tokens > limits.response_tokens {
        Some(BudgetUsage {
            tokens,
            limit: limits.response_tokens,
        })
    } else {
        None
    }
}

/// Builds a truncation envelope that is itself guaranteed to fit in budget.
/// Every tool response shapes its payload differently — `items`, `paths`,
/// whatever the wire type names its list field — so rather than assume
/// `items`, this shrinks whichever top-level field of `payload` actually
/// holds an array, popping from its tail until the *whole serialized
/// envelope* (not just `included` in isolation) is within `usage.limit`.
/// A payload with no array-shaped field at all has nothing left to shrink,
/// so its body is dropped entirely rather than returned still over budget.
pub fn build_truncation_envelope(
    counter: &dyn TokenCounter,
    payload: Value,
    usage: BudgetUsage,
    continuation_token: impl Into<String>,
) -> TruncationEnvelope {
    let overflow = usage.tokens.saturating_sub(usage.limit);
    let continuation_token = continuation_token.into();

    let array_field = payload
        .as_object()
        .and_then(|obj| obj.iter().find(|(_, v)| v.is_array()).map(|(k, _)| k.clone()));

    let mut included = payload;
    match array_field {
        Some(field) => {
            let mut kept = included.get(&field).and_then(Value::as_array).cloned().unwrap_or_default();
            loop {
                if let Some(obj) = included.as_object_mut() {
                    obj.insert(field.clone(), Value::Array(kept.clone()));
                }
                if kept.is_empty() || envelope_fits(counter, &included, &continuation_token, overflow, usage.limit) {
                    break;
                }
                kept.pop();
            }
        }
        None => {
            if !envelope_fits(counter, &included, &continuation_token, overflow, usage.limit) {
                included = Value::Null;
            }
        }
    }

    TruncationEnvelope {
        truncated: true,
        continuation_token,
        overflow_tokens: overflow,
        included,
    }
}

fn envelope_fits(
    counter: &dyn TokenCounter,
    included: &Value,
    continuation_token: &str,
    overflow: u64,
    limit: u64,
) -> bool {
    let envelope = serde_json::json!({
        "truncated": true,
        "continuation_token": continuation_token,
        "overflow_tokens": overflow,
        "included": included,
    });
    counter.count_value(&envelope) <= limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_one_token_over_budget_fails() {
        let counter = Cl100kLikeCounter::new();
        let limits = BudgetLimits {
            request_tokens: 1,
            response_tokens: 1,
        };
        let payload = serde_json::json!({"a": "this is definitely more than one token"});
        let err = check_request_budget(&counter, &payload, &limits).unwrap_err();
        assert_eq!(err.category, ErrorCategory::BudgetExceeded);
    }

    #[test]
    fn small_request_passes() {
        let counter = Cl100kLikeCounter::new();
        let limits = BudgetLimits::default();
        let payload = serde_json::json!({"hello": "world"});
        assert!(check_request_budget(&counter, &payload, &limits).is_ok());
    }

    #[test]
    fn truncation_envelope_shrinks_until_within_budget() {
        let counter = Cl100kLikeCounter::new();
        let payload = serde_json::json!({ "items": ["a".repeat(50), "b".repeat(50), "c".repeat(50)] });
        let usage = BudgetUsage { tokens: 100, limit: 10 };
        let envelope = build_truncation_envelope(&counter, payload, usage, "tok-1");
        assert!(envelope.truncated);
        assert!(counter.count_value(&serde_json::to_value(&envelope).unwrap()) <= 10);
    }

    #[test]
    fn truncation_envelope_shrinks_a_non_items_array_field() {
        let counter = Cl100kLikeCounter::new();
        let payload = serde_json::json!({
            "workspace_id": "ws-1",
            "paths": ["a".repeat(50), "b".repeat(50), "c".repeat(50)],
            "truncated": false,
        });
        let tokens = counter.count_value(&payload);
        let usage = BudgetUsage { tokens, limit: 20 };
        let envelope = build_truncation_envelope(&counter, payload, usage, "tok-2");

        assert!(envelope.truncated);
        let paths = envelope.included.get("paths").and_then(Value::as_array).expect("paths retained");
        assert!(paths.len() < 3, "at least one path must have been dropped to fit");
        let serialized = counter.count_value(&serde_json::to_value(&envelope).unwrap());
        assert!(serialized <= 20, "the whole serialized envelope, not just `included`, must fit: got {serialized}");
    }

    #[test]
    fn truncation_envelope_drops_the_body_when_nothing_is_shrinkable() {
        let counter = Cl100kLikeCounter::new();
        let payload = serde_json::json!({ "ok": true, "message": "a".repeat(200) });
        let tokens = counter.count_value(&payload);
        let usage = BudgetUsage { tokens, limit: 5 };
        let envelope = build_truncation_envelope(&counter, payload, usage, "tok-3");

        assert!(envelope.truncated);
        assert!(envelope.included.is_null());
    }
}
