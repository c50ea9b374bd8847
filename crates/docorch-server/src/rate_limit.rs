use std::collections::HashMap;
use std::time::Instant;

use docorch_errors::OrchestratorError;
use tokio::sync::Mutex;

/// A leaky-bucket limiter, one bucket per workspace, per §4.1 step 3.
/// Tokens refill continuously at `rpm / 60` per second up to `burst`.
pub struct RateLimiter {
    rpm: u32,
    burst: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rpm: u32, burst: u32) -> Self {
        Self {
            rpm: rpm.max(1),
            burst: burst.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes one token for `workspace_id`. Fails `rate_limited` with a
    /// millisecond retry hint when the bucket is empty.
    pub async fn acquire(&self, workspace_id: &str) -> Result<(), OrchestratorError> {
        let refill_per_sec = self.rpm as f64 / 60.0;
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(workspace_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(self.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - bucket.tokens;
        let retry_after_ms = ((deficit / refill_per_sec) * 1000.0).ceil() as u64;
        Err(OrchestratorError::rate_limited(
            "dispatcher.rate_limited",
            format!("workspace `{workspace_id}` exceeded {} requests/min", self.rpm),
            retry_after_ms.max(1),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_consumed_then_rejected() {
        let limiter = RateLimiter::new(60, 2);
        limiter.acquire("ws").await.unwrap();
        limiter.acquire("ws").await.unwrap();
        let err = limiter.acquire("ws").await.unwrap_err();
        assert_eq!(err.code, "dispatcher.rate_limited");
    }

    #[tokio::test]
    async fn separate_workspaces_do_not_share_a_bucket() {
        let limiter = RateLimiter::new(60, 1);
        limiter.acquire("a").await.unwrap();
        limiter.acquire("b").await.unwrap();
    }
}
