use super::{Search, SearchOutcome, SearchRequest};
use crate::error::BridgeError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Observability decorator around any `Search` implementation.
///
/// Emits latency metrics and debug traces; the inner result, including its
/// error taxonomy, passes through untouched.
pub struct LoggingSearch {
    provider: &'static str,
    inner: Arc<dyn Search>,
}

impl LoggingSearch {
    pub fn new(provider: &'static str, inner: Arc<dyn Search>) -> Self {
        Self { provider, inner }
    }

    async fn observe<F>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<SearchOutcome, BridgeError>
    where
        F: std::future::Future<Output = Result<SearchOutcome, BridgeError>>,
    {
        let start = Instant::now();
        let result = call.await;
        let elapsed = start.elapsed();

        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::counter!(
            "bridge_upstream_requests_total",
            "provider" => self.provider,
            "operation" => operation,
            "outcome" => outcome,
        )
        .increment(1);
        metrics::histogram!(
            "bridge_upstream_request_duration_seconds",
            "provider" => self.provider,
            "operation" => operation,
        )
        .record(elapsed.as_secs_f64());

        match &result {
            Ok(out) => debug!(
                "upstream: {} {} ok, key={:?}, elapsed_ms={}",
                self.provider,
                operation,
                out.key_id,
                elapsed.as_millis()
            ),
            Err(e) => debug!(
                "upstream: {} {} failed, elapsed_ms={}, error={}",
                self.provider,
                operation,
                elapsed.as_millis(),
                e
            ),
        }
        result
    }
}

#[async_trait]
impl Search for LoggingSearch {
    async fn web_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError> {
        self.observe("web_search", self.inner.web_search(req)).await
    }

    async fn local_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError> {
        self.observe("local_search", self.inner.local_search(req)).await
    }
}
