use std::time::Instant;

/// Per-request identity and timing, created at ingress after authentication
/// and threaded explicitly through everything that logs or records usage.
///
/// Operations running outside a request (background cleanup, GC) simply have
/// no context and must not assume one.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_token_id: String,
    pub client_token_prefix: String,
    /// Held for the request's lifetime only; never logged or persisted.
    pub raw_client_token: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(
        client_token_id: impl Into<String>,
        client_token_prefix: impl Into<String>,
        raw_client_token: impl Into<String>,
    ) -> Self {
        Self {
            client_token_id: client_token_id.into(),
            client_token_prefix: client_token_prefix.into(),
            raw_client_token: raw_client_token.into(),
            start: Instant::now(),
        }
    }

    /// Elapsed wall time, floored to whole milliseconds.
    pub fn latency_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
