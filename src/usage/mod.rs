pub mod redact;

use crate::config::{UsageLogConfig, UsageLogMode};
use crate::crypto;
use crate::mcp::RequestContext;
use crate::store::{unix_ms, Store, UsageOutcome, UsageRecord};
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

const DAY_MS: u64 = 86_400_000;

/// One tool invocation's reportable facts.
pub struct ToolCallLog<'a> {
    pub tool_name: &'a str,
    pub outcome: UsageOutcome,
    pub upstream_key_id: Option<String>,
    pub query: Option<&'a str>,
    pub args: &'a serde_json::Value,
    pub error_message: Option<String>,
}

/// Sampled, redacted usage telemetry.
///
/// Rows are written fire-and-forget on a detached task; nothing on the
/// response path waits for, or fails on, the write.
pub struct UsageLogger {
    store: Arc<dyn Store>,
    cfg: UsageLogConfig,
}

impl UsageLogger {
    pub fn new(store: Arc<dyn Store>, cfg: UsageLogConfig) -> Self {
        Self { store, cfg }
    }

    /// Record one tool call. Returns immediately; the insert (and the
    /// occasional retention sweep) happen on a spawned task.
    pub fn log_tool_call(&self, ctx: &RequestContext, call: ToolCallLog<'_>) {
        if !sample(self.cfg.sample_rate) {
            return;
        }

        let (query_hash, query_preview) = self.query_metadata(call.query);
        let row = UsageRecord {
            tool_name: call.tool_name.to_string(),
            outcome: call.outcome,
            latency_ms: ctx.latency_ms(),
            client_token_id: ctx.client_token_id.clone(),
            client_token_prefix: ctx.client_token_prefix.clone(),
            upstream_key_id: call.upstream_key_id,
            query_hash,
            query_preview,
            args_json: call.args.to_string(),
            error_message: call.error_message,
            timestamp_ms: unix_ms(),
        };

        let store = self.store.clone();
        let run_cleanup = self.cleanup_due();
        let retention_ms = self.cfg.retention_days.map(|d| d * DAY_MS);
        tokio::spawn(async move {
            if let Err(e) = store.insert_usage(row).await {
                debug!("usage: insert failed (swallowed), error={}", e);
            }
            if run_cleanup {
                if let Some(retention_ms) = retention_ms {
                    let cutoff = unix_ms().saturating_sub(retention_ms);
                    match store.delete_usage_before(cutoff).await {
                        Ok(removed) if removed > 0 => {
                            debug!("usage: retention sweep removed {} rows", removed)
                        }
                        Ok(_) => {}
                        Err(e) => debug!("usage: retention sweep failed (swallowed), error={}", e),
                    }
                }
            }
        });
    }

    fn query_metadata(&self, query: Option<&str>) -> (Option<String>, Option<String>) {
        let Some(query) = query else {
            return (None, None);
        };
        let hash = || Some(self.hash_query(query));
        match self.cfg.log_mode {
            UsageLogMode::None => (None, None),
            UsageLogMode::Hash => (hash(), None),
            UsageLogMode::Preview => (hash(), Some(redact::redacted_preview(query))),
            UsageLogMode::Full => (hash(), Some(redact::redact(query))),
        }
    }

    fn hash_query(&self, query: &str) -> String {
        match &self.cfg.hash_secret {
            Some(secret) => crypto::hmac_sha256_hex(secret, query),
            None => crypto::sha256_hex(query),
        }
    }

    fn cleanup_due(&self) -> bool {
        self.cfg.retention_days.is_some() && sample(self.cfg.cleanup_probability)
    }
}

/// Bernoulli draw with exact behavior at the extremes.
fn sample(rate: f64) -> bool {
    if rate >= 1.0 {
        true
    } else if rate <= 0.0 {
        false
    } else {
        rand::thread_rng().gen::<f64>() < rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ctx() -> RequestContext {
        RequestContext::new("tok-1", "mcp_abc", "mcp_abc.raw")
    }

    fn call<'a>(args: &'a serde_json::Value, query: Option<&'a str>) -> ToolCallLog<'a> {
        ToolCallLog {
            tool_name: "brave_web_search",
            outcome: UsageOutcome::Success,
            upstream_key_id: Some("key-9".into()),
            query,
            args,
            error_message: None,
        }
    }

    async fn drain() {
        // Let the detached insert task run.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_preview_mode_hashes_and_redacts() {
        let store = Arc::new(MemoryStore::new());
        let logger = UsageLogger::new(store.clone(), UsageLogConfig::default());
        let args = serde_json::json!({"query": "mail bob@example.com"});

        logger.log_tool_call(&ctx(), call(&args, Some("mail bob@example.com")));
        drain().await;

        let rows = store.usage_rows().await;
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.query_hash.as_deref().unwrap().len(), 64);
        let preview = row.query_preview.as_deref().unwrap();
        assert!(!preview.contains("bob@example.com"));
        assert!(preview.contains("<email>"));
        assert_eq!(row.upstream_key_id.as_deref(), Some("key-9"));
    }

    #[tokio::test]
    async fn test_none_mode_drops_query_metadata() {
        let store = Arc::new(MemoryStore::new());
        let cfg = UsageLogConfig {
            log_mode: UsageLogMode::None,
            ..UsageLogConfig::default()
        };
        let logger = UsageLogger::new(store.clone(), cfg);
        let args = serde_json::json!({"query": "secret things"});

        logger.log_tool_call(&ctx(), call(&args, Some("secret things")));
        drain().await;

        let rows = store.usage_rows().await;
        assert_eq!(rows[0].query_hash, None);
        assert_eq!(rows[0].query_preview, None);
    }

    #[tokio::test]
    async fn test_hmac_hash_when_secret_set() {
        let store = Arc::new(MemoryStore::new());
        let plain = UsageLogger::new(store.clone(), UsageLogConfig::default());
        let keyed = UsageLogger::new(
            store.clone(),
            UsageLogConfig {
                hash_secret: Some("pepper".into()),
                ..UsageLogConfig::default()
            },
        );
        assert_ne!(plain.hash_query("q"), keyed.hash_query("q"));
        assert_eq!(plain.hash_query("q"), crypto::sha256_hex("q"));
    }

    #[tokio::test]
    async fn test_zero_sample_rate_logs_nothing() {
        let store = Arc::new(MemoryStore::new());
        let cfg = UsageLogConfig {
            sample_rate: 0.0,
            ..UsageLogConfig::default()
        };
        let logger = UsageLogger::new(store.clone(), cfg);
        let args = serde_json::json!({});

        for _ in 0..10 {
            logger.log_tool_call(&ctx(), call(&args, Some("q")));
        }
        drain().await;
        assert_eq!(store.usage_len().await, 0);
    }

    #[test]
    fn test_sampling_extremes_and_distribution() {
        assert!(sample(1.0));
        assert!(sample(1.7));
        assert!(!sample(0.0));
        assert!(!sample(-0.2));

        let hits = (0..2000).filter(|_| sample(0.5)).count();
        // Loose statistical envelope; false-failure odds are negligible.
        assert!((600..1400).contains(&hits), "hits={hits}");
    }
}
