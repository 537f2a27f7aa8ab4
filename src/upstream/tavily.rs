use super::{Search, SearchOutcome, SearchRequest};
use crate::error::BridgeError;
use crate::pool::KeyPool;
use crate::store::unix_ms;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Provider-T operations the bridge exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TavilyOp {
    Search,
    Extract,
}

impl TavilyOp {
    fn path(&self) -> &'static str {
        match self {
            TavilyOp::Search => "/search",
            TavilyOp::Extract => "/extract",
        }
    }
}

/// One raw call against the Tavily API with a concrete key. Split out from
/// the rotating wrapper so pool behavior is testable without a network.
#[async_trait]
pub trait TavilyApi: Send + Sync {
    async fn call(
        &self,
        api_key: &str,
        op: TavilyOp,
        payload: &Value,
    ) -> Result<Value, BridgeError>;
}

pub struct HttpTavilyApi {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTavilyApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TavilyApi for HttpTavilyApi {
    async fn call(
        &self,
        api_key: &str,
        op: TavilyOp,
        payload: &Value,
    ) -> Result<Value, BridgeError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), op.path());
        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status().as_u16();
        match status {
            200..=299 => resp
                .json()
                .await
                .map_err(|e| BridgeError::Transient(format!("tavily body: {e}"))),
            401 | 403 => Err(BridgeError::InvalidKey),
            // 432 is the provider's explicit out-of-credits signal.
            432 => Err(BridgeError::QuotaExceeded),
            429 => {
                let retry_after_ms = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(|secs| secs * 1000);
                Err(BridgeError::RateLimited { retry_after_ms })
            }
            s if s >= 500 => Err(BridgeError::Transient(format!("tavily {s}"))),
            s => {
                let message = resp.text().await.unwrap_or_default();
                Err(BridgeError::Upstream { status: s, message })
            }
        }
    }
}

/// Key-rotating Provider-T client.
///
/// Wraps the pool with an attempt loop: invalid keys are swapped without
/// consuming the retry budget, quota and rate-limit signals cool the key
/// down and move on, transient failures retry the same key. When the budget
/// or the eligible set runs dry the caller sees `UpstreamUnavailable`.
pub struct RotatingTavilyClient {
    pool: Arc<KeyPool>,
    api: Arc<dyn TavilyApi>,
    max_retries: u32,
    fixed_cooldown_ms: u64,
}

impl RotatingTavilyClient {
    pub fn new(
        pool: Arc<KeyPool>,
        api: Arc<dyn TavilyApi>,
        max_retries: u32,
        fixed_cooldown_ms: u64,
    ) -> Self {
        Self {
            pool,
            api,
            max_retries,
            fixed_cooldown_ms,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Run one operation through the attempt loop.
    pub async fn invoke(&self, op: TavilyOp, payload: &Value) -> Result<SearchOutcome, BridgeError> {
        // Budget covers transient and quota failures; invalid-key swaps are
        // bounded only by the eligible set so a poisoned record cannot pin
        // the loop.
        let mut budget = self.max_retries;

        'select: loop {
            let Some(key) = self.pool.select_key().await? else {
                warn!("tavily: no eligible keys remain");
                return Err(BridgeError::UpstreamUnavailable);
            };

            loop {
                match self.api.call(&key.api_key, op, payload).await {
                    Ok(body) => {
                        return Ok(SearchOutcome {
                            body,
                            key_id: Some(key.id),
                        })
                    }
                    Err(BridgeError::InvalidKey) => {
                        warn!("tavily: key rejected, rotating, key={}", key.id);
                        self.pool.mark_invalid(&key.id).await.ok();
                        continue 'select;
                    }
                    Err(BridgeError::QuotaExceeded) => {
                        self.pool
                            .mark_cooldown(&key.id, unix_ms() + self.fixed_cooldown_ms)
                            .await
                            .ok();
                        if budget == 0 {
                            return Err(BridgeError::UpstreamUnavailable);
                        }
                        budget -= 1;
                        continue 'select;
                    }
                    Err(BridgeError::RateLimited { retry_after_ms }) => {
                        let until =
                            unix_ms() + retry_after_ms.unwrap_or(self.fixed_cooldown_ms);
                        debug!(
                            "tavily: rate limited, cooling key={} until={}",
                            key.id, until
                        );
                        self.pool.mark_cooldown(&key.id, until).await.ok();
                        continue 'select;
                    }
                    Err(e) if e.is_transient() => {
                        if budget == 0 {
                            return Err(BridgeError::UpstreamUnavailable);
                        }
                        budget -= 1;
                        debug!(
                            "tavily: transient failure, retrying same key={}, error={}",
                            key.id, e
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn search_payload(req: &SearchRequest) -> Value {
        let mut payload = serde_json::Map::new();
        payload.insert("query".into(), Value::String(req.query.clone()));
        if let Some(count) = req.count {
            payload.insert("max_results".into(), Value::from(count));
        }
        for (name, value) in &req.extra {
            payload.insert(name.clone(), value.clone());
        }
        Value::Object(payload)
    }
}

#[async_trait]
impl Search for RotatingTavilyClient {
    async fn web_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError> {
        self.invoke(TavilyOp::Search, &Self::search_payload(req)).await
    }

    async fn local_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError> {
        // No dedicated local endpoint upstream; web search covers it.
        self.invoke(TavilyOp::Search, &Self::search_payload(req)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CreditsConfig;
    use crate::credits::{CreditSnapshot, CreditsApi, FetchOptions};
    use crate::crypto::KeyCipher;
    use crate::pool::SelectionStrategy;
    use crate::store::{KeyStatus, MemoryStore, Provider, Store, UpstreamKeyRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Credits API that always reports plenty left.
    struct RichCredits;

    #[async_trait]
    impl CreditsApi for RichCredits {
        async fn fetch_credits(
            &self,
            _api_key: &str,
            _opts: &FetchOptions,
        ) -> Result<CreditSnapshot, BridgeError> {
            Ok(CreditSnapshot {
                remaining: Some(1000.0),
                ..CreditSnapshot::default()
            })
        }
    }

    /// Scripted Tavily API keyed by call order.
    struct FakeApi {
        script: Mutex<Vec<Result<Value, BridgeError>>>,
        calls: AtomicUsize,
        keys_seen: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new(script: Vec<Result<Value, BridgeError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                keys_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TavilyApi for FakeApi {
        async fn call(
            &self,
            api_key: &str,
            _op: TavilyOp,
            _payload: &Value,
        ) -> Result<Value, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keys_seen.lock().await.push(api_key.to_string());
            let mut script = self.script.lock().await;
            if script.is_empty() {
                return Ok(serde_json::json!({"results": []}));
            }
            script.remove(0)
        }
    }

    fn cipher() -> KeyCipher {
        KeyCipher::from_secret(&"t".repeat(32)).unwrap()
    }

    async fn seed(store: &MemoryStore, cipher: &KeyCipher, id: &str, created: u64) {
        let rec = UpstreamKeyRecord::new(
            id.to_string(),
            Provider::Tavily,
            cipher.encrypt(&format!("tvly-{id}")).unwrap(),
            created,
        );
        store.insert_key(rec).await.unwrap();
    }

    async fn client(
        store: Arc<MemoryStore>,
        api: Arc<FakeApi>,
        max_retries: u32,
    ) -> RotatingTavilyClient {
        let pool = Arc::new(KeyPool::new(
            Provider::Tavily,
            store,
            Arc::new(RichCredits),
            cipher(),
            CreditsConfig::default(),
            SelectionStrategy::RoundRobin,
        ));
        RotatingTavilyClient::new(pool, api, max_retries, 60_000)
    }

    #[tokio::test]
    async fn test_success_reports_serving_key() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &cipher(), "k1", 1).await;
        let api = Arc::new(FakeApi::new(vec![Ok(serde_json::json!({"results": [1]}))]));

        let c = client(store, api, 2).await;
        let out = c.invoke(TavilyOp::Search, &serde_json::json!({})).await.unwrap();
        assert_eq!(out.key_id.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_invalid_key_swaps_without_spending_budget() {
        let store = Arc::new(MemoryStore::new());
        let cipher_ = cipher();
        seed(&store, &cipher_, "k1", 1).await;
        seed(&store, &cipher_, "k2", 2).await;
        let api = Arc::new(FakeApi::new(vec![
            Err(BridgeError::InvalidKey),
            Ok(serde_json::json!({"ok": true})),
        ]));

        // Zero budget: only invalid-key swaps could reach k2.
        let c = client(store.clone(), api.clone(), 0).await;
        let out = c.invoke(TavilyOp::Search, &serde_json::json!({})).await.unwrap();
        assert_eq!(out.key_id.as_deref(), Some("k2"));
        assert_eq!(
            store.get_key("k1").await.unwrap().unwrap().status,
            KeyStatus::Invalid
        );
    }

    #[tokio::test]
    async fn test_transient_retries_same_key() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &cipher(), "k1", 1).await;
        let api = Arc::new(FakeApi::new(vec![
            Err(BridgeError::Transient("blip".into())),
            Ok(serde_json::json!({"ok": true})),
        ]));

        let c = client(store, api.clone(), 2).await;
        c.invoke(TavilyOp::Search, &serde_json::json!({})).await.unwrap();
        let keys = api.keys_seen.lock().await.clone();
        assert_eq!(keys, vec!["tvly-k1".to_string(), "tvly-k1".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_budget_surfaces_unavailable() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, &cipher(), "k1", 1).await;
        let api = Arc::new(FakeApi::new(vec![
            Err(BridgeError::Transient("a".into())),
            Err(BridgeError::Transient("b".into())),
            Err(BridgeError::Transient("c".into())),
        ]));

        let c = client(store, api, 2).await;
        let err = c.invoke(TavilyOp::Search, &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::UpstreamUnavailable));
    }

    #[tokio::test]
    async fn test_rate_limit_cools_down_with_retry_after() {
        let store = Arc::new(MemoryStore::new());
        let cipher_ = cipher();
        seed(&store, &cipher_, "k1", 1).await;
        seed(&store, &cipher_, "k2", 2).await;
        let api = Arc::new(FakeApi::new(vec![
            Err(BridgeError::RateLimited {
                retry_after_ms: Some(120_000),
            }),
            Ok(serde_json::json!({"ok": true})),
        ]));

        let c = client(store.clone(), api, 2).await;
        let out = c.invoke(TavilyOp::Search, &serde_json::json!({})).await.unwrap();
        assert_eq!(out.key_id.as_deref(), Some("k2"));

        let cooled = store.get_key("k1").await.unwrap().unwrap();
        assert_eq!(cooled.status, KeyStatus::Cooldown);
        assert!(cooled.cooldown_until_ms.unwrap() >= unix_ms() + 100_000);
    }

    #[tokio::test]
    async fn test_no_keys_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FakeApi::new(vec![]));
        let c = client(store, api, 2).await;
        let err = c.invoke(TavilyOp::Search, &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::UpstreamUnavailable));
    }

    #[test]
    fn test_search_payload_shape() {
        let mut req = SearchRequest::new("rust async");
        req.count = Some(5);
        req.extra
            .insert("search_depth".into(), Value::String("advanced".into()));
        let payload = RotatingTavilyClient::search_payload(&req);
        assert_eq!(payload["query"], "rust async");
        assert_eq!(payload["max_results"], 5);
        assert_eq!(payload["search_depth"], "advanced");
    }
}
