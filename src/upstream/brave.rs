use super::{Search, SearchOutcome, SearchRequest};
use crate::error::BridgeError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_COUNT: i64 = 10;
const MAX_COUNT: i64 = 20;
const MAX_OFFSET: i64 = 9;

/// Provider-B web search over the canonical REST endpoint.
///
/// Providers commonly lack a separate local endpoint, so `local_search`
/// delegates to `web_search`; the normalizer handles the shape difference.
pub struct HttpBraveClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl HttpBraveClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    async fn get(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError> {
        let query = build_query(req);
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&query)
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status().as_u16();
        match status {
            200..=299 => {
                let text = resp.text().await?;
                let body = serde_json::from_str::<Value>(&text)
                    .unwrap_or_else(|_| serde_json::json!({ "message": text }));
                Ok(SearchOutcome { body, key_id: None })
            }
            401 | 403 => Err(BridgeError::InvalidKey),
            429 => {
                let retry_after_ms = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(|secs| secs * 1000);
                Err(BridgeError::RateLimited { retry_after_ms })
            }
            s => {
                let message = resp.text().await.unwrap_or_default();
                Err(BridgeError::Upstream { status: s, message })
            }
        }
    }
}

#[async_trait]
impl Search for HttpBraveClient {
    async fn web_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError> {
        self.get(req).await
    }

    async fn local_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError> {
        self.get(req).await
    }
}

/// Marshal a request into query pairs: `q`, clamped `count`/`offset`, then
/// pass-through extras. Arrays join with commas, booleans render as
/// `true`/`false`, null and blank values are omitted entirely.
fn build_query(req: &SearchRequest) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(3 + req.extra.len());
    pairs.push(("q".to_string(), req.query.clone()));
    pairs.push((
        "count".to_string(),
        req.count.unwrap_or(DEFAULT_COUNT).clamp(1, MAX_COUNT).to_string(),
    ));
    pairs.push((
        "offset".to_string(),
        req.offset.unwrap_or(0).clamp(0, MAX_OFFSET).to_string(),
    ));

    for (name, value) in &req.extra {
        if let Some(rendered) = render_param(value) {
            pairs.push((name.clone(), rendered));
        }
    }
    pairs
}

fn render_param(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let joined: Vec<String> = items.iter().filter_map(render_param).collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join(","))
            }
        }
        Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs_to_map(pairs: Vec<(String, String)>) -> std::collections::HashMap<String, String> {
        pairs.into_iter().collect()
    }

    #[test]
    fn test_defaults_and_clamping() {
        let req = SearchRequest::new("rust");
        let q = pairs_to_map(build_query(&req));
        assert_eq!(q["q"], "rust");
        assert_eq!(q["count"], "10");
        assert_eq!(q["offset"], "0");

        let mut req = SearchRequest::new("rust");
        req.count = Some(99);
        req.offset = Some(42);
        let q = pairs_to_map(build_query(&req));
        assert_eq!(q["count"], "20");
        assert_eq!(q["offset"], "9");

        let mut req = SearchRequest::new("rust");
        req.count = Some(0);
        req.offset = Some(-3);
        let q = pairs_to_map(build_query(&req));
        assert_eq!(q["count"], "1");
        assert_eq!(q["offset"], "0");
    }

    #[test]
    fn test_extra_param_rendering() {
        let mut req = SearchRequest::new("coffee");
        req.extra.insert("country".into(), json!("DE"));
        req.extra.insert("safesearch".into(), json!(true));
        req.extra.insert("result_filter".into(), json!(["web", "news"]));
        req.extra.insert("freshness".into(), json!(null));
        req.extra.insert("goggles_id".into(), json!("  "));
        req.extra.insert("units".into(), json!(3));

        let q = pairs_to_map(build_query(&req));
        assert_eq!(q["country"], "DE");
        assert_eq!(q["safesearch"], "true");
        assert_eq!(q["result_filter"], "web,news");
        assert_eq!(q["units"], "3");
        assert!(!q.contains_key("freshness"));
        assert!(!q.contains_key("goggles_id"));
    }
}
