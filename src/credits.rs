use crate::error::BridgeError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Read-only view of a key's remote credit state.
#[derive(Debug, Clone, Default)]
pub struct CreditSnapshot {
    /// Best estimate of credits left for this key. Key-scoped budget when
    /// the provider reports one, account-scoped budget otherwise.
    pub remaining: Option<f64>,
    pub key_usage: Option<f64>,
    pub key_limit: Option<f64>,
    pub plan_usage: Option<f64>,
    pub plan_limit: Option<f64>,
    pub paygo_usage: Option<f64>,
    pub paygo_limit: Option<f64>,
    pub account_remaining: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

/// Remote credit lookup, mockable for pool tests.
#[async_trait]
pub trait CreditsApi: Send + Sync {
    /// Fetch the current credit snapshot for `api_key`.
    ///
    /// Fails with `InvalidKey` on 401/403, `QuotaExceeded` on an explicit
    /// quota response, `Transient` otherwise. Only transient transport
    /// failures are retried; total wall time is bounded by
    /// `max_retries × (timeout + retry_delay)`.
    async fn fetch_credits(
        &self,
        api_key: &str,
        opts: &FetchOptions,
    ) -> Result<CreditSnapshot, BridgeError>;
}

/// HTTP client for the Tavily usage endpoint.
pub struct CreditsClient {
    http: reqwest::Client,
    base_url: String,
}

impl CreditsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn fetch_once(
        &self,
        api_key: &str,
        timeout: Duration,
    ) -> Result<CreditSnapshot, BridgeError> {
        let url = format!("{}/usage", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(api_key)
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status().as_u16();
        match status {
            200..=299 => {
                let body: UsageResponse = resp
                    .json()
                    .await
                    .map_err(|e| BridgeError::Transient(format!("usage body: {e}")))?;
                Ok(body.into_snapshot())
            }
            401 | 403 => Err(BridgeError::InvalidKey),
            429 | 432 => Err(BridgeError::QuotaExceeded),
            s if s >= 500 => Err(BridgeError::Transient(format!("usage endpoint {s}"))),
            s => {
                let message = resp.text().await.unwrap_or_default();
                Err(BridgeError::Upstream { status: s, message })
            }
        }
    }
}

#[async_trait]
impl CreditsApi for CreditsClient {
    async fn fetch_credits(
        &self,
        api_key: &str,
        opts: &FetchOptions,
    ) -> Result<CreditSnapshot, BridgeError> {
        let attempts = opts.max_retries.max(1);
        let mut last_err = BridgeError::Transient("no attempt made".into());
        for attempt in 0..attempts {
            match self.fetch_once(api_key, opts.timeout).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        "credits: transient fetch failure, attempt={}, error={}",
                        attempt + 1,
                        e
                    );
                    last_err = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(opts.retry_delay).await;
                    }
                }
                // 401/403 and quota responses are never retried.
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

/// Wire shape of the usage endpoint.
#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    key: Option<KeyUsage>,
    #[serde(default)]
    account: Option<AccountUsage>,
}

#[derive(Debug, Deserialize)]
struct KeyUsage {
    #[serde(default)]
    usage: Option<f64>,
    #[serde(default)]
    limit: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AccountUsage {
    #[serde(default)]
    plan_usage: Option<f64>,
    #[serde(default)]
    plan_limit: Option<f64>,
    #[serde(default)]
    paygo_usage: Option<f64>,
    #[serde(default)]
    paygo_limit: Option<f64>,
}

impl UsageResponse {
    fn into_snapshot(self) -> CreditSnapshot {
        let (key_usage, key_limit) = match &self.key {
            Some(k) => (k.usage, k.limit),
            None => (None, None),
        };
        let (plan_usage, plan_limit, paygo_usage, paygo_limit) = match &self.account {
            Some(a) => (a.plan_usage, a.plan_limit, a.paygo_usage, a.paygo_limit),
            None => (None, None, None, None),
        };

        let account_remaining = match (plan_limit, paygo_limit) {
            (None, None) => None,
            _ => Some(
                budget(plan_usage, plan_limit) + budget(paygo_usage, paygo_limit),
            ),
        };

        let remaining = match (key_usage, key_limit) {
            (Some(u), Some(l)) if u.is_finite() && l.is_finite() => Some(l - u),
            _ => account_remaining,
        };

        CreditSnapshot {
            remaining,
            key_usage,
            key_limit,
            plan_usage,
            plan_limit,
            paygo_usage,
            paygo_limit,
            account_remaining,
        }
    }
}

fn budget(usage: Option<f64>, limit: Option<f64>) -> f64 {
    limit.unwrap_or(0.0) - usage.unwrap_or(0.0)
}
