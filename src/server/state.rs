use crate::config::BridgeConfig;
use crate::credits::CreditsClient;
use crate::crypto::{self, KeyCipher};
use crate::gate::RateGate;
use crate::mcp::SessionRegistry;
use crate::metrics::Metrics;
use crate::pool::{KeyPool, SelectionStrategy};
use crate::routing::SearchRouter;
use crate::store::{unix_ms, ClientTokenRecord, Provider, Store, UpstreamKeyRecord};
use crate::upstream::{
    HttpBraveClient, HttpTavilyApi, LoggingSearch, RotatingTavilyClient, Search,
};
use crate::usage::UsageLogger;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared bridge state, cheaply cloneable.
///
/// Built once at bootstrap from config + store; every subsystem hangs off
/// an `Arc` here. `metrics` is populated only by the server bootstrap — unit
/// tests build state without a global recorder.
#[derive(Clone)]
pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    pub store: Arc<dyn Store>,
    pub sessions: Arc<SessionRegistry>,
    pub router: Arc<SearchRouter>,
    /// Rotating Provider-T client, also serving `tavily_extract`.
    pub tavily: Option<Arc<RotatingTavilyClient>>,
    /// The pool behind `tavily`, exposed for preflight and the admin plane.
    pub tavily_pool: Option<Arc<KeyPool>>,
    pub usage: Arc<UsageLogger>,
    pub metrics: Option<Metrics>,
}

impl BridgeState {
    pub async fn new(config: BridgeConfig, store: Arc<dyn Store>) -> Result<Self> {
        let cipher = KeyCipher::from_secret(&config.encryption.secret)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        import_keys(&*store, &cipher, &config).await?;
        import_client_tokens(&*store, &config).await?;

        // Provider-T: key pool + rotating client.
        let (tavily, tavily_pool) = if config.tavily.api_keys.is_some() {
            let pool = Arc::new(KeyPool::new(
                Provider::Tavily,
                store.clone(),
                Arc::new(CreditsClient::new(config.tavily.api_base.clone())),
                cipher.clone(),
                config.credits.clone(),
                SelectionStrategy::parse(&config.tavily.selection_strategy),
            ));
            let api = Arc::new(HttpTavilyApi::new(
                config.tavily.api_base.clone(),
                Duration::from_millis(config.tavily.http_timeout_ms),
            ));
            let client = Arc::new(RotatingTavilyClient::new(
                pool.clone(),
                api,
                config.tavily.max_retries,
                config.tavily.cooldown_ms,
            ));
            (Some(client), Some(pool))
        } else {
            info!("state: provider-t not configured (no tavily keys)");
            (None, None)
        };

        // Provider-B: plain HTTP client on the first configured key.
        let brave: Option<Arc<dyn Search>> = match config.brave.api_keys.as_deref() {
            Some([first, ..]) => {
                let client = HttpBraveClient::new(
                    config.brave.endpoint.clone(),
                    first.clone(),
                    Duration::from_millis(config.brave.http_timeout_ms),
                );
                Some(Arc::new(LoggingSearch::new("brave", Arc::new(client))) as Arc<dyn Search>)
            }
            _ => {
                info!("state: provider-b not configured (no brave key)");
                None
            }
        };

        let tavily_search: Option<Arc<dyn Search>> = tavily.clone().map(|client| {
            Arc::new(LoggingSearch::new("tavily", client as Arc<dyn Search>)) as Arc<dyn Search>
        });

        let brave_gate = Arc::new(RateGate::new(
            "brave",
            Duration::from_millis(config.brave.effective_min_interval_ms()),
        ));
        let router = Arc::new(SearchRouter::new(
            config.search_source_mode,
            config.brave.overflow,
            Duration::from_millis(config.brave.max_queue_ms),
            brave_gate,
            brave,
            tavily_search,
        ));

        let sessions = Arc::new(SessionRegistry::new());
        let usage = Arc::new(UsageLogger::new(store.clone(), config.usage.clone()));

        Ok(Self {
            config: Arc::new(config),
            store,
            sessions,
            router,
            tavily,
            tavily_pool,
            usage,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Seed the store from configured plaintext keys, sealing material on the
/// way in. Ids derive from the key digest so re-imports are idempotent.
async fn import_keys(store: &dyn Store, cipher: &KeyCipher, config: &BridgeConfig) -> Result<()> {
    let now = unix_ms();
    for (provider, keys) in [
        (Provider::Tavily, &config.tavily.api_keys),
        (Provider::Brave, &config.brave.api_keys),
    ] {
        let Some(keys) = keys else { continue };
        for key in keys {
            let id = format!("{}-{}", provider.as_str(), &crypto::sha256_hex(key)[..12]);
            if store
                .get_key(&id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?
                .is_some()
            {
                continue;
            }
            let sealed = cipher.encrypt(key).map_err(|e| anyhow::anyhow!("{e}"))?;
            store
                .insert_key(UpstreamKeyRecord::new(id, provider, sealed, now))
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        info!(
            "state: imported {} {} key(s)",
            keys.len(),
            provider.as_str()
        );
    }
    Ok(())
}

/// Import `mcp_<prefix>.<secret>` client tokens; only the secret hash lands
/// in the store.
async fn import_client_tokens(store: &dyn Store, config: &BridgeConfig) -> Result<()> {
    let Some(tokens) = &config.client_tokens else {
        return Ok(());
    };
    let now = unix_ms();
    for token in tokens {
        let Some((prefix, secret)) = token.split_once('.') else {
            anyhow::bail!("client token must look like mcp_<prefix>.<secret>");
        };
        if prefix.is_empty() || secret.is_empty() {
            anyhow::bail!("client token must look like mcp_<prefix>.<secret>");
        }
        store
            .insert_token(ClientTokenRecord {
                id: prefix.to_string(),
                prefix: prefix.to_string(),
                secret_hash: crypto::sha256_hex(secret),
                revoked_at_ms: None,
                expires_at_ms: None,
                allowed_tools: None,
                rate_limit: None,
                created_at_ms: now,
            })
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    info!("state: imported {} client token(s)", tokens.len());
    Ok(())
}
