use crate::config::{BraveOverflowMode, SearchSourceMode};
use crate::error::BridgeError;
use crate::gate::RateGate;
use crate::normalize::{self, NormalizedResult};
use crate::upstream::{Search, SearchRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which normalization path a routed search takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Web,
    Local,
}

/// Outcome of a routed search: normalized rows plus the upstream key that
/// served them (when a rotating client was involved).
#[derive(Debug, Clone)]
pub struct RoutedSearch {
    pub results: Vec<NormalizedResult>,
    pub key_id: Option<String>,
    /// The mode that actually served the call, for telemetry.
    pub mode: SearchSourceMode,
}

/// Per-call routing across the two providers.
///
/// Owns the Brave rate gate: every Provider-B call is paced, and the
/// overflow policy decides what a blown wait budget means in
/// `brave_prefer_tavily_fallback` mode.
pub struct SearchRouter {
    default_mode: SearchSourceMode,
    overflow: BraveOverflowMode,
    max_queue: Duration,
    brave_gate: Arc<RateGate>,
    brave: Option<Arc<dyn Search>>,
    tavily: Option<Arc<dyn Search>>,
}

impl SearchRouter {
    pub fn new(
        default_mode: SearchSourceMode,
        overflow: BraveOverflowMode,
        max_queue: Duration,
        brave_gate: Arc<RateGate>,
        brave: Option<Arc<dyn Search>>,
        tavily: Option<Arc<dyn Search>>,
    ) -> Self {
        Self {
            default_mode,
            overflow,
            max_queue,
            brave_gate,
            brave,
            tavily,
        }
    }

    pub fn default_mode(&self) -> SearchSourceMode {
        self.default_mode
    }

    pub fn tavily_client(&self) -> Option<&Arc<dyn Search>> {
        self.tavily.as_ref()
    }

    /// Resolve the mode for one tool call. Junk or absent overrides fall
    /// back to the configured default.
    pub fn resolve_mode(&self, override_tag: Option<&str>) -> SearchSourceMode {
        override_tag
            .and_then(SearchSourceMode::parse_loose)
            .unwrap_or(self.default_mode)
    }

    /// Route one search according to the resolved mode.
    pub async fn search(
        &self,
        kind: SearchKind,
        req: &SearchRequest,
        override_tag: Option<&str>,
    ) -> Result<RoutedSearch, BridgeError> {
        let mode = self.resolve_mode(override_tag);
        metrics::counter!(
            "bridge_routed_search_total",
            "mode" => mode.as_str(),
        )
        .increment(1);

        match mode {
            SearchSourceMode::TavilyOnly => self.tavily_search(kind, req).await,
            SearchSourceMode::BraveOnly => {
                self.brave_search(kind, req, Some(self.max_queue)).await
            }
            SearchSourceMode::Combined => self.combined_search(kind, req).await,
            SearchSourceMode::BravePreferTavilyFallback => self.fallback_search(kind, req).await,
        }
    }

    async fn tavily_search(
        &self,
        kind: SearchKind,
        req: &SearchRequest,
    ) -> Result<RoutedSearch, BridgeError> {
        let Some(tavily) = &self.tavily else {
            return Err(BridgeError::UpstreamUnavailable);
        };
        let outcome = match kind {
            SearchKind::Web => tavily.web_search(req).await?,
            SearchKind::Local => tavily.local_search(req).await?,
        };
        Ok(RoutedSearch {
            results: normalize::tavily_to_brave(&outcome.body),
            key_id: outcome.key_id,
            mode: SearchSourceMode::TavilyOnly,
        })
    }

    async fn brave_search(
        &self,
        kind: SearchKind,
        req: &SearchRequest,
        budget: Option<Duration>,
    ) -> Result<RoutedSearch, BridgeError> {
        let Some(brave) = &self.brave else {
            return Err(BridgeError::UpstreamUnavailable);
        };
        let outcome = self
            .brave_gate
            .run(budget, || async move {
                match kind {
                    SearchKind::Web => brave.web_search(req).await,
                    SearchKind::Local => brave.local_search(req).await,
                }
            })
            .await??;

        let results = match kind {
            SearchKind::Web => normalize::normalize_web(&outcome.body),
            SearchKind::Local => normalize::normalize_local(&outcome.body),
        };
        Ok(RoutedSearch {
            results,
            key_id: outcome.key_id,
            mode: SearchSourceMode::BraveOnly,
        })
    }

    /// Both providers concurrently; Provider-B rows lead the concatenation.
    async fn combined_search(
        &self,
        kind: SearchKind,
        req: &SearchRequest,
    ) -> Result<RoutedSearch, BridgeError> {
        let (brave_out, tavily_out) = futures_util::future::join(
            self.brave_search(kind, req, Some(self.max_queue)),
            self.tavily_search(kind, req),
        )
        .await;
        let brave_out = brave_out?;
        let tavily_out = tavily_out?;

        let mut results = brave_out.results;
        results.extend(tavily_out.results);
        Ok(RoutedSearch {
            results,
            key_id: tavily_out.key_id,
            mode: SearchSourceMode::Combined,
        })
    }

    /// Provider-B first; any Brave failure, a blown gate budget (per the
    /// overflow policy), or an unconfigured Provider-B falls back to
    /// Provider-T.
    async fn fallback_search(
        &self,
        kind: SearchKind,
        req: &SearchRequest,
    ) -> Result<RoutedSearch, BridgeError> {
        if self.brave.is_none() {
            return self.tavily_search(kind, req).await;
        }

        let budget = match self.overflow {
            BraveOverflowMode::Queue => None,
            _ => Some(self.max_queue),
        };

        match self.brave_search(kind, req, budget).await {
            Ok(routed) => Ok(RoutedSearch {
                mode: SearchSourceMode::BravePreferTavilyFallback,
                ..routed
            }),
            Err(err @ BridgeError::RateGateTimeout { .. })
                if self.overflow == BraveOverflowMode::Error =>
            {
                Err(err)
            }
            Err(e) => {
                debug!("routing: brave path failed, falling back to tavily, error={}", e);
                metrics::counter!("bridge_fallback_to_tavily_total").increment(1);
                if self.tavily.is_none() {
                    return Err(e);
                }
                self.tavily_search(kind, req).await
            }
        }
    }
}
