pub mod brave;
pub mod logging;
pub mod tavily;

pub use brave::HttpBraveClient;
pub use logging::LoggingSearch;
pub use tavily::{HttpTavilyApi, RotatingTavilyClient, TavilyApi, TavilyOp};

use crate::error::BridgeError;
use async_trait::async_trait;
use serde_json::Value;

/// A search invocation shared across providers. `extra` carries caller
/// parameters the bridge passes through untouched.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub count: Option<i64>,
    pub offset: Option<i64>,
    pub extra: serde_json::Map<String, Value>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// Raw provider response plus the upstream key that served it (when the
/// client rotates keys).
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub body: Value,
    pub key_id: Option<String>,
}

/// The capability set every upstream search client exposes.
///
/// Implementations: `HttpBraveClient`, `RotatingTavilyClient`, and
/// `LoggingSearch` wrapping either. Decorators must hand the inner error
/// taxonomy through untouched.
#[async_trait]
pub trait Search: Send + Sync {
    async fn web_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError>;

    async fn local_search(&self, req: &SearchRequest) -> Result<SearchOutcome, BridgeError>;
}
