pub mod memory;

pub use memory::MemoryStore;

use crate::error::BridgeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Which upstream a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Tavily,
    Brave,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Tavily => "tavily",
            Provider::Brave => "brave",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Cooldown,
    /// Terminal unless externally reset.
    Invalid,
}

/// Cached credit state persisted alongside a key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditState {
    pub remaining: Option<f64>,
    pub checked_at_ms: Option<u64>,
    pub expires_at_ms: Option<u64>,
    pub key_usage: Option<f64>,
    pub key_limit: Option<f64>,
    pub plan_usage: Option<f64>,
    pub plan_limit: Option<f64>,
    pub paygo_usage: Option<f64>,
    pub paygo_limit: Option<f64>,
}

impl CreditState {
    /// Fresh means the TTL has not expired and a finite remaining is cached.
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(exp) if exp > now_ms)
            && matches!(self.remaining, Some(r) if r.is_finite())
    }
}

/// One registered upstream API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamKeyRecord {
    pub id: String,
    pub provider: Provider,
    /// AES-256-GCM sealed key material, base64.
    pub encrypted_key: String,
    pub status: KeyStatus,
    pub cooldown_until_ms: Option<u64>,
    pub last_used_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub credits: CreditState,
}

impl UpstreamKeyRecord {
    pub fn new(id: String, provider: Provider, encrypted_key: String, now_ms: u64) -> Self {
        Self {
            id,
            provider,
            encrypted_key,
            status: KeyStatus::Active,
            cooldown_until_ms: None,
            last_used_at_ms: None,
            created_at_ms: now_ms,
            credits: CreditState::default(),
        }
    }

    /// Eligible: not invalid, and any cooldown has lapsed.
    pub fn is_eligible(&self, now_ms: u64) -> bool {
        match self.status {
            KeyStatus::Invalid => false,
            KeyStatus::Active | KeyStatus::Cooldown => {
                self.cooldown_until_ms.is_none_or(|until| until <= now_ms)
            }
        }
    }
}

/// A client token record. The raw secret never lands here; only its SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTokenRecord {
    pub id: String,
    /// Display prefix, the part of the token before the first `.`.
    pub prefix: String,
    /// Lowercase hex SHA-256 of the secret half.
    pub secret_hash: String,
    pub revoked_at_ms: Option<u64>,
    pub expires_at_ms: Option<u64>,
    /// Opaque policy blob, passed through to the host.
    pub allowed_tools: Option<serde_json::Value>,
    /// Advisory only; enforcement is the host's concern.
    pub rate_limit: Option<u32>,
    pub created_at_ms: u64,
}

impl ClientTokenRecord {
    pub fn is_usable(&self, now_ms: u64) -> bool {
        self.revoked_at_ms.is_none()
            && self.expires_at_ms.is_none_or(|exp| exp > now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Error,
}

/// Append-only usage row, mutated once at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tool_name: String,
    pub outcome: UsageOutcome,
    pub latency_ms: u64,
    pub client_token_id: String,
    pub client_token_prefix: String,
    pub upstream_key_id: Option<String>,
    pub query_hash: Option<String>,
    pub query_preview: Option<String>,
    pub args_json: String,
    pub error_message: Option<String>,
    pub timestamp_ms: u64,
}

pub type StoreResult<T> = Result<T, BridgeError>;

/// Persistence contract the bridge core depends on.
///
/// The production deployment backs this with a database; `MemoryStore` backs
/// the binaries by default and every test. Key updates are atomic by id,
/// usage rows are append-only, and the credits-refresh lock is a best-effort
/// advisory lease with a TTL.
#[async_trait]
pub trait Store: Send + Sync {
    // -- upstream keys --

    async fn insert_key(&self, record: UpstreamKeyRecord) -> StoreResult<()>;

    async fn get_key(&self, id: &str) -> StoreResult<Option<UpstreamKeyRecord>>;

    /// Full-record replace, atomic with respect to other writers of this id.
    async fn update_key(&self, record: &UpstreamKeyRecord) -> StoreResult<()>;

    /// Eligible keys for a provider ordered by `(last_used_at asc nulls
    /// first, created_at asc)`, capped at `limit`.
    async fn list_eligible_keys(
        &self,
        provider: Provider,
        now_ms: u64,
        limit: usize,
    ) -> StoreResult<Vec<UpstreamKeyRecord>>;

    async fn count_keys(&self, provider: Provider) -> StoreResult<usize>;

    // -- client tokens --

    async fn insert_token(&self, record: ClientTokenRecord) -> StoreResult<()>;

    async fn find_token_by_prefix(&self, prefix: &str)
        -> StoreResult<Option<ClientTokenRecord>>;

    // -- usage rows --

    async fn insert_usage(&self, row: UsageRecord) -> StoreResult<()>;

    /// Delete rows strictly older than `cutoff_ms`. Returns rows removed.
    async fn delete_usage_before(&self, cutoff_ms: u64) -> StoreResult<u64>;

    // -- credits refresh lock --

    /// Try to take the per-key advisory refresh lease. Returns a lock token
    /// on success, `None` when another holder has a live lease.
    async fn try_acquire_credits_refresh_lock(
        &self,
        key_id: &str,
        ttl_ms: u64,
    ) -> StoreResult<Option<String>>;

    /// Release a previously acquired lease. Releasing with a stale token is
    /// a no-op.
    async fn release_credits_refresh_lock(&self, key_id: &str, token: &str) -> StoreResult<()>;
}
