use serde::{Deserialize, Serialize};

/// Top-level bridge configuration.
///
/// Everything here can live in an optional TOML/JSON file; environment
/// variables override the file on load. Defaults allow starting with nothing
/// but `KEY_ENCRYPTION_SECRET` set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub credits: CreditsConfig,

    #[serde(default)]
    pub tavily: TavilyConfig,

    #[serde(default)]
    pub brave: BraveConfig,

    #[serde(default)]
    pub usage: UsageLogConfig,

    /// Default routing mode for `brave_*` tool calls.
    #[serde(default)]
    pub search_source_mode: SearchSourceMode,

    /// `mcp_<prefix>.<secret>` client tokens imported at bootstrap.
    /// `None` = rely on externally provisioned tokens.
    #[serde(default)]
    pub client_tokens: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// 32-byte AES-256-GCM key (hex, base64, or raw). Required.
    #[serde(default)]
    pub secret: String,
}

/// Credit-cache tunables. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    #[serde(default = "default_credits_ttl_ms")]
    pub ttl_ms: u64,

    /// How long a stale snapshot stays trusted when the refresh lock is held
    /// by someone else.
    #[serde(default = "default_stale_grace_ms")]
    pub stale_grace_ms: u64,

    /// Keys at or below this remaining-credit floor are cooled down.
    #[serde(default = "default_min_remaining")]
    pub min_remaining: i64,

    #[serde(default = "default_credits_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_refresh_lock_ms")]
    pub refresh_lock_ms: u64,

    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,

    #[serde(default = "default_refresh_max_retries")]
    pub refresh_max_retries: u32,

    #[serde(default = "default_refresh_retry_delay_ms")]
    pub refresh_retry_delay_ms: u64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_credits_ttl_ms(),
            stale_grace_ms: default_stale_grace_ms(),
            min_remaining: default_min_remaining(),
            cooldown_ms: default_credits_cooldown_ms(),
            refresh_lock_ms: default_refresh_lock_ms(),
            refresh_timeout_ms: default_refresh_timeout_ms(),
            refresh_max_retries: default_refresh_max_retries(),
            refresh_retry_delay_ms: default_refresh_retry_delay_ms(),
        }
    }
}

fn default_credits_ttl_ms() -> u64 {
    60_000
}

fn default_stale_grace_ms() -> u64 {
    300_000
}

fn default_min_remaining() -> i64 {
    1
}

fn default_credits_cooldown_ms() -> u64 {
    300_000
}

fn default_refresh_lock_ms() -> u64 {
    15_000
}

fn default_refresh_timeout_ms() -> u64 {
    5_000
}

fn default_refresh_max_retries() -> u32 {
    3
}

fn default_refresh_retry_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TavilyConfig {
    /// Plaintext keys to import into the store at bootstrap.
    /// `None` = provider unconfigured; `Some([])` is a config error.
    #[serde(default)]
    pub api_keys: Option<Vec<String>>,

    /// Seed for the runtime-swappable key selection strategy.
    #[serde(default = "default_selection_strategy")]
    pub selection_strategy: String,

    /// Attempt budget for transient/quota failures in the rotating client.
    #[serde(default = "default_tavily_max_retries")]
    pub max_retries: u32,

    /// Cooldown applied on an explicit quota signal without a Retry-After.
    #[serde(default = "default_tavily_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_tavily_api_base")]
    pub api_base: String,

    #[serde(default = "default_tavily_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl Default for TavilyConfig {
    fn default() -> Self {
        Self {
            api_keys: None,
            selection_strategy: default_selection_strategy(),
            max_retries: default_tavily_max_retries(),
            cooldown_ms: default_tavily_cooldown_ms(),
            api_base: default_tavily_api_base(),
            http_timeout_ms: default_tavily_timeout_ms(),
        }
    }
}

fn default_tavily_timeout_ms() -> u64 {
    30_000
}

fn default_selection_strategy() -> String {
    "round_robin".to_string()
}

fn default_tavily_max_retries() -> u32 {
    2
}

fn default_tavily_cooldown_ms() -> u64 {
    60_000
}

fn default_tavily_api_base() -> String {
    "https://api.tavily.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraveConfig {
    /// `None` = provider unconfigured; `Some([])` is a config error.
    #[serde(default)]
    pub api_keys: Option<Vec<String>>,

    #[serde(default = "default_brave_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Requests per second; converted into a minimum inter-request interval
    /// unless `min_interval_ms` overrides it directly.
    #[serde(default = "default_brave_max_qps")]
    pub max_qps: u32,

    #[serde(default)]
    pub min_interval_ms: Option<u64>,

    /// Rate-gate wait budget for paced Brave calls.
    #[serde(default = "default_brave_max_queue_ms")]
    pub max_queue_ms: u64,

    #[serde(default)]
    pub overflow: BraveOverflowMode,

    #[serde(default = "default_brave_endpoint")]
    pub endpoint: String,
}

impl Default for BraveConfig {
    fn default() -> Self {
        Self {
            api_keys: None,
            http_timeout_ms: default_brave_timeout_ms(),
            max_qps: default_brave_max_qps(),
            min_interval_ms: None,
            max_queue_ms: default_brave_max_queue_ms(),
            overflow: BraveOverflowMode::default(),
            endpoint: default_brave_endpoint(),
        }
    }
}

impl BraveConfig {
    /// Effective minimum inter-request interval for the Brave rate gate.
    pub fn effective_min_interval_ms(&self) -> u64 {
        match self.min_interval_ms {
            Some(ms) => ms,
            None => 1000 / u64::from(self.max_qps.max(1)),
        }
    }
}

fn default_brave_timeout_ms() -> u64 {
    20_000
}

fn default_brave_max_qps() -> u32 {
    1
}

fn default_brave_max_queue_ms() -> u64 {
    30_000
}

fn default_brave_endpoint() -> String {
    "https://api.search.brave.com/res/v1/web/search".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogConfig {
    #[serde(default)]
    pub log_mode: UsageLogMode,

    /// Bernoulli sampling probability in [0, 1].
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// When set, query hashing switches from SHA-256 to HMAC-SHA256.
    #[serde(default)]
    pub hash_secret: Option<String>,

    #[serde(default)]
    pub retention_days: Option<u64>,

    /// Per-log probability of running retention cleanup.
    #[serde(default = "default_cleanup_probability")]
    pub cleanup_probability: f64,
}

impl Default for UsageLogConfig {
    fn default() -> Self {
        Self {
            log_mode: UsageLogMode::default(),
            sample_rate: default_sample_rate(),
            hash_secret: None,
            retention_days: None,
            cleanup_probability: default_cleanup_probability(),
        }
    }
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_cleanup_probability() -> f64 {
    0.001
}

/// How `brave_*` tool calls are routed across the two providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSourceMode {
    TavilyOnly,
    BraveOnly,
    Combined,
    #[default]
    BravePreferTavilyFallback,
}

impl SearchSourceMode {
    /// Case-insensitive, trimming parse. Unrecognized input yields `None`;
    /// callers fall back to the configured default.
    pub fn parse_loose(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "tavily_only" => Some(Self::TavilyOnly),
            "brave_only" => Some(Self::BraveOnly),
            "combined" => Some(Self::Combined),
            "brave_prefer_tavily_fallback" => Some(Self::BravePreferTavilyFallback),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TavilyOnly => "tavily_only",
            Self::BraveOnly => "brave_only",
            Self::Combined => "combined",
            Self::BravePreferTavilyFallback => "brave_prefer_tavily_fallback",
        }
    }
}

/// What happens when the Brave rate gate cannot grant a slot in budget, in
/// `brave_prefer_tavily_fallback` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BraveOverflowMode {
    /// Wait without a cap.
    Queue,
    /// Surface the gate timeout to the caller.
    Error,
    /// Call Provider-T instead.
    #[default]
    FallbackToTavily,
}

impl BraveOverflowMode {
    pub fn parse_loose(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "queue" => Some(Self::Queue),
            "error" => Some(Self::Error),
            "fallback_to_tavily" => Some(Self::FallbackToTavily),
            _ => None,
        }
    }
}

/// Query-metadata verbosity for usage rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLogMode {
    None,
    Hash,
    #[default]
    Preview,
    Full,
}

impl UsageLogMode {
    pub fn parse_loose(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "hash" => Some(Self::Hash),
            "preview" => Some(Self::Preview),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}
