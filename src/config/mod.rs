pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl BridgeConfig {
    /// Build the runtime configuration in three layers: an optional config
    /// file, environment overrides on top, then validation. A missing file
    /// is not an error — env-only deployments (everything through
    /// `KEY_ENCRYPTION_SECRET`, `TAVILY_API_KEYS`, `BRAVE_*`, ...) are the
    /// common case for this bridge.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => parse_config_file(path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "config: no file at {}, starting from env and defaults",
                    path.display()
                );
                BridgeConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("config: bridge configuration ready");
        Ok(config)
    }

    /// Same layering as `load`, without touching the filesystem.
    pub fn from_env() -> Result<Self> {
        let mut config = BridgeConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides on top of whatever the file
    /// provided. Unparseable numeric values are ignored, not fatal.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KEY_ENCRYPTION_SECRET") {
            self.encryption.secret = v;
        }

        // Credit cache
        env_u64("CREDITS_TTL_MS", &mut self.credits.ttl_ms);
        env_u64("CREDITS_STALE_GRACE_MS", &mut self.credits.stale_grace_ms);
        if let Some(n) = env_parse::<i64>("CREDITS_MIN_REMAINING") {
            self.credits.min_remaining = n;
        }
        env_u64("CREDITS_COOLDOWN_MS", &mut self.credits.cooldown_ms);
        env_u64("CREDITS_REFRESH_LOCK_MS", &mut self.credits.refresh_lock_ms);
        env_u64(
            "CREDITS_REFRESH_TIMEOUT_MS",
            &mut self.credits.refresh_timeout_ms,
        );
        if let Some(n) = env_parse::<u32>("CREDITS_REFRESH_MAX_RETRIES") {
            self.credits.refresh_max_retries = n;
        }
        env_u64(
            "CREDITS_REFRESH_RETRY_DELAY_MS",
            &mut self.credits.refresh_retry_delay_ms,
        );

        // Tavily
        if let Ok(v) = std::env::var("TAVILY_API_KEYS") {
            self.tavily.api_keys = Some(split_csv(&v));
        }
        if let Ok(v) = std::env::var("TAVILY_KEY_SELECTION_STRATEGY") {
            self.tavily.selection_strategy = v;
        }
        if let Some(n) = env_parse::<u32>("MCP_MAX_RETRIES") {
            self.tavily.max_retries = n;
        }
        env_u64("MCP_COOLDOWN_MS", &mut self.tavily.cooldown_ms);
        if let Ok(v) = std::env::var("TAVILY_API_BASE") {
            self.tavily.api_base = v;
        }
        env_u64("TAVILY_HTTP_TIMEOUT_MS", &mut self.tavily.http_timeout_ms);

        // Brave
        if let Ok(v) = std::env::var("BRAVE_API_KEY") {
            self.brave.api_keys = Some(split_csv(&v));
        }
        env_u64("BRAVE_HTTP_TIMEOUT_MS", &mut self.brave.http_timeout_ms);
        if let Some(n) = env_parse::<u32>("BRAVE_MAX_QPS") {
            self.brave.max_qps = n;
        }
        if let Some(n) = env_parse::<u64>("BRAVE_MIN_INTERVAL_MS") {
            self.brave.min_interval_ms = Some(n);
        }
        env_u64("BRAVE_MAX_QUEUE_MS", &mut self.brave.max_queue_ms);
        if let Ok(v) = std::env::var("BRAVE_OVERFLOW") {
            if let Some(mode) = BraveOverflowMode::parse_loose(&v) {
                self.brave.overflow = mode;
            }
        }

        // Usage logging
        if let Ok(v) = std::env::var("BRAVE_USAGE_LOG_MODE") {
            // Unknown modes fall back to the default rather than erroring.
            self.usage.log_mode = UsageLogMode::parse_loose(&v).unwrap_or_default();
        }
        if let Ok(v) = std::env::var("BRAVE_USAGE_SAMPLE_RATE") {
            self.usage.sample_rate = parse_sample_rate(&v);
        }
        if let Ok(v) = std::env::var("BRAVE_USAGE_HASH_SECRET") {
            if !v.is_empty() {
                self.usage.hash_secret = Some(v);
            }
        }
        if let Some(n) = env_parse::<u64>("BRAVE_USAGE_RETENTION_DAYS") {
            self.usage.retention_days = Some(n);
        }
        if let Some(p) = env_parse::<f64>("BRAVE_USAGE_CLEANUP_PROBABILITY") {
            self.usage.cleanup_probability = p.clamp(0.0, 1.0);
        }

        if let Ok(v) = std::env::var("SEARCH_SOURCE_MODE") {
            if let Some(mode) = SearchSourceMode::parse_loose(&v) {
                self.search_source_mode = mode;
            }
        }

        if let Ok(v) = std::env::var("BRIDGE_CLIENT_TOKENS") {
            self.client_tokens = Some(split_csv(&v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.encryption.secret.is_empty() {
            anyhow::bail!("KEY_ENCRYPTION_SECRET is required");
        }
        crate::crypto::KeyCipher::from_secret(&self.encryption.secret)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        // A list that is present but empty is a misconfiguration; an absent
        // list just means the provider is not wired up.
        if matches!(&self.tavily.api_keys, Some(keys) if keys.is_empty()) {
            anyhow::bail!("tavily.api_keys is present but empty, provide at least one key");
        }
        if matches!(&self.brave.api_keys, Some(keys) if keys.is_empty()) {
            anyhow::bail!("brave.api_keys is present but empty, provide at least one key");
        }
        if matches!(&self.client_tokens, Some(tokens) if tokens.is_empty()) {
            anyhow::bail!("client_tokens is present but empty, provide at least one token");
        }

        if !(0.0..=1.0).contains(&self.usage.sample_rate) {
            anyhow::bail!("usage.sample_rate must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.usage.cleanup_probability) {
            anyhow::bail!("usage.cleanup_probability must be within [0, 1]");
        }
        if self.brave.max_qps == 0 && self.brave.min_interval_ms.is_none() {
            anyhow::bail!("brave.max_qps must be >= 1 unless min_interval_ms is set");
        }
        Ok(())
    }
}

/// The file format follows the extension; anything but `.toml`/`.json` is
/// rejected up front rather than sniffed.
fn parse_config_file(path: &Path, content: &str) -> Result<BridgeConfig> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str(content)?),
        Some("json") => Ok(serde_json::from_str(content)?),
        Some(ext) => anyhow::bail!(
            "cannot read {}: .{ext} is not a supported config format",
            path.display()
        ),
        None => anyhow::bail!(
            "cannot read {}: the config file needs a .toml or .json extension",
            path.display()
        ),
    }
}

/// Empty string maps to 1.0, out-of-range values clamp.
fn parse_sample_rate(raw: &str) -> f64 {
    if raw.trim().is_empty() {
        return 1.0;
    }
    match raw.trim().parse::<f64>() {
        Ok(v) if v <= 0.0 => 0.0,
        Ok(v) if v >= 1.0 => 1.0,
        Ok(v) => v,
        Err(_) => 1.0,
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_u64(name: &str, slot: &mut u64) {
    if let Some(n) = env_parse::<u64>(name) {
        *slot = n;
    }
}
