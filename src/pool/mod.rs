pub mod strategy;

pub use strategy::SelectionStrategy;

use crate::config::CreditsConfig;
use crate::credits::{CreditSnapshot, CreditsApi, FetchOptions};
use crate::crypto::KeyCipher;
use crate::error::BridgeError;
use crate::store::{unix_ms, KeyStatus, Provider, Store, UpstreamKeyRecord};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Candidate window loaded per selection pass.
const SELECT_WINDOW: usize = 10;

/// Retry-after surfaced when a forced preflight refresh fails outright.
const PREFLIGHT_RETRY_MS: u64 = 10_000;

/// Preflight verdict before dispatching provider traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Preflight {
    Ok,
    /// No key rows exist for the provider at all → 503.
    NoKeys,
    /// Refresh confirmed the pool is out of credits → 429.
    QuotaExhausted { retry_after_ms: u64 },
    /// Refresh could not complete → 503 with a short retry hint.
    Unavailable { retry_after_ms: u64 },
}

/// A selected, decrypted key ready for one upstream call.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: String,
    pub api_key: String,
}

/// Credit-aware, cooldown-driven selector over a provider's key set.
///
/// Selection is serialized by an in-process mutex so concurrent requests do
/// not race on the same stalest candidate; credit refreshes are additionally
/// serialized per key across the whole deployment by the store's advisory
/// lease.
pub struct KeyPool {
    provider: Provider,
    store: Arc<dyn Store>,
    credits: Arc<dyn CreditsApi>,
    cipher: KeyCipher,
    cfg: CreditsConfig,
    strategy: ArcSwap<SelectionStrategy>,
    select_mu: Mutex<()>,
}

impl KeyPool {
    pub fn new(
        provider: Provider,
        store: Arc<dyn Store>,
        credits: Arc<dyn CreditsApi>,
        cipher: KeyCipher,
        cfg: CreditsConfig,
        strategy: SelectionStrategy,
    ) -> Self {
        Self {
            provider,
            store,
            credits,
            cipher,
            cfg,
            strategy: ArcSwap::new(Arc::new(strategy)),
            select_mu: Mutex::new(()),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn strategy(&self) -> SelectionStrategy {
        **self.strategy.load()
    }

    /// Swap the selection strategy at runtime (admin plane hook).
    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        info!(
            "pool: strategy changed, provider={}, strategy={}",
            self.provider.as_str(),
            strategy.as_str()
        );
        self.strategy.store(Arc::new(strategy));
    }

    /// Cheap availability probe: ok iff some eligible key has fresh credits
    /// above the floor, otherwise force-refresh the stalest candidate and
    /// judge on the result.
    pub async fn preflight(&self) -> Preflight {
        let now = unix_ms();
        let candidates = match self
            .store
            .list_eligible_keys(self.provider, now, SELECT_WINDOW)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("pool: preflight list failed, error={}", e);
                return Preflight::Unavailable {
                    retry_after_ms: PREFLIGHT_RETRY_MS,
                };
            }
        };

        let floor = self.cfg.min_remaining as f64;
        if candidates
            .iter()
            .any(|k| k.credits.is_fresh(now) && k.credits.remaining.unwrap_or(0.0) > floor)
        {
            return Preflight::Ok;
        }

        // Stalest first thanks to the store ordering.
        let Some(stalest) = candidates.into_iter().next() else {
            return Preflight::NoKeys;
        };

        match self.refresh_credits(&stalest, now, true).await {
            Ok(refreshed) => {
                if refreshed.credits.remaining.unwrap_or(0.0) > floor {
                    Preflight::Ok
                } else {
                    Preflight::QuotaExhausted {
                        retry_after_ms: self.cfg.cooldown_ms,
                    }
                }
            }
            Err(e) => {
                debug!("pool: preflight refresh failed, error={}", e);
                Preflight::Unavailable {
                    retry_after_ms: PREFLIGHT_RETRY_MS,
                }
            }
        }
    }

    /// Select an eligible key with usable credits, bump its `last_used_at`,
    /// and hand back the decrypted material. Returns `None` when every
    /// candidate is exhausted or unusable.
    pub async fn select_key(&self) -> Result<Option<SelectedKey>, BridgeError> {
        let _serialized = self.select_mu.lock().await;

        let now = unix_ms();
        let mut candidates = self
            .store
            .list_eligible_keys(self.provider, now, SELECT_WINDOW)
            .await?;
        self.strategy.load().apply(&mut candidates);

        let floor = self.cfg.min_remaining as f64;
        for candidate in candidates {
            let refreshed = match self.refresh_credits(&candidate, now, false).await {
                Ok(rec) => rec,
                Err(e) => {
                    debug!(
                        "pool: refresh failed, key={}, error={}; trying next candidate",
                        candidate.id, e
                    );
                    continue;
                }
            };

            match refreshed.credits.remaining {
                Some(r) if r.is_finite() && r <= floor => {
                    // The refresh path cools exhausted keys down itself, but
                    // a fresh-cache fast path can land here too.
                    self.mark_cooldown(&refreshed.id, now + self.cfg.cooldown_ms)
                        .await
                        .ok();
                    continue;
                }
                Some(r) if r.is_finite() && r > 0.0 => {
                    let mut rec = refreshed;
                    rec.last_used_at_ms = Some(now);
                    if rec.status == KeyStatus::Cooldown
                        && rec.cooldown_until_ms.is_none_or(|until| until <= now)
                    {
                        rec.status = KeyStatus::Active;
                        rec.cooldown_until_ms = None;
                    }
                    self.store.update_key(&rec).await?;
                    let api_key = self.cipher.decrypt(&rec.encrypted_key)?;
                    metrics::counter!(
                        "bridge_pool_key_selected_total",
                        "provider" => self.provider.as_str(),
                    )
                    .increment(1);
                    return Ok(Some(SelectedKey {
                        id: rec.id,
                        api_key,
                    }));
                }
                _ => continue,
            }
        }

        metrics::counter!(
            "bridge_pool_no_eligible_key_total",
            "provider" => self.provider.as_str(),
        )
        .increment(1);
        Ok(None)
    }

    /// Refresh a key's credit cache.
    ///
    /// `force = false` trusts a live TTL. On a refresh-lock miss the stale
    /// -grace rule applies: a snapshot checked within `stale_grace_ms` and
    /// above the floor is trusted as-is. The lock is released on every exit
    /// path; release failures are swallowed.
    pub async fn refresh_credits(
        &self,
        record: &UpstreamKeyRecord,
        now_ms: u64,
        force: bool,
    ) -> Result<UpstreamKeyRecord, BridgeError> {
        if !force && record.credits.is_fresh(now_ms) {
            return Ok(record.clone());
        }

        let lock_token = self
            .store
            .try_acquire_credits_refresh_lock(&record.id, self.cfg.refresh_lock_ms)
            .await?;

        let Some(lock_token) = lock_token else {
            // Someone else is refreshing this key right now.
            let checked_recently = record
                .credits
                .checked_at_ms
                .is_some_and(|at| now_ms.saturating_sub(at) <= self.cfg.stale_grace_ms);
            let above_floor = record
                .credits
                .remaining
                .is_some_and(|r| r > self.cfg.min_remaining as f64);
            if checked_recently && above_floor {
                debug!(
                    "pool: refresh lock miss, trusting stale snapshot, key={}",
                    record.id
                );
                return Ok(record.clone());
            }
            return Err(BridgeError::Transient("credits refresh lock held".into()));
        };

        let result = self.refresh_locked(record, now_ms).await;

        if let Err(e) = self
            .store
            .release_credits_refresh_lock(&record.id, &lock_token)
            .await
        {
            debug!("pool: lock release failed, key={}, error={}", record.id, e);
        }

        result
    }

    /// The lock-holding refresh body: fetch, persist, classify.
    async fn refresh_locked(
        &self,
        record: &UpstreamKeyRecord,
        now_ms: u64,
    ) -> Result<UpstreamKeyRecord, BridgeError> {
        let api_key = self.cipher.decrypt(&record.encrypted_key)?;
        let opts = FetchOptions {
            timeout: Duration::from_millis(self.cfg.refresh_timeout_ms),
            max_retries: self.cfg.refresh_max_retries,
            retry_delay: Duration::from_millis(self.cfg.refresh_retry_delay_ms),
        };

        match self.credits.fetch_credits(&api_key, &opts).await {
            Ok(snapshot) => {
                let mut rec = record.clone();
                apply_snapshot(&mut rec.credits, &snapshot);
                rec.credits.checked_at_ms = Some(now_ms);
                rec.credits.expires_at_ms = Some(now_ms + self.cfg.ttl_ms.max(1));

                let floor = self.cfg.min_remaining as f64;
                match rec.credits.remaining {
                    Some(r) if r.is_finite() && r <= floor => {
                        rec.status = KeyStatus::Cooldown;
                        rec.cooldown_until_ms = Some(now_ms + self.cfg.cooldown_ms);
                        info!(
                            "pool: key exhausted, cooling down, key={}, remaining={}",
                            rec.id, r
                        );
                    }
                    _ => {
                        if rec.status == KeyStatus::Cooldown
                            && rec.cooldown_until_ms.is_none_or(|until| until <= now_ms)
                        {
                            rec.status = KeyStatus::Active;
                            rec.cooldown_until_ms = None;
                        }
                    }
                }
                self.store.update_key(&rec).await?;
                metrics::counter!(
                    "bridge_pool_credits_refresh_total",
                    "provider" => self.provider.as_str(),
                    "outcome" => "ok",
                )
                .increment(1);
                Ok(rec)
            }
            Err(BridgeError::InvalidKey) => {
                warn!("pool: key rejected upstream, invalidating, key={}", record.id);
                self.mark_invalid(&record.id).await.ok();
                metrics::counter!(
                    "bridge_pool_credits_refresh_total",
                    "provider" => self.provider.as_str(),
                    "outcome" => "invalid_key",
                )
                .increment(1);
                Err(BridgeError::InvalidKey)
            }
            Err(BridgeError::QuotaExceeded) => {
                self.mark_cooldown(&record.id, now_ms + self.cfg.cooldown_ms)
                    .await
                    .ok();
                metrics::counter!(
                    "bridge_pool_credits_refresh_total",
                    "provider" => self.provider.as_str(),
                    "outcome" => "quota",
                )
                .increment(1);
                Err(BridgeError::QuotaExceeded)
            }
            Err(e) => {
                metrics::counter!(
                    "bridge_pool_credits_refresh_total",
                    "provider" => self.provider.as_str(),
                    "outcome" => "error",
                )
                .increment(1);
                Err(e)
            }
        }
    }

    /// Timed exclusion from the selection set.
    pub async fn mark_cooldown(&self, id: &str, until_ms: u64) -> Result<(), BridgeError> {
        let Some(mut rec) = self.store.get_key(id).await? else {
            return Ok(());
        };
        rec.status = KeyStatus::Cooldown;
        rec.cooldown_until_ms = Some(until_ms);
        self.store.update_key(&rec).await
    }

    /// Terminal invalidation; only an external reset brings the key back.
    pub async fn mark_invalid(&self, id: &str) -> Result<(), BridgeError> {
        let Some(mut rec) = self.store.get_key(id).await? else {
            return Ok(());
        };
        rec.status = KeyStatus::Invalid;
        rec.cooldown_until_ms = None;
        self.store.update_key(&rec).await
    }

    /// Idempotent re-activation once a cooldown has lapsed.
    pub async fn mark_active_if_cooldown_expired(&self, id: &str) -> Result<(), BridgeError> {
        let Some(mut rec) = self.store.get_key(id).await? else {
            return Ok(());
        };
        if rec.status == KeyStatus::Cooldown
            && rec.cooldown_until_ms.is_none_or(|until| until <= unix_ms())
        {
            rec.status = KeyStatus::Active;
            rec.cooldown_until_ms = None;
            self.store.update_key(&rec).await?;
        }
        Ok(())
    }
}

fn apply_snapshot(state: &mut crate::store::CreditState, snapshot: &CreditSnapshot) {
    state.remaining = snapshot.remaining;
    state.key_usage = snapshot.key_usage;
    state.key_limit = snapshot.key_limit;
    state.plan_usage = snapshot.plan_usage;
    state.plan_limit = snapshot.plan_limit;
    state.paygo_usage = snapshot.paygo_usage;
    state.paygo_limit = snapshot.paygo_limit;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// Scripted credits API: pops canned results, counts calls.
    struct FakeCredits {
        responses: AsyncMutex<Vec<Result<CreditSnapshot, BridgeError>>>,
        calls: AtomicUsize,
    }

    impl FakeCredits {
        fn new(responses: Vec<Result<CreditSnapshot, BridgeError>>) -> Self {
            Self {
                responses: AsyncMutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CreditsApi for FakeCredits {
        async fn fetch_credits(
            &self,
            _api_key: &str,
            _opts: &FetchOptions,
        ) -> Result<CreditSnapshot, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut q = self.responses.lock().await;
            if q.is_empty() {
                return Err(BridgeError::Transient("fake exhausted".into()));
            }
            q.remove(0)
        }
    }

    fn snapshot(remaining: f64) -> CreditSnapshot {
        CreditSnapshot {
            remaining: Some(remaining),
            ..CreditSnapshot::default()
        }
    }

    fn cipher() -> KeyCipher {
        KeyCipher::from_secret(&"k".repeat(32)).unwrap()
    }

    async fn seed_key(
        store: &MemoryStore,
        cipher: &KeyCipher,
        id: &str,
        created_ms: u64,
    ) -> UpstreamKeyRecord {
        let rec = UpstreamKeyRecord::new(
            id.to_string(),
            Provider::Tavily,
            cipher.encrypt(&format!("tvly-{id}")).unwrap(),
            created_ms,
        );
        store.insert_key(rec.clone()).await.unwrap();
        rec
    }

    fn pool(store: Arc<MemoryStore>, credits: Arc<FakeCredits>) -> KeyPool {
        KeyPool::new(
            Provider::Tavily,
            store,
            credits,
            cipher(),
            CreditsConfig::default(),
            SelectionStrategy::RoundRobin,
        )
    }

    #[tokio::test]
    async fn test_select_returns_decrypted_key_and_bumps_last_used() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![Ok(snapshot(500.0))]));
        seed_key(&store, &cipher(), "k1", 1).await;

        let pool = pool(store.clone(), credits);
        let selected = pool.select_key().await.unwrap().unwrap();
        assert_eq!(selected.id, "k1");
        assert_eq!(selected.api_key, "tvly-k1");

        let stored = store.get_key("k1").await.unwrap().unwrap();
        assert!(stored.last_used_at_ms.is_some());
        assert!(stored.credits.is_fresh(unix_ms()));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_remote_fetch() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![Ok(snapshot(500.0))]));
        seed_key(&store, &cipher(), "k1", 1).await;

        let pool = pool(store.clone(), credits.clone());
        for _ in 0..5 {
            let selected = pool.select_key().await.unwrap().unwrap();
            assert_eq!(selected.id, "k1");
        }
        // One remote call seeded the cache; the rest rode the TTL.
        assert_eq!(credits.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_key_cools_down_and_next_is_tried() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![
            Ok(snapshot(0.0)),
            Ok(snapshot(100.0)),
        ]));
        seed_key(&store, &cipher(), "k1", 1).await;
        seed_key(&store, &cipher(), "k2", 2).await;

        let pool = pool(store.clone(), credits);
        let selected = pool.select_key().await.unwrap().unwrap();
        assert_eq!(selected.id, "k2");

        let cooled = store.get_key("k1").await.unwrap().unwrap();
        assert_eq!(cooled.status, KeyStatus::Cooldown);
        assert!(cooled.cooldown_until_ms.unwrap() > unix_ms());
    }

    #[tokio::test]
    async fn test_invalid_key_is_never_selected_again() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![
            Err(BridgeError::InvalidKey),
            Ok(snapshot(100.0)),
        ]));
        seed_key(&store, &cipher(), "k1", 1).await;
        seed_key(&store, &cipher(), "k2", 2).await;

        let pool = pool(store.clone(), credits);
        let selected = pool.select_key().await.unwrap().unwrap();
        assert_eq!(selected.id, "k2");

        let invalid = store.get_key("k1").await.unwrap().unwrap();
        assert_eq!(invalid.status, KeyStatus::Invalid);

        // k1 stays out of every later window.
        let eligible = store
            .list_eligible_keys(Provider::Tavily, unix_ms(), 10)
            .await
            .unwrap();
        assert!(eligible.iter().all(|k| k.id != "k1"));
    }

    #[tokio::test]
    async fn test_select_none_when_all_candidates_fail() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![
            Err(BridgeError::Transient("down".into())),
            Err(BridgeError::Transient("down".into())),
        ]));
        seed_key(&store, &cipher(), "k1", 1).await;
        seed_key(&store, &cipher(), "k2", 2).await;

        let pool = pool(store, credits);
        assert!(pool.select_key().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preflight_no_keys() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![]));
        let pool = pool(store, credits);
        assert_eq!(pool.preflight().await, Preflight::NoKeys);
    }

    #[tokio::test]
    async fn test_preflight_quota_exhaustion_maps_to_retry_after() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![Ok(snapshot(0.0))]));
        seed_key(&store, &cipher(), "k1", 1).await;

        let pool = pool(store, credits);
        assert_eq!(
            pool.preflight().await,
            Preflight::QuotaExhausted {
                retry_after_ms: 300_000
            }
        );
    }

    #[tokio::test]
    async fn test_preflight_refresh_failure_maps_to_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![Err(BridgeError::Transient(
            "down".into(),
        ))]));
        seed_key(&store, &cipher(), "k1", 1).await;

        let pool = pool(store, credits);
        assert_eq!(
            pool.preflight().await,
            Preflight::Unavailable {
                retry_after_ms: 10_000
            }
        );
    }

    #[tokio::test]
    async fn test_preflight_fresh_credits_short_circuit() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![]));
        let cipher = cipher();
        let mut rec = seed_key(&store, &cipher, "k1", 1).await;
        rec.credits.remaining = Some(100.0);
        rec.credits.checked_at_ms = Some(unix_ms());
        rec.credits.expires_at_ms = Some(unix_ms() + 60_000);
        store.update_key(&rec).await.unwrap();

        let pool = pool(store, credits.clone());
        assert_eq!(pool.preflight().await, Preflight::Ok);
        assert_eq!(credits.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_grace_applies_on_lock_miss() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![]));
        let cipher_ = cipher();
        let now = unix_ms();

        let mut rec = seed_key(&store, &cipher_, "k1", 1).await;
        // Expired TTL, but checked recently and above the floor.
        rec.credits.remaining = Some(50.0);
        rec.credits.checked_at_ms = Some(now.saturating_sub(10_000));
        rec.credits.expires_at_ms = Some(now.saturating_sub(1));
        store.update_key(&rec).await.unwrap();

        // Simulate another holder on the refresh lease.
        store
            .try_acquire_credits_refresh_lock("k1", 60_000)
            .await
            .unwrap()
            .unwrap();

        let pool = pool(store.clone(), credits.clone());
        let out = pool.refresh_credits(&rec, now, false).await.unwrap();
        assert_eq!(out.credits.remaining, Some(50.0));
        assert_eq!(credits.calls(), 0);

        // Below the floor the stale snapshot is not trusted.
        let mut broke = out.clone();
        broke.credits.remaining = Some(0.5);
        store.update_key(&broke).await.unwrap();
        assert!(pool.refresh_credits(&broke, now, false).await.is_err());
    }

    #[tokio::test]
    async fn test_cooldown_cleared_on_selection_after_expiry() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![Ok(snapshot(10.0))]));
        let cipher_ = cipher();
        let now = unix_ms();

        let mut rec = seed_key(&store, &cipher_, "k1", 1).await;
        rec.status = KeyStatus::Cooldown;
        rec.cooldown_until_ms = Some(now.saturating_sub(5_000));
        store.update_key(&rec).await.unwrap();

        let pool = pool(store.clone(), credits);
        let selected = pool.select_key().await.unwrap().unwrap();
        assert_eq!(selected.id, "k1");

        let stored = store.get_key("k1").await.unwrap().unwrap();
        assert_eq!(stored.status, KeyStatus::Active);
        assert_eq!(stored.cooldown_until_ms, None);
    }

    #[tokio::test]
    async fn test_mark_active_if_cooldown_expired_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let credits = Arc::new(FakeCredits::new(vec![]));
        let cipher_ = cipher();
        let now = unix_ms();

        let mut rec = seed_key(&store, &cipher_, "k1", 1).await;
        rec.status = KeyStatus::Cooldown;
        rec.cooldown_until_ms = Some(now.saturating_sub(1));
        store.update_key(&rec).await.unwrap();

        let pool = pool(store.clone(), credits);
        pool.mark_active_if_cooldown_expired("k1").await.unwrap();
        pool.mark_active_if_cooldown_expired("k1").await.unwrap();

        let stored = store.get_key("k1").await.unwrap().unwrap();
        assert_eq!(stored.status, KeyStatus::Active);

        // A live cooldown is left alone.
        let mut rec = stored;
        rec.status = KeyStatus::Cooldown;
        rec.cooldown_until_ms = Some(unix_ms() + 60_000);
        store.update_key(&rec).await.unwrap();
        pool.mark_active_if_cooldown_expired("k1").await.unwrap();
        assert_eq!(
            store.get_key("k1").await.unwrap().unwrap().status,
            KeyStatus::Cooldown
        );
    }
}
