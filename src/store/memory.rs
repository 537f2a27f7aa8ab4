use super::{
    ClientTokenRecord, Provider, Store, StoreResult, UpstreamKeyRecord, UsageRecord,
};
use crate::error::BridgeError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::Mutex;

/// In-memory store backing the binaries by default and every test.
///
/// DashMap gives atomic per-id updates; usage rows live behind a mutex since
/// they are append-only and off the request critical path.
#[derive(Default)]
pub struct MemoryStore {
    keys: DashMap<String, UpstreamKeyRecord>,
    tokens: DashMap<String, ClientTokenRecord>,
    usage: Mutex<Vec<UsageRecord>>,
    /// key id → (lock token, lease expiry ms).
    refresh_locks: DashMap<String, (String, u64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of usage rows currently retained. Test/diagnostic helper.
    pub async fn usage_len(&self) -> usize {
        self.usage.lock().await.len()
    }

    pub async fn usage_rows(&self) -> Vec<UsageRecord> {
        self.usage.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_key(&self, record: UpstreamKeyRecord) -> StoreResult<()> {
        self.keys.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_key(&self, id: &str) -> StoreResult<Option<UpstreamKeyRecord>> {
        Ok(self.keys.get(id).map(|r| r.value().clone()))
    }

    async fn update_key(&self, record: &UpstreamKeyRecord) -> StoreResult<()> {
        match self.keys.get_mut(&record.id) {
            Some(mut entry) => {
                *entry.value_mut() = record.clone();
                Ok(())
            }
            None => Err(BridgeError::Internal(format!(
                "update of unknown key id {}",
                record.id
            ))),
        }
    }

    async fn list_eligible_keys(
        &self,
        provider: Provider,
        now_ms: u64,
        limit: usize,
    ) -> StoreResult<Vec<UpstreamKeyRecord>> {
        let mut rows: Vec<UpstreamKeyRecord> = self
            .keys
            .iter()
            .filter(|r| r.value().provider == provider && r.value().is_eligible(now_ms))
            .map(|r| r.value().clone())
            .collect();
        // Never-used keys sort first so fresh imports get exercised.
        rows.sort_by_key(|r| (r.last_used_at_ms.unwrap_or(0), r.created_at_ms));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_keys(&self, provider: Provider) -> StoreResult<usize> {
        Ok(self
            .keys
            .iter()
            .filter(|r| r.value().provider == provider)
            .count())
    }

    async fn insert_token(&self, record: ClientTokenRecord) -> StoreResult<()> {
        self.tokens.insert(record.prefix.clone(), record);
        Ok(())
    }

    async fn find_token_by_prefix(
        &self,
        prefix: &str,
    ) -> StoreResult<Option<ClientTokenRecord>> {
        Ok(self.tokens.get(prefix).map(|r| r.value().clone()))
    }

    async fn insert_usage(&self, row: UsageRecord) -> StoreResult<()> {
        self.usage.lock().await.push(row);
        Ok(())
    }

    async fn delete_usage_before(&self, cutoff_ms: u64) -> StoreResult<u64> {
        let mut rows = self.usage.lock().await;
        let before = rows.len();
        rows.retain(|r| r.timestamp_ms >= cutoff_ms);
        Ok((before - rows.len()) as u64)
    }

    async fn try_acquire_credits_refresh_lock(
        &self,
        key_id: &str,
        ttl_ms: u64,
    ) -> StoreResult<Option<String>> {
        let now = super::unix_ms();
        let token = lock_token();
        match self.refresh_locks.entry(key_id.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().1 <= now {
                    // Expired lease: steal it.
                    held.insert((token.clone(), now + ttl_ms));
                    Ok(Some(token))
                } else {
                    Ok(None)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((token.clone(), now + ttl_ms));
                Ok(Some(token))
            }
        }
    }

    async fn release_credits_refresh_lock(&self, key_id: &str, token: &str) -> StoreResult<()> {
        if let Entry::Occupied(held) = self.refresh_locks.entry(key_id.to_string()) {
            if held.get().0 == token {
                held.remove();
            }
        }
        Ok(())
    }
}

fn lock_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{unix_ms, KeyStatus, UsageOutcome};

    fn key(id: &str, provider: Provider, last_used: Option<u64>, created: u64) -> UpstreamKeyRecord {
        let mut rec = UpstreamKeyRecord::new(id.into(), provider, "sealed".into(), created);
        rec.last_used_at_ms = last_used;
        rec
    }

    #[tokio::test]
    async fn test_eligible_ordering_and_limit() {
        let store = MemoryStore::new();
        store.insert_key(key("a", Provider::Tavily, Some(300), 1)).await.unwrap();
        store.insert_key(key("b", Provider::Tavily, Some(100), 2)).await.unwrap();
        store.insert_key(key("c", Provider::Tavily, None, 3)).await.unwrap();
        store.insert_key(key("d", Provider::Brave, Some(1), 4)).await.unwrap();

        let rows = store
            .list_eligible_keys(Provider::Tavily, unix_ms(), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);

        let rows = store
            .list_eligible_keys(Provider::Tavily, unix_ms(), 2)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_eligibility_filters_invalid_and_cooling() {
        let store = MemoryStore::new();
        let now = unix_ms();

        let mut bad = key("bad", Provider::Tavily, None, 1);
        bad.status = KeyStatus::Invalid;
        store.insert_key(bad).await.unwrap();

        let mut cooling = key("cooling", Provider::Tavily, None, 2);
        cooling.status = KeyStatus::Cooldown;
        cooling.cooldown_until_ms = Some(now + 60_000);
        store.insert_key(cooling).await.unwrap();

        let mut lapsed = key("lapsed", Provider::Tavily, None, 3);
        lapsed.status = KeyStatus::Cooldown;
        lapsed.cooldown_until_ms = Some(now.saturating_sub(1));
        store.insert_key(lapsed).await.unwrap();

        let rows = store.list_eligible_keys(Provider::Tavily, now, 10).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["lapsed"]);
    }

    #[tokio::test]
    async fn test_update_unknown_key_fails() {
        let store = MemoryStore::new();
        let rec = key("ghost", Provider::Brave, None, 1);
        assert!(store.update_key(&rec).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_lock_contention_and_expiry() {
        let store = MemoryStore::new();
        let t1 = store
            .try_acquire_credits_refresh_lock("k1", 60_000)
            .await
            .unwrap();
        assert!(t1.is_some());
        // Second holder misses while the lease is live.
        assert!(store
            .try_acquire_credits_refresh_lock("k1", 60_000)
            .await
            .unwrap()
            .is_none());

        // Release with a stale token is a no-op; real token frees the lease.
        store.release_credits_refresh_lock("k1", "stale").await.unwrap();
        assert!(store
            .try_acquire_credits_refresh_lock("k1", 60_000)
            .await
            .unwrap()
            .is_none());
        store
            .release_credits_refresh_lock("k1", &t1.unwrap())
            .await
            .unwrap();
        assert!(store
            .try_acquire_credits_refresh_lock("k1", 60_000)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_lease_is_stealable() {
        let store = MemoryStore::new();
        assert!(store
            .try_acquire_credits_refresh_lock("k", 0)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .try_acquire_credits_refresh_lock("k", 60_000)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_usage_retention_delete() {
        let store = MemoryStore::new();
        for ts in [100u64, 200, 300] {
            store
                .insert_usage(UsageRecord {
                    tool_name: "tavily_search".into(),
                    outcome: UsageOutcome::Success,
                    latency_ms: 5,
                    client_token_id: "t1".into(),
                    client_token_prefix: "mcp_abc".into(),
                    upstream_key_id: None,
                    query_hash: None,
                    query_preview: None,
                    args_json: "{}".into(),
                    error_message: None,
                    timestamp_ms: ts,
                })
                .await
                .unwrap();
        }
        let removed = store.delete_usage_before(250).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.usage_len().await, 1);
    }
}
