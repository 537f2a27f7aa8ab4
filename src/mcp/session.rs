use dashmap::DashMap;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sessions idle past this window are evicted by the GC task.
const SESSION_IDLE_EXPIRE: Duration = Duration::from_secs(30 * 60);
const GC_INTERVAL: Duration = Duration::from_secs(60);

struct Session {
    /// Last-touch timestamp in microseconds relative to process start.
    last_seen: AtomicU64,
}

/// In-memory MCP session registry keyed by the `mcp-session-id` header.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh opaque session id.
    pub fn create(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        self.sessions.insert(
            id.clone(),
            Session {
                last_seen: AtomicU64::new(now_us()),
            },
        );
        metrics::gauge!("bridge_mcp_sessions_active").set(self.sessions.len() as f64);
        id
    }

    /// True when the id is known; refreshes its idle clock.
    pub fn touch(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(session) => {
                session.last_seen.store(now_us(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Spawn the idle-session sweeper. Call once after construction.
    pub fn start_gc(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                registry.evict_idle();
            }
        });
    }

    fn evict_idle(&self) {
        let now = now_us();
        let expire_us = SESSION_IDLE_EXPIRE.as_micros() as u64;
        self.sessions
            .retain(|_, s| now.saturating_sub(s.last_seen.load(Ordering::Relaxed)) < expire_us);
        metrics::gauge!("bridge_mcp_sessions_active").set(self.sessions.len() as f64);
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_touch() {
        let registry = SessionRegistry::new();
        let id = registry.create();
        assert_eq!(id.len(), 32);
        assert!(registry.touch(&id));
        assert!(!registry.touch("deadbeef"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.create();
        let b = registry.create();
        assert_ne!(a, b);
    }
}
