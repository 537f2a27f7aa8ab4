use crate::error::BridgeError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Per-provider FIFO pacer enforcing a minimum inter-request interval.
///
/// Admission rides on `tokio::sync::Mutex`, which queues waiters fairly, so
/// grant order equals arrival order without a hand-rolled waiter list. The
/// pacing sleep happens while holding the lock; the wrapped work runs after
/// release, so consecutive grants may overlap in execution but never start
/// closer than `min_interval` apart. A waiter dropped mid-queue (request
/// cancellation) simply leaves the mutex queue without stalling the rest.
pub struct RateGate {
    provider: &'static str,
    min_interval: Duration,
    inner: Mutex<GateInner>,
}

struct GateInner {
    last_grant: Option<Instant>,
}

impl RateGate {
    pub fn new(provider: &'static str, min_interval: Duration) -> Self {
        Self {
            provider,
            min_interval,
            inner: Mutex::new(GateInner { last_grant: None }),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Run `work` no earlier than `min_interval` after the previous grant.
    ///
    /// With a budget, the call fails with `RateGateTimeout` when the slot
    /// cannot be granted within `max_wait` of enqueue — before `work` is
    /// invoked. Without a budget the waiter queues indefinitely.
    pub async fn run<F, Fut, T>(&self, max_wait: Option<Duration>, work: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.min_interval.is_zero() {
            return Ok(work().await);
        }

        let enqueued = Instant::now();
        let mut inner = match max_wait {
            Some(budget) => match tokio::time::timeout(budget, self.inner.lock()).await {
                Ok(guard) => guard,
                Err(_) => return Err(self.timeout_error(budget)),
            },
            None => self.inner.lock().await,
        };

        let now = Instant::now();
        let earliest = inner
            .last_grant
            .map(|g| g + self.min_interval)
            .unwrap_or(now);
        let pace = earliest.saturating_duration_since(now);

        if let Some(budget) = max_wait {
            if enqueued.elapsed() + pace > budget {
                // Reject without reserving the slot; the next waiter in the
                // mutex queue sees an unchanged last_grant.
                return Err(self.timeout_error(budget));
            }
        }

        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
        inner.last_grant = Some(Instant::now());
        drop(inner);

        metrics::counter!(
            "bridge_rate_gate_granted_total",
            "provider" => self.provider,
        )
        .increment(1);
        metrics::histogram!(
            "bridge_rate_gate_wait_seconds",
            "provider" => self.provider,
        )
        .record(enqueued.elapsed().as_secs_f64());

        Ok(work().await)
    }

    fn timeout_error(&self, budget: Duration) -> BridgeError {
        metrics::counter!(
            "bridge_rate_gate_timeout_total",
            "provider" => self.provider,
        )
        .increment(1);
        BridgeError::RateGateTimeout {
            max_wait_ms: budget.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_grants_are_paced_by_min_interval() {
        let gate = RateGate::new("test", Duration::from_millis(100));
        let mut grants = Vec::new();
        for _ in 0..4 {
            gate.run(None, || async {}).await.unwrap();
            grants.push(Instant::now());
        }
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_grant_order() {
        let gate = Arc::new(RateGate::new("test", Duration::from_millis(50)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gate.run(None, || async move {
                    order.lock().await.push(i);
                })
                .await
                .unwrap();
            }));
            // Let task i reach the gate before spawning i+1.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_before_work_runs() {
        let gate = RateGate::new("test", Duration::from_millis(1000));
        gate.run(None, || async {}).await.unwrap();

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let err = gate
            .run(Some(Duration::from_millis(10)), || async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::RateGateTimeout { max_wait_ms: 10 }));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_waiter_does_not_consume_slot() {
        let gate = RateGate::new("test", Duration::from_millis(1000));
        gate.run(None, || async {}).await.unwrap();
        let before = Instant::now();

        assert!(gate
            .run(Some(Duration::from_millis(5)), || async {})
            .await
            .is_err());

        // The rejected waiter must not have pushed the schedule out: the
        // next unbounded call still starts one interval after grant #1.
        gate.run(None, || async {}).await.unwrap();
        assert!(Instant::now() - before <= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_zero_interval_admits_immediately() {
        let gate = RateGate::new("test", Duration::ZERO);
        let out = gate.run(Some(Duration::ZERO), || async { 42 }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_stall_queue() {
        let gate = Arc::new(RateGate::new("test", Duration::from_millis(100)));
        gate.run(None, || async {}).await.unwrap();

        let queued = gate.clone();
        let handle = tokio::spawn(async move { queued.run(None, || async {}).await });
        tokio::task::yield_now().await;
        handle.abort();

        let out = gate.run(None, || async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }
}
