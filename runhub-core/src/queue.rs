use crate::store::RunStore;
use crate::types::{QueueEntry, RunnerProfile, Timestamp};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Tenant-aware priority queue of runs awaiting a runner.
///
/// Persistence and ordering live in the store (`queue_claim` is atomic:
/// delete-and-return in one transaction, no in-flight state). This wrapper
/// adds the wake signal the dispatcher parks on — `Notify` gives the
/// non-blocking, at-most-one-coalescing semantics the assignment loop wants:
/// a burst of enqueues while the dispatcher is busy collapses into a single
/// pending wake.
pub struct RunQueue {
    store: Arc<dyn RunStore>,
    signal: Notify,
}

impl RunQueue {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            signal: Notify::new(),
        }
    }

    pub async fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        self.store.queue_insert(entry).await?;
        self.signal.notify_one();
        Ok(())
    }

    /// Claim the best available entry for a runner, or `None`.
    pub async fn claim(&self, profile: &RunnerProfile, now: Timestamp) -> Result<Option<QueueEntry>> {
        self.store.queue_claim(profile, now).await
    }

    /// Idempotent removal; used by cancellation.
    pub async fn remove(&self, run_id: Uuid) -> Result<bool> {
        self.store.queue_remove(run_id).await
    }

    /// Park until work may be available. Spurious wakes are fine — the
    /// dispatcher re-claims and finds nothing.
    pub async fn notified(&self) {
        self.signal.notified().await;
    }

    /// Wake the dispatcher without enqueuing (retry promotion, capacity
    /// freed). A wake with no one parked leaves a single stored permit.
    pub fn kick(&self) {
        self.signal.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::{now_ms, Priority, Selector};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn entry(tenant: Uuid, priority: Priority, available_at: i64) -> QueueEntry {
        QueueEntry {
            run_id: Uuid::now_v7(),
            tenant_id: tenant,
            priority,
            enqueued_at: now_ms(),
            available_at,
            selector: Selector::default(),
        }
    }

    #[tokio::test]
    async fn enqueue_wakes_a_parked_dispatcher() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(RunQueue::new(store));
        let tenant = Uuid::now_v7();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.notified().await;
            })
        };
        // Give the waiter a chance to park.
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue
            .enqueue(&entry(tenant, Priority::Normal, now_ms()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("dispatcher was not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn claim_respects_selector_through_store() {
        let store = Arc::new(MemoryStore::new());
        let queue = RunQueue::new(store);
        let tenant = Uuid::now_v7();

        let mut gated = entry(tenant, Priority::Normal, now_ms());
        gated.selector = Selector {
            labels: BTreeMap::new(),
            capabilities: vec!["desktop.automation".to_string()],
            pinned_runner_id: None,
        };
        queue.enqueue(&gated).await.unwrap();

        let browser_only = RunnerProfile {
            runner_id: Uuid::now_v7(),
            tenant_id: tenant,
            labels: BTreeMap::new(),
            capabilities: vec!["web.browser".to_string()],
        };
        assert!(queue.claim(&browser_only, now_ms()).await.unwrap().is_none());

        let desktop = RunnerProfile {
            runner_id: Uuid::now_v7(),
            tenant_id: tenant,
            labels: BTreeMap::new(),
            capabilities: vec!["desktop.automation".to_string()],
        };
        let claimed = queue.claim(&desktop, now_ms()).await.unwrap().unwrap();
        assert_eq!(claimed.run_id, gated.run_id);
    }
}
