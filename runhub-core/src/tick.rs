use crate::bus::{BusEvent, EventBus, RUNNERS_TOPIC};
use crate::config::CoreConfig;
use crate::engine::LifecycleEngine;
use crate::error::CoreError;
use crate::events::EventKind;
use crate::external::PowerManager;
use crate::store::RunStore;
use crate::types::{now_ms, RunnerStatus, Timestamp};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one tick accomplished; useful for logs and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub retries_promoted: usize,
    pub runs_timed_out: usize,
    pub hitl_expired: usize,
    pub runners_marked_offline: usize,
    pub pinned_wakes: usize,
}

/// Single-leader periodic driver for every time-based transition: retry
/// promotion, timeout enforcement, approval expiry, stale-runner sweeps and
/// pinned-runner wake-ups. Leadership is a store-side row lease with TTL, so
/// exactly one orchestrator instance runs the passes while the rest idle.
pub struct SchedulerTick {
    store: Arc<dyn RunStore>,
    engine: Arc<LifecycleEngine>,
    bus: Arc<EventBus>,
    power: Arc<dyn PowerManager>,
    config: CoreConfig,
    holder: Uuid,
}

impl SchedulerTick {
    pub fn new(
        store: Arc<dyn RunStore>,
        engine: Arc<LifecycleEngine>,
        bus: Arc<EventBus>,
        power: Arc<dyn PowerManager>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            engine,
            bus,
            power,
            config,
            holder: Uuid::now_v7(),
        }
    }

    /// Run every pass once, in spec order. Each pass is bounded by
    /// `tick_batch_size`; leftovers carry to the next tick.
    pub async fn run_once(&self, now: Timestamp) -> Result<TickReport> {
        let mut report = TickReport::default();
        let limit = self.config.tick_batch_size;

        // 1. Retry promotion.
        for run in self.store.list_retry_due(now, limit).await? {
            match self.engine.promote_retry(&run).await {
                Ok(()) => report.retries_promoted += 1,
                Err(err) => warn!(run_id = %run.id, error = %err, "retry promotion failed"),
            }
        }

        // 2. Timeout sweep.
        for run in self.store.list_timed_out(now, limit).await? {
            match self.engine.timeout(run.id).await {
                Ok(()) => report.runs_timed_out += 1,
                Err(CoreError::NotFound(_)) => {}
                Err(err) => warn!(run_id = %run.id, error = %err, "timeout sweep failed"),
            }
        }

        // 3. HITL expiry.
        for request in self.store.list_expired_hitl(now, limit).await? {
            match self.engine.expire_hitl(&request).await {
                Ok(()) => report.hitl_expired += 1,
                Err(err) => {
                    warn!(request_id = %request.id, error = %err, "approval expiry failed");
                }
            }
        }

        // 4. Stale runner sweep. Session-level orphaning is the gateway's
        // job; this pass covers runners whose gateway instance died with
        // them.
        let cutoff = now - (self.config.runner_stale_seconds as i64) * 1000;
        let swept = self.store.sweep_stale_runners(cutoff, limit).await?;
        for runner_id in &swept {
            self.bus.publish(
                RUNNERS_TOPIC,
                BusEvent::new(
                    RUNNERS_TOPIC,
                    EventKind::RunnerOffline.as_str(),
                    json!({ "runnerId": runner_id, "reason": "heartbeat expired" }),
                ),
            );
        }
        report.runners_marked_offline = swept.len();

        // 5. Pinned-runner wake: queued work pinned to an offline runner
        // triggers the external power-on hook; the entry stays queued until
        // the runner comes back or the run times out.
        for entry in self.store.queue_pinned_waiting(limit).await? {
            let Some(pinned) = entry.selector.pinned_runner_id else {
                continue;
            };
            let Some(runner) = self.store.load_runner(pinned).await? else {
                continue;
            };
            if runner.status != RunnerStatus::Offline || runner.vm_config.is_none() {
                continue;
            }
            match self.power.wake(&runner).await {
                Ok(()) => {
                    report.pinned_wakes += 1;
                    debug!(runner_id = %runner.id, run_id = %entry.run_id, "power-on requested");
                }
                Err(err) => warn!(runner_id = %runner.id, error = %format!("{err:#}"), "power-on failed"),
            }
        }

        Ok(report)
    }

    /// Spawn the periodic loop. Only the lease holder executes passes; other
    /// instances keep trying to take over in case the leader dies.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.tick_interval_seconds.max(1));
        let ttl_ms = (self.config.tick_lease_ttl_seconds as i64) * 1000;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = now_ms();
                let is_leader = match self.store.acquire_tick_lease(self.holder, ttl_ms, now).await
                {
                    Ok(leader) => leader,
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "tick lease acquisition failed");
                        continue;
                    }
                };
                if !is_leader {
                    continue;
                }
                match self.run_once(now).await {
                    Ok(report) => {
                        if report != TickReport::default() {
                            info!(
                                retries = report.retries_promoted,
                                timeouts = report.runs_timed_out,
                                hitl = report.hitl_expired,
                                stale_runners = report.runners_marked_offline,
                                wakes = report.pinned_wakes,
                                "tick"
                            );
                        }
                    }
                    Err(err) => warn!(error = %format!("{err:#}"), "tick pass failed"),
                }
            }
        })
    }
}
