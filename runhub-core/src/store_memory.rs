use crate::events::RunEvent;
use crate::store::{RunPatch, RunStore};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct TickLease {
    holder: Uuid,
    expires_at: Timestamp,
}

struct Inner {
    runs: HashMap<Uuid, Run>,
    events: HashMap<Uuid, Vec<RunEvent>>,
    event_seq: HashMap<Uuid, u64>,
    logs: HashMap<Uuid, Vec<RunLog>>,
    hitl: HashMap<Uuid, HitlRequest>,
    runners: HashMap<Uuid, Runner>,
    queue: Vec<QueueEntry>,
    tick_lease: Option<TickLease>,
}

/// In-memory implementation of `RunStore` for tests and single-node
/// deployments without a database.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                runs: HashMap::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
                logs: HashMap::new(),
                hitl: HashMap::new(),
                runners: HashMap::new(),
                queue: Vec::new(),
                tick_lease: None,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a patch in place. Must mirror the Postgres UPDATE exactly.
fn apply_patch(run: &mut Run, patch: &RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(at) = patch.queued_at {
        run.queued_at = Some(at);
    }
    if let Some(at) = patch.leased_at {
        run.leased_at = Some(at);
    }
    if let Some(at) = patch.started_at {
        run.started_at = Some(at);
    }
    if let Some(at) = patch.completed_at {
        run.completed_at = Some(at);
    }
    if let Some(ms) = patch.queue_duration_ms {
        run.queue_duration_ms = Some(ms);
    }
    if let Some(runner_id) = patch.runner_id {
        run.runner_id = runner_id;
    }
    if let Some(ref inputs) = patch.inputs {
        run.inputs = inputs.clone();
    }
    if let Some(ref outputs) = patch.outputs {
        run.outputs = Some(outputs.clone());
    }
    if let Some(ref code) = patch.error_code {
        run.error_code = code.clone();
    }
    if let Some(ref message) = patch.error_message {
        run.error_message = message.clone();
    }
    if let Some(ref reason) = patch.cancel_reason {
        run.cancel_reason = Some(reason.clone());
    }
    if let Some(count) = patch.retry_count {
        run.retry_count = count;
    }
    if let Some(at) = patch.next_retry_at {
        run.next_retry_at = at;
    }
    if let Some(ref record) = patch.push_retry_record {
        run.retry_history.push(record.clone());
    }
    if let Some(hitl) = patch.active_hitl_id {
        run.active_hitl_id = hitl;
    }
}

fn page<T: Clone>(items: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> Page<T> {
    let total = items.len() as u64;
    let offset = offset.unwrap_or(0);
    let limit = limit.unwrap_or(100);
    let items = items.into_iter().skip(offset).take(limit).collect();
    Page { items, total }
}

#[async_trait]
impl RunStore for MemoryStore {
    // ── Runs ──

    async fn insert_run(&self, run: &Run) -> Result<()> {
        let mut w = self.inner.write().await;
        if w.runs.contains_key(&run.id) {
            return Err(anyhow!("run already exists: {}", run.id));
        }
        w.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<Run>> {
        let r = self.inner.read().await;
        Ok(r.runs.get(&id).cloned())
    }

    async fn conditional_update_run(
        &self,
        id: Uuid,
        where_status_in: &[RunStatus],
        patch: &RunPatch,
    ) -> Result<u64> {
        let mut w = self.inner.write().await;
        let Some(run) = w.runs.get_mut(&id) else {
            return Ok(0);
        };
        if !where_status_in.contains(&run.status) {
            return Ok(0);
        }
        apply_patch(run, patch);
        Ok(1)
    }

    async fn update_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("run not found: {id}"))?;
        let c = &mut run.counters;
        if let Some(v) = update.total_steps {
            c.total_steps = c.total_steps.max(v);
        }
        if let Some(v) = update.completed_steps {
            c.completed_steps = c.completed_steps.max(v);
        }
        if let Some(v) = update.failed_steps {
            c.failed_steps = c.failed_steps.max(v);
        }
        if let Some(v) = update.progress_pct {
            c.progress_pct = c.progress_pct.max(v.min(100));
        }
        if let Some(v) = update.memory_peak_mb {
            c.memory_peak_mb = c.memory_peak_mb.max(v);
        }
        if let Some(ref node) = update.current_node_id {
            c.current_node_id = Some(node.clone());
        }
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Page<Run>> {
        let r = self.inner.read().await;
        let mut runs: Vec<Run> = r
            .runs
            .values()
            .filter(|run| {
                filter.tenant_id.map_or(true, |t| run.tenant_id == t)
                    && filter.status.map_or(true, |s| run.status == s)
                    && filter.bot_id.map_or(true, |b| run.bot_id == b)
                    && filter
                        .parent_run_id
                        .map_or(true, |p| run.parent_run_id == Some(p))
                    && filter.runner_id.map_or(true, |x| run.runner_id == Some(x))
                    && filter
                        .tag
                        .as_ref()
                        .map_or(true, |tag| run.tags.iter().any(|t| t == tag))
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(runs, filter.limit, filter.offset))
    }

    async fn count_active_runs(&self, tenant_id: Uuid) -> Result<u64> {
        let r = self.inner.read().await;
        Ok(r.runs
            .values()
            .filter(|run| run.tenant_id == tenant_id && run.status.is_active())
            .count() as u64)
    }

    async fn count_runs_created_since(&self, tenant_id: Uuid, since: Timestamp) -> Result<u64> {
        let r = self.inner.read().await;
        Ok(r.runs
            .values()
            .filter(|run| run.tenant_id == tenant_id && run.created_at >= since)
            .count() as u64)
    }

    async fn list_children(&self, parent_run_id: Uuid) -> Result<Vec<Run>> {
        let r = self.inner.read().await;
        let mut children: Vec<Run> = r
            .runs
            .values()
            .filter(|run| run.parent_run_id == Some(parent_run_id))
            .cloned()
            .collect();
        children.sort_by_key(|run| run.created_at);
        Ok(children)
    }

    async fn count_children(&self, parent_run_id: Uuid) -> Result<u64> {
        let r = self.inner.read().await;
        Ok(r.runs
            .values()
            .filter(|run| run.parent_run_id == Some(parent_run_id))
            .count() as u64)
    }

    async fn list_timed_out(&self, now: Timestamp, limit: usize) -> Result<Vec<Run>> {
        let r = self.inner.read().await;
        let mut due: Vec<Run> = r
            .runs
            .values()
            .filter(|run| !run.status.is_terminal() && run.timeout_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|run| run.timeout_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_retry_due(&self, now: Timestamp, limit: usize) -> Result<Vec<Run>> {
        let r = self.inner.read().await;
        let mut due: Vec<Run> = r
            .runs
            .values()
            .filter(|run| {
                run.status == RunStatus::RetryScheduled
                    && run.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|run| run.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    // ── Events ──

    async fn append_event(&self, event: &RunEvent) -> Result<u64> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.entry(event.run_id).or_insert(0);
        *seq += 1;
        let current_seq = *seq;
        let mut stored = event.clone();
        stored.seq = current_seq;
        w.events.entry(event.run_id).or_default().push(stored);
        Ok(current_seq)
    }

    async fn list_events(&self, run_id: Uuid, filter: &EventFilter) -> Result<Page<RunEvent>> {
        let r = self.inner.read().await;
        let events: Vec<RunEvent> = r
            .events
            .get(&run_id)
            .map(|evts| {
                evts.iter()
                    .filter(|e| filter.after_seq.map_or(true, |s| e.seq > s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(page(events, filter.limit, filter.offset))
    }

    async fn count_events(&self, run_id: Uuid) -> Result<u64> {
        let r = self.inner.read().await;
        Ok(r.events.get(&run_id).map_or(0, |e| e.len() as u64))
    }

    // ── Logs ──

    async fn append_logs(&self, logs: &[RunLog]) -> Result<()> {
        let mut w = self.inner.write().await;
        for log in logs {
            w.logs.entry(log.run_id).or_default().push(log.clone());
        }
        Ok(())
    }

    async fn list_logs(&self, run_id: Uuid, filter: &LogFilter) -> Result<Page<RunLog>> {
        let r = self.inner.read().await;
        let logs: Vec<RunLog> = r
            .logs
            .get(&run_id)
            .map(|logs| {
                logs.iter()
                    .filter(|l| {
                        filter.min_level.map_or(true, |min| l.level >= min)
                            && filter
                                .step_id
                                .as_ref()
                                .map_or(true, |s| l.step_id.as_ref() == Some(s))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(page(logs, filter.limit, filter.offset))
    }

    // ── HITL ──

    async fn insert_hitl(&self, request: &HitlRequest) -> Result<()> {
        let mut w = self.inner.write().await;
        w.hitl.insert(request.id, request.clone());
        Ok(())
    }

    async fn load_hitl(&self, id: Uuid) -> Result<Option<HitlRequest>> {
        let r = self.inner.read().await;
        Ok(r.hitl.get(&id).cloned())
    }

    async fn resolve_hitl(&self, id: Uuid, resolution: &HitlResolution) -> Result<u64> {
        let mut w = self.inner.write().await;
        let Some(request) = w.hitl.get_mut(&id) else {
            return Ok(0);
        };
        if request.status != HitlStatus::Pending {
            return Ok(0);
        }
        request.status = resolution.status;
        request.action = resolution.action;
        request.resolved_by = Some(resolution.resolved_by.clone());
        request.resolved_at = Some(resolution.resolved_at);
        request.comments = resolution.comments.clone();
        request.modified_data = resolution.modified_data.clone();
        Ok(1)
    }

    async fn escalate_hitl(&self, id: Uuid, assigned_to: &str) -> Result<u64> {
        let mut w = self.inner.write().await;
        let Some(request) = w.hitl.get_mut(&id) else {
            return Ok(0);
        };
        if request.status != HitlStatus::Pending {
            return Ok(0);
        }
        request.assigned_to = Some(assigned_to.to_string());
        // Escalation clears the deadline so a stuck approver chain does not
        // loop through expiry forever.
        request.deadline = None;
        Ok(1)
    }

    async fn append_hitl_audit(&self, id: Uuid, entry: &HitlAuditEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        let request = w
            .hitl
            .get_mut(&id)
            .ok_or_else(|| anyhow!("hitl request not found: {id}"))?;
        request.audit_trail.push(entry.clone());
        Ok(())
    }

    async fn pending_hitl_for_run(&self, run_id: Uuid) -> Result<Option<HitlRequest>> {
        let r = self.inner.read().await;
        Ok(r.hitl
            .values()
            .find(|h| h.run_id == run_id && h.status == HitlStatus::Pending)
            .cloned())
    }

    async fn list_hitl(&self, filter: &HitlFilter) -> Result<Page<HitlRequest>> {
        let r = self.inner.read().await;
        let mut requests: Vec<HitlRequest> = r
            .hitl
            .values()
            .filter(|h| {
                filter.tenant_id.map_or(true, |t| h.tenant_id == t)
                    && filter.run_id.map_or(true, |rid| h.run_id == rid)
                    && filter.status.map_or(true, |s| h.status == s)
                    && filter
                        .assigned_to
                        .as_ref()
                        .map_or(true, |a| h.assigned_to.as_ref() == Some(a))
            })
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(requests, filter.limit, filter.offset))
    }

    async fn list_expired_hitl(&self, now: Timestamp, limit: usize) -> Result<Vec<HitlRequest>> {
        let r = self.inner.read().await;
        let mut expired: Vec<HitlRequest> = r
            .hitl
            .values()
            .filter(|h| {
                h.status == HitlStatus::Pending
                    && h.auto_expire
                    && h.deadline.is_some_and(|d| d <= now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|h| h.deadline);
        expired.truncate(limit);
        Ok(expired)
    }

    // ── Runners ──

    async fn insert_runner(&self, runner: &Runner) -> Result<()> {
        let mut w = self.inner.write().await;
        if w.runners
            .values()
            .any(|r| r.api_key_hash == runner.api_key_hash && r.id != runner.id)
        {
            return Err(anyhow!("api key hash collision"));
        }
        w.runners.insert(runner.id, runner.clone());
        Ok(())
    }

    async fn load_runner(&self, id: Uuid) -> Result<Option<Runner>> {
        let r = self.inner.read().await;
        Ok(r.runners.get(&id).cloned())
    }

    async fn find_runner_by_key_hash(&self, api_key_hash: &str) -> Result<Option<Runner>> {
        let r = self.inner.read().await;
        Ok(r.runners
            .values()
            .find(|runner| runner.api_key_hash == api_key_hash)
            .cloned())
    }

    async fn update_runner_status(&self, id: Uuid, status: RunnerStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        let runner = w
            .runners
            .get_mut(&id)
            .ok_or_else(|| anyhow!("runner not found: {id}"))?;
        runner.status = status;
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid, at: Timestamp) -> Result<()> {
        let mut w = self.inner.write().await;
        let runner = w
            .runners
            .get_mut(&id)
            .ok_or_else(|| anyhow!("runner not found: {id}"))?;
        runner.last_heartbeat_at = Some(at);
        Ok(())
    }

    async fn sweep_stale_runners(&self, cutoff: Timestamp, limit: usize) -> Result<Vec<Uuid>> {
        let mut w = self.inner.write().await;
        let mut swept = Vec::new();
        for runner in w.runners.values_mut() {
            if swept.len() >= limit {
                break;
            }
            let stale = runner
                .last_heartbeat_at
                .map_or(true, |hb| hb < cutoff);
            if runner.status == RunnerStatus::Online && stale {
                runner.status = RunnerStatus::Offline;
                swept.push(runner.id);
            }
        }
        Ok(swept)
    }

    async fn list_runners(&self, tenant_id: Uuid) -> Result<Vec<Runner>> {
        let r = self.inner.read().await;
        let mut runners: Vec<Runner> = r
            .runners
            .values()
            .filter(|runner| runner.tenant_id == tenant_id)
            .cloned()
            .collect();
        runners.sort_by_key(|runner| runner.registered_at);
        Ok(runners)
    }

    // ── Queue ──

    async fn queue_insert(&self, entry: &QueueEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        if w.queue.iter().any(|e| e.run_id == entry.run_id) {
            return Err(anyhow!("queue entry already exists: {}", entry.run_id));
        }
        w.queue.push(entry.clone());
        Ok(())
    }

    async fn queue_claim(
        &self,
        profile: &RunnerProfile,
        now: Timestamp,
    ) -> Result<Option<QueueEntry>> {
        let mut w = self.inner.write().await;
        let mut best: Option<usize> = None;
        for (idx, entry) in w.queue.iter().enumerate() {
            if entry.available_at > now
                || entry.tenant_id != profile.tenant_id
                || !entry.selector.matches(profile)
            {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let current = &w.queue[b];
                    (
                        entry.priority.rank(),
                        entry.available_at,
                        entry.enqueued_at,
                    ) < (
                        current.priority.rank(),
                        current.available_at,
                        current.enqueued_at,
                    )
                }
            };
            if better {
                best = Some(idx);
            }
        }
        Ok(best.map(|idx| w.queue.remove(idx)))
    }

    async fn queue_remove(&self, run_id: Uuid) -> Result<bool> {
        let mut w = self.inner.write().await;
        let before = w.queue.len();
        w.queue.retain(|e| e.run_id != run_id);
        Ok(w.queue.len() < before)
    }

    async fn queue_pinned_waiting(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let r = self.inner.read().await;
        let mut pinned: Vec<QueueEntry> = r
            .queue
            .iter()
            .filter(|e| e.selector.pinned_runner_id.is_some())
            .cloned()
            .collect();
        pinned.sort_by_key(|e| e.enqueued_at);
        pinned.truncate(limit);
        Ok(pinned)
    }

    // ── Tick leadership ──

    async fn acquire_tick_lease(&self, holder: Uuid, ttl_ms: i64, now: Timestamp) -> Result<bool> {
        let mut w = self.inner.write().await;
        match &w.tick_lease {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            _ => {
                w.tick_lease = Some(TickLease {
                    holder,
                    expires_at: now + ttl_ms,
                });
                Ok(true)
            }
        }
    }
}
