use crate::events::RunEvent;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Partial update applied by `conditional_update_run`. Double-`Option` fields
/// distinguish "leave unchanged" (outer `None`) from "set to NULL" (inner
/// `None`).
#[derive(Clone, Debug, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub queued_at: Option<Timestamp>,
    pub leased_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub queue_duration_ms: Option<i64>,
    pub runner_id: Option<Option<Uuid>>,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub error_code: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub cancel_reason: Option<String>,
    pub retry_count: Option<u32>,
    pub next_retry_at: Option<Option<Timestamp>>,
    pub push_retry_record: Option<RetryRecord>,
    pub active_hitl_id: Option<Option<Uuid>>,
}

impl RunPatch {
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn queued_at(mut self, at: Timestamp) -> Self {
        self.queued_at = Some(at);
        self
    }
    pub fn leased_at(mut self, at: Timestamp) -> Self {
        self.leased_at = Some(at);
        self
    }
    pub fn started_at(mut self, at: Timestamp) -> Self {
        self.started_at = Some(at);
        self
    }
    pub fn completed_at(mut self, at: Timestamp) -> Self {
        self.completed_at = Some(at);
        self
    }
    pub fn queue_duration_ms(mut self, ms: i64) -> Self {
        self.queue_duration_ms = Some(ms);
        self
    }
    pub fn runner(mut self, runner_id: Option<Uuid>) -> Self {
        self.runner_id = Some(runner_id);
        self
    }
    pub fn inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }
    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }
    pub fn error(mut self, code: Option<String>, message: Option<String>) -> Self {
        self.error_code = Some(code);
        self.error_message = Some(message);
        self
    }
    pub fn cancel_reason(mut self, reason: String) -> Self {
        self.cancel_reason = Some(reason);
        self
    }
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }
    pub fn next_retry_at(mut self, at: Option<Timestamp>) -> Self {
        self.next_retry_at = Some(at);
        self
    }
    pub fn push_retry_record(mut self, record: RetryRecord) -> Self {
        self.push_retry_record = Some(record);
        self
    }
    pub fn active_hitl(mut self, id: Option<Uuid>) -> Self {
        self.active_hitl_id = Some(id);
        self
    }
}

/// Persistence trait for all orchestrator state.
///
/// The engine, queue, gateway and tick operate exclusively through this
/// trait, enabling pluggable backends (MemoryStore by default, Postgres for
/// production). `conditional_update_run` is the serialization point for run
/// state: a transition only lands if the run's current status is in the
/// expected set, and the returned row count tells the caller whether it won.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Runs ──

    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, id: Uuid) -> Result<Option<Run>>;

    /// Apply `patch` iff the run's current status is in `where_status_in`.
    /// Returns the number of rows affected (0 or 1).
    async fn conditional_update_run(
        &self,
        id: Uuid,
        where_status_in: &[RunStatus],
        patch: &RunPatch,
    ) -> Result<u64>;

    /// Monotone counter update: stored counters never decrease.
    async fn update_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<()>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Page<Run>>;
    async fn count_active_runs(&self, tenant_id: Uuid) -> Result<u64>;
    async fn count_runs_created_since(&self, tenant_id: Uuid, since: Timestamp) -> Result<u64>;
    async fn list_children(&self, parent_run_id: Uuid) -> Result<Vec<Run>>;
    async fn count_children(&self, parent_run_id: Uuid) -> Result<u64>;

    /// Non-terminal runs whose `timeout_at` has passed.
    async fn list_timed_out(&self, now: Timestamp, limit: usize) -> Result<Vec<Run>>;
    /// RETRY_SCHEDULED runs whose `next_retry_at` has passed.
    async fn list_retry_due(&self, now: Timestamp, limit: usize) -> Result<Vec<Run>>;

    // ── Events (append-only) ──

    /// Append an event; returns its per-run sequence number.
    async fn append_event(&self, event: &RunEvent) -> Result<u64>;
    async fn list_events(&self, run_id: Uuid, filter: &EventFilter) -> Result<Page<RunEvent>>;
    async fn count_events(&self, run_id: Uuid) -> Result<u64>;

    // ── Logs (append-only) ──

    async fn append_logs(&self, logs: &[RunLog]) -> Result<()>;
    async fn list_logs(&self, run_id: Uuid, filter: &LogFilter) -> Result<Page<RunLog>>;

    // ── HITL ──

    async fn insert_hitl(&self, request: &HitlRequest) -> Result<()>;
    async fn load_hitl(&self, id: Uuid) -> Result<Option<HitlRequest>>;

    /// Apply `resolution` iff the request is still PENDING. Returns rows
    /// affected (0 or 1).
    async fn resolve_hitl(&self, id: Uuid, resolution: &HitlResolution) -> Result<u64>;

    /// Reassign a PENDING request (escalation). Returns rows affected.
    async fn escalate_hitl(&self, id: Uuid, assigned_to: &str) -> Result<u64>;

    async fn append_hitl_audit(&self, id: Uuid, entry: &HitlAuditEntry) -> Result<()>;
    async fn pending_hitl_for_run(&self, run_id: Uuid) -> Result<Option<HitlRequest>>;
    async fn list_hitl(&self, filter: &HitlFilter) -> Result<Page<HitlRequest>>;
    /// PENDING auto-expire requests whose deadline has passed.
    async fn list_expired_hitl(&self, now: Timestamp, limit: usize) -> Result<Vec<HitlRequest>>;

    // ── Runners ──

    async fn insert_runner(&self, runner: &Runner) -> Result<()>;
    async fn load_runner(&self, id: Uuid) -> Result<Option<Runner>>;
    async fn find_runner_by_key_hash(&self, api_key_hash: &str) -> Result<Option<Runner>>;
    async fn update_runner_status(&self, id: Uuid, status: RunnerStatus) -> Result<()>;
    async fn record_heartbeat(&self, id: Uuid, at: Timestamp) -> Result<()>;
    /// Mark ONLINE runners with a heartbeat older than `cutoff` as OFFLINE.
    /// Returns the ids swept.
    async fn sweep_stale_runners(&self, cutoff: Timestamp, limit: usize) -> Result<Vec<Uuid>>;
    async fn list_runners(&self, tenant_id: Uuid) -> Result<Vec<Runner>>;

    // ── Queue ──

    async fn queue_insert(&self, entry: &QueueEntry) -> Result<()>;

    /// Atomically remove and return the best matching entry for `profile`:
    /// ordered by (priority, available_at, enqueued_at), gated on
    /// `available_at <= now`, tenant equality and selector match. No
    /// in-flight state — leasing lives on the run.
    async fn queue_claim(&self, profile: &RunnerProfile, now: Timestamp)
        -> Result<Option<QueueEntry>>;

    /// Idempotent removal (cancellation path). Returns whether a row existed.
    async fn queue_remove(&self, run_id: Uuid) -> Result<bool>;

    /// Entries targeting a pinned runner, oldest first (power-on sweep).
    async fn queue_pinned_waiting(&self, limit: usize) -> Result<Vec<QueueEntry>>;

    // ── Tick leadership ──

    /// Take or refresh the single-leader lease. Returns true when `holder`
    /// owns the lease after the call.
    async fn acquire_tick_lease(&self, holder: Uuid, ttl_ms: i64, now: Timestamp) -> Result<bool>;
}
