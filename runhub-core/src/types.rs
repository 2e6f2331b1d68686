use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Maximum parent→child nesting depth for runs.
pub const MAX_RUN_DEPTH: u16 = 10;

// ─── Priority ─────────────────────────────────────────────────

/// Queue priority. Lower number wins: Critical beats High beats Normal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Deferred,
}

impl Priority {
    /// Numeric rank used for queue ordering (1 = most urgent).
    pub fn rank(self) -> i16 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
            Priority::Deferred => 5,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            1 => Some(Priority::Critical),
            2 => Some(Priority::High),
            3 => Some(Priority::Normal),
            4 => Some(Priority::Low),
            5 => Some(Priority::Deferred),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

// ─── Run status (the state machine) ───────────────────────────

/// Lifecycle status of a run. Transitions are owned by the lifecycle engine;
/// `may_transition` is the single source of truth for legality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Queued,
    Leased,
    Running,
    WaitingApproval,
    Paused,
    RetryScheduled,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    Rejected,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::TimedOut
                | RunStatus::Rejected
        )
    }

    /// Active = consuming a concurrency-quota slot.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Statuses from which a runner-reported result may be applied.
    pub fn completable() -> &'static [RunStatus] {
        &[RunStatus::Leased, RunStatus::Running, RunStatus::WaitingApproval]
    }

    /// All non-terminal statuses (cancel / timeout source set).
    pub fn non_terminal() -> &'static [RunStatus] {
        &[
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Leased,
            RunStatus::Running,
            RunStatus::WaitingApproval,
            RunStatus::Paused,
            RunStatus::RetryScheduled,
        ]
    }

    /// Wire/database name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Queued => "QUEUED",
            RunStatus::Leased => "LEASED",
            RunStatus::Running => "RUNNING",
            RunStatus::WaitingApproval => "WAITING_APPROVAL",
            RunStatus::Paused => "PAUSED",
            RunStatus::RetryScheduled => "RETRY_SCHEDULED",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::TimedOut => "TIMED_OUT",
            RunStatus::Rejected => "REJECTED",
        }
    }

    /// Legal transition table. Cancel and timeout are legal from every
    /// non-terminal state; everything else is enumerated explicitly.
    pub fn may_transition(from: RunStatus, to: RunStatus) -> bool {
        use RunStatus::*;
        if from.is_terminal() {
            return false;
        }
        if matches!(to, Cancelled | TimedOut) {
            return true;
        }
        matches!(
            (from, to),
            (Pending, Queued)
                | (Queued, Leased)
                | (Leased, Running)
                | (Leased, RetryScheduled)
                | (Leased, Succeeded)
                | (Leased, Failed)
                | (Running, WaitingApproval)
                | (Running, Paused)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, RetryScheduled)
                | (Paused, Running)
                | (WaitingApproval, Running)
                | (WaitingApproval, Rejected)
                | (WaitingApproval, Failed)
                | (WaitingApproval, Succeeded)
                | (WaitingApproval, RetryScheduled)
                | (RetryScheduled, Queued)
        )
    }
}

// ─── Trigger / actor context ──────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Manual,
    Schedule,
    Webhook,
    Api,
    Parent,
}

impl Default for TriggerType {
    fn default() -> Self {
        TriggerType::Manual
    }
}

/// Tenant/actor context stamped on every request by the external auth
/// middleware. The core trusts it but still filters reads by tenant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub actor_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl RequestContext {
    pub fn new(tenant_id: Uuid, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            actor_id: actor_id.into(),
            scopes: Vec::new(),
        }
    }
}

// ─── Retry policy ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_seconds: u32,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_seconds: 10,
            backoff_multiplier: 2.0,
            max_delay_seconds: 300,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `min(base × multiplier^attempt, cap)`, in seconds.
    pub fn delay_seconds(&self, attempt: u32) -> u64 {
        let base = self.retry_delay_seconds as f64;
        let raw = base * self.backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_seconds as f64);
        capped.max(0.0) as u64
    }
}

/// One entry in a run's retry history.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub attempt: u32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub scheduled_at: Timestamp,
    pub next_retry_at: Timestamp,
}

// ─── HITL ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HitlConfig {
    /// Reject the run outright when a pending request expires; otherwise the
    /// request escalates and the run keeps waiting.
    pub auto_reject_on_expiry: bool,
    pub escalation_target: Option<String>,
    pub default_deadline_minutes: Option<u32>,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            auto_reject_on_expiry: false,
            escalation_target: None,
            default_deadline_minutes: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitlStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    Escalated,
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitlAction {
    Approve,
    Reject,
    Modify,
    Escalate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlAuditEntry {
    pub at: Timestamp,
    pub actor: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub step_id: Option<String>,
    pub node_id: Option<String>,
    pub status: HitlStatus,
    pub title: String,
    pub message: Option<String>,
    pub allowed_actions: Vec<HitlAction>,
    pub data_modification_allowed: bool,
    pub assigned_to: Option<String>,
    pub approver_ids: Vec<String>,
    pub deadline: Option<Timestamp>,
    pub auto_expire: bool,
    pub action: Option<HitlAction>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<Timestamp>,
    pub comments: Option<String>,
    pub modified_data: Option<Value>,
    pub audit_trail: Vec<HitlAuditEntry>,
    pub created_at: Timestamp,
}

/// Outcome applied to a pending request by `RunStore::resolve_hitl`.
#[derive(Clone, Debug)]
pub struct HitlResolution {
    pub status: HitlStatus,
    pub action: Option<HitlAction>,
    pub resolved_by: String,
    pub resolved_at: Timestamp,
    pub comments: Option<String>,
    pub modified_data: Option<Value>,
}

// ─── Selector & runner matching ───────────────────────────────

/// What a queued run requires of a runner. A pinned runner id bypasses
/// label/capability matching entirely.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Selector {
    pub labels: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
    pub pinned_runner_id: Option<Uuid>,
}

impl Selector {
    pub fn matches(&self, profile: &RunnerProfile) -> bool {
        if let Some(pinned) = self.pinned_runner_id {
            return pinned == profile.runner_id;
        }
        let labels_ok = self
            .labels
            .iter()
            .all(|(k, v)| profile.labels.get(k) == Some(v));
        let caps_ok = self
            .capabilities
            .iter()
            .all(|c| profile.capabilities.iter().any(|pc| pc == c));
        labels_ok && caps_ok
    }
}

/// Matching-relevant snapshot of a connected runner, handed to the queue when
/// claiming work.
#[derive(Clone, Debug)]
pub struct RunnerProfile {
    pub runner_id: Uuid,
    pub tenant_id: Uuid,
    pub labels: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
}

// ─── Runner entity ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    Online,
    Busy,
    Offline,
    Draining,
    Maintenance,
}

/// Capabilities a runner advertises during the session handshake.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerCapabilities {
    pub os: String,
    pub has_display: bool,
    pub max_concurrent_jobs: u32,
    pub installed_software: Vec<String>,
    pub engine_version: String,
    /// Capability tags matched against `Selector::capabilities`
    /// (e.g. `web.browser`, `desktop.automation`).
    pub tags: Vec<String>,
}

/// Power-on metadata for runners hosted on wake-able machines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub mac_address: String,
    pub broadcast_address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runner {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
    pub status: RunnerStatus,
    pub capabilities: RunnerCapabilities,
    pub labels: BTreeMap<String, String>,
    pub max_concurrent_jobs: u32,
    pub last_heartbeat_at: Option<Timestamp>,
    pub vm_config: Option<VmConfig>,
    pub registered_at: Timestamp,
}

impl Runner {
    pub fn profile(&self) -> RunnerProfile {
        RunnerProfile {
            runner_id: self.id,
            tenant_id: self.tenant_id,
            labels: self.labels.clone(),
            capabilities: self.capabilities.tags.clone(),
        }
    }
}

// ─── Queue entry ──────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub priority: Priority,
    pub enqueued_at: Timestamp,
    /// Delivery gate: claims never return entries with `available_at` in the
    /// future (delayed retries).
    pub available_at: Timestamp,
    pub selector: Selector,
}

// ─── Run counters / progress ──────────────────────────────────

/// Monotone execution counters. The store enforces monotonicity: an update
/// never decreases a counter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunCounters {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub progress_pct: u8,
    pub memory_peak_mb: u32,
    pub current_node_id: Option<String>,
}

/// Delta applied by `RunStore::update_progress`.
#[derive(Clone, Debug, Default)]
pub struct ProgressUpdate {
    pub total_steps: Option<u32>,
    pub completed_steps: Option<u32>,
    pub failed_steps: Option<u32>,
    pub progress_pct: Option<u8>,
    pub memory_peak_mb: Option<u32>,
    pub current_node_id: Option<String>,
}

// ─── Run entity ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub bot_id: Uuid,
    pub bot_version_id: Uuid,
    /// Hex digest identifying the exact compiled plan being executed.
    pub plan_hash: String,
    pub status: RunStatus,
    pub priority: Priority,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub parent_run_id: Option<Uuid>,
    /// Id of the depth-0 ancestor; equals `id` for top-level runs.
    pub root_run_id: Uuid,
    pub depth: u16,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub runner_id: Option<Uuid>,
    pub selector: Selector,
    pub timeout_seconds: u32,
    pub timeout_at: Timestamp,
    pub retry: RetryPolicy,
    pub retry_count: u32,
    pub next_retry_at: Option<Timestamp>,
    pub retry_history: Vec<RetryRecord>,
    pub created_at: Timestamp,
    pub queued_at: Option<Timestamp>,
    pub leased_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub queue_duration_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub cancel_reason: Option<String>,
    pub hitl_config: Option<HitlConfig>,
    /// Id of the currently-pending approval request, iff WAITING_APPROVAL.
    pub active_hitl_id: Option<Uuid>,
    pub requires_approval: bool,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub counters: RunCounters,
}

/// Client-supplied request to create a run.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSpec {
    pub bot_id: Uuid,
    pub bot_version_id: Option<Uuid>,
    pub inputs: Value,
    pub priority: Option<Priority>,
    pub trigger_type: Option<TriggerType>,
    pub parent_run_id: Option<Uuid>,
    pub timeout_seconds: Option<u32>,
    pub retry: Option<RetryPolicy>,
    pub hitl_config: Option<HitlConfig>,
    pub requires_approval: bool,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub pinned_runner_id: Option<Uuid>,
}

/// Run plus the roll-up counts a detail fetch includes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub child_count: u64,
    pub event_count: u64,
}

// ─── Runner-reported results ──────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
    Cancelled,
}

/// Error detail attached to a failed step or run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub node_id: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

/// Terminal report for one execution attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: ResultStatus,
    pub started_at: Option<Timestamp>,
    pub completed_at: Timestamp,
    pub duration_ms: i64,
    pub steps_executed: u32,
    pub steps_failed: u32,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
}

// ─── Logs ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub level: LogLevel,
    pub source: Option<String>,
    pub step_id: Option<String>,
    pub message: String,
    pub data: Option<Value>,
    pub timestamp: Timestamp,
}

// ─── Paging & filters ─────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunFilter {
    pub tenant_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub bot_id: Option<Uuid>,
    pub parent_run_id: Option<Uuid>,
    pub runner_id: Option<Uuid>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilter {
    pub after_seq: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogFilter {
    pub min_level: Option<LogLevel>,
    pub step_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HitlFilter {
    pub tenant_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub status: Option<HitlStatus>,
    pub assigned_to: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_all_transitions() {
        for from in [
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::TimedOut,
            RunStatus::Rejected,
        ] {
            for to in [RunStatus::Queued, RunStatus::Running, RunStatus::Cancelled] {
                assert!(!RunStatus::may_transition(from, to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn cancel_and_timeout_legal_from_any_non_terminal() {
        for from in RunStatus::non_terminal() {
            assert!(RunStatus::may_transition(*from, RunStatus::Cancelled));
            assert!(RunStatus::may_transition(*from, RunStatus::TimedOut));
        }
    }

    #[test]
    fn happy_path_is_legal() {
        let path = [
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Leased,
            RunStatus::Running,
            RunStatus::Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(RunStatus::may_transition(pair[0], pair[1]));
        }
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_delay_seconds: 10,
            backoff_multiplier: 2.0,
            max_delay_seconds: 60,
        };
        assert_eq!(policy.delay_seconds(0), 10);
        assert_eq!(policy.delay_seconds(1), 20);
        assert_eq!(policy.delay_seconds(2), 40);
        assert_eq!(policy.delay_seconds(3), 60);
        assert_eq!(policy.delay_seconds(10), 60);
    }

    #[test]
    fn pinned_selector_bypasses_label_match() {
        let runner_id = Uuid::now_v7();
        let profile = RunnerProfile {
            runner_id,
            tenant_id: Uuid::now_v7(),
            labels: BTreeMap::new(),
            capabilities: vec![],
        };
        let selector = Selector {
            labels: BTreeMap::from([("zone".to_string(), "eu".to_string())]),
            capabilities: vec!["web.browser".to_string()],
            pinned_runner_id: Some(runner_id),
        };
        assert!(selector.matches(&profile));
    }

    #[test]
    fn selector_requires_label_and_capability_subsets() {
        let profile = RunnerProfile {
            runner_id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            labels: BTreeMap::from([
                ("zone".to_string(), "eu".to_string()),
                ("tier".to_string(), "gold".to_string()),
            ]),
            capabilities: vec!["web.browser".to_string(), "desktop.automation".to_string()],
        };

        let ok = Selector {
            labels: BTreeMap::from([("zone".to_string(), "eu".to_string())]),
            capabilities: vec!["web.browser".to_string()],
            pinned_runner_id: None,
        };
        assert!(ok.matches(&profile));

        let missing_cap = Selector {
            labels: BTreeMap::new(),
            capabilities: vec!["ocr".to_string()],
            pinned_runner_id: None,
        };
        assert!(!missing_cap.matches(&profile));

        let wrong_label = Selector {
            labels: BTreeMap::from([("zone".to_string(), "us".to_string())]),
            capabilities: vec![],
            pinned_runner_id: None,
        };
        assert!(!wrong_label.matches(&profile));
    }
}
