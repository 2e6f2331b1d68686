use crate::types::{Timestamp, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kinds of timeline entries — the durable audit trail for every run, plus
/// the runner presence events published on the `runners` topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    RunQueued,
    RunLeased,
    RunStarted,
    StepStart,
    StepEnd,
    StepError,
    HitlRequested,
    HitlApproved,
    HitlRejected,
    HitlEscalated,
    HitlExpired,
    RunCompleted,
    RunFailed,
    RunTimedOut,
    RunCancelled,
    RunPaused,
    RunResumed,
    RetryScheduled,
    RunnerOnline,
    RunnerOffline,
}

impl EventKind {
    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RunQueued => "RUN_QUEUED",
            EventKind::RunLeased => "RUN_LEASED",
            EventKind::RunStarted => "RUN_STARTED",
            EventKind::StepStart => "STEP_START",
            EventKind::StepEnd => "STEP_END",
            EventKind::StepError => "STEP_ERROR",
            EventKind::HitlRequested => "HITL_REQUESTED",
            EventKind::HitlApproved => "HITL_APPROVED",
            EventKind::HitlRejected => "HITL_REJECTED",
            EventKind::HitlEscalated => "HITL_ESCALATED",
            EventKind::HitlExpired => "HITL_EXPIRED",
            EventKind::RunCompleted => "RUN_COMPLETED",
            EventKind::RunFailed => "RUN_FAILED",
            EventKind::RunTimedOut => "RUN_TIMED_OUT",
            EventKind::RunCancelled => "RUN_CANCELLED",
            EventKind::RunPaused => "RUN_PAUSED",
            EventKind::RunResumed => "RUN_RESUMED",
            EventKind::RetryScheduled => "RETRY_SCHEDULED",
            EventKind::RunnerOnline => "RUNNER_ONLINE",
            EventKind::RunnerOffline => "RUNNER_OFFLINE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only timeline entry. `seq` is assigned per run by the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub seq: u64,
    pub kind: EventKind,
    pub severity: Severity,
    pub step_id: Option<String>,
    pub node_id: Option<String>,
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl RunEvent {
    pub fn new(run_id: Uuid, tenant_id: Uuid, kind: EventKind, severity: Severity) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            tenant_id,
            seq: 0,
            kind,
            severity,
            step_id: None,
            node_id: None,
            payload: Value::Null,
            timestamp: now_ms(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_step(mut self, step_id: Option<String>, node_id: Option<String>) -> Self {
        self.step_id = step_id;
        self.node_id = node_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&EventKind::RunQueued).unwrap();
        assert_eq!(json, "\"RUN_QUEUED\"");
        let json = serde_json::to_string(&EventKind::HitlRequested).unwrap();
        assert_eq!(json, "\"HITL_REQUESTED\"");
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Error > Severity::Warn);
        assert!(Severity::Warn > Severity::Info);
    }
}
