//! Runner wire protocol: bidirectional JSON frames over a websocket-class
//! transport. Message names are stable wire contract — `runner:*` frames flow
//! runner→orchestrator, `job:*`/`session:*` frames orchestrator→runner
//! (except `job:progress`, `job:result` and `job:hitl`, which are inbound).

use crate::types::{
    ErrorInfo, HitlAction, Priority, ResultStatus, RunnerCapabilities, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Runner → orchestrator ────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunnerMessage {
    #[serde(rename = "runner:auth")]
    Auth(AuthPayload),
    #[serde(rename = "runner:heartbeat")]
    Heartbeat(HeartbeatPayload),
    #[serde(rename = "job:progress")]
    Progress(ProgressPayload),
    #[serde(rename = "job:result")]
    Result(ResultPayload),
    #[serde(rename = "job:hitl")]
    Hitl(HitlRequestPayload),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub runner_id: Uuid,
    pub api_key: String,
    pub version: String,
    pub capabilities: RunnerCapabilities,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatState {
    Idle,
    Busy,
    Draining,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub runner_id: Uuid,
    pub status: HeartbeatState,
    pub cpu: Option<f32>,
    pub memory: Option<f32>,
}

/// In-flight step descriptor. A change of `index` marks a step boundary; the
/// gateway derives STEP_START/STEP_END events from consecutive frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStep {
    pub index: u32,
    pub node_id: String,
    pub node_type: Option<String>,
    pub started_at: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLog {
    pub timestamp: Timestamp,
    pub level: crate::types::LogLevel,
    pub message: String,
    pub node_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub job_id: Uuid,
    pub run_id: Uuid,
    /// 0..100.
    pub progress: u8,
    pub current_step: Option<CurrentStep>,
    #[serde(default)]
    pub logs: Vec<WireLog>,
    pub error: Option<ErrorInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub status: ResultStatus,
    pub started_at: Option<Timestamp>,
    pub completed_at: Timestamp,
    pub duration_ms: i64,
    pub steps_executed: u32,
    pub steps_failed: u32,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
}

/// A step requesting human approval before it proceeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlRequestPayload {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub step_id: Option<String>,
    pub node_id: Option<String>,
    pub title: String,
    pub message: Option<String>,
    pub allowed_actions: Vec<HitlAction>,
    #[serde(default)]
    pub data_modification_allowed: bool,
    pub deadline: Option<Timestamp>,
    #[serde(default)]
    pub approver_ids: Vec<String>,
}

// ─── Orchestrator → runner ────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth:reply")]
    AuthReply(AuthReplyPayload),
    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck { success: bool },
    #[serde(rename = "job:assign")]
    Assign(AssignPayload),
    #[serde(rename = "job:cancel")]
    Cancel(JobRef),
    #[serde(rename = "job:pause")]
    Pause(JobRef),
    #[serde(rename = "job:resume")]
    Resume(JobRef),
    #[serde(rename = "job:hitl_resolved")]
    HitlResolved(HitlResolvedPayload),
    #[serde(rename = "session:error")]
    Error { message: String },
    #[serde(rename = "session:shutdown")]
    Shutdown { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthReplyPayload {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPayload {
    /// Job id equals the run id; runners treat it as opaque.
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub bot_id: Uuid,
    pub plan_hash: String,
    pub bot_package_url: String,
    pub variables: Value,
    pub secrets: BTreeMap<String, String>,
    pub priority: Priority,
    pub timeout_ms: i64,
    /// Equals the run's retry_count at the moment of assignment.
    pub retry_attempt: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlResolvedPayload {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub action: HitlAction,
    pub modified_data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_uses_contract_tag_and_field_names() {
        let msg = RunnerMessage::Auth(AuthPayload {
            runner_id: Uuid::now_v7(),
            api_key: "skr_deadbeef".to_string(),
            version: "1.4.0".to_string(),
            capabilities: RunnerCapabilities {
                os: "linux".to_string(),
                has_display: false,
                max_concurrent_jobs: 2,
                installed_software: vec!["chromium".to_string()],
                engine_version: "1.4.0".to_string(),
                tags: vec!["web.browser".to_string()],
            },
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "runner:auth");
        assert!(json["runnerId"].is_string());
        assert!(json["apiKey"].is_string());
        assert_eq!(json["capabilities"]["maxConcurrentJobs"], 2);
    }

    #[test]
    fn assign_frame_round_trips() {
        let run_id = Uuid::now_v7();
        let msg = ServerMessage::Assign(AssignPayload {
            job_id: run_id,
            run_id,
            bot_id: Uuid::now_v7(),
            plan_hash: "abc123".to_string(),
            bot_package_url: "https://packages.example/bot.tgz".to_string(),
            variables: serde_json::json!({"x": 1}),
            secrets: BTreeMap::from([("API_TOKEN".to_string(), "s3cret".to_string())]),
            priority: Priority::High,
            timeout_ms: 30_000,
            retry_attempt: 1,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"job:assign\""));
        assert!(json.contains("\"retryAttempt\":1"));
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::Assign(p) => assert_eq!(p.run_id, run_id),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn progress_frame_parses_with_missing_optionals() {
        let run_id = Uuid::now_v7();
        let raw = format!(
            r#"{{"type":"job:progress","jobId":"{run_id}","runId":"{run_id}","progress":40}}"#
        );
        let msg: RunnerMessage = serde_json::from_str(&raw).unwrap();
        match msg {
            RunnerMessage::Progress(p) => {
                assert_eq!(p.progress, 40);
                assert!(p.current_step.is_none());
                assert!(p.logs.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
