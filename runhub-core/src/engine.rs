use crate::bus::{run_topic, BusEvent, EventBus, RUNNERS_TOPIC};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventKind, RunEvent, Severity};
use crate::external::{BotCatalog, NotificationIntent, NotificationSink, SecretsResolver};
use crate::queue::RunQueue;
use crate::registry::RunnerRegistry;
use crate::store::{RunPatch, RunStore};
use crate::types::*;
use crate::wire::{AssignPayload, HitlRequestPayload, HitlResolvedPayload, JobRef, ServerMessage};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error code stamped on runs orphaned by a dropped session.
pub const RUNNER_DISCONNECTED: &str = "RUNNER_DISCONNECTED";
/// Error code stamped by the timeout sweep.
pub const TIMEOUT: &str = "TIMEOUT";
/// Error code stamped when an approval request expires with auto-reject.
pub const APPROVAL_EXPIRED: &str = "APPROVAL_EXPIRED";

/// Rolling quota window for "monthly" run counting.
const MONTH_MS: i64 = 30 * 24 * 3600 * 1000;

/// Human decision applied to a pending approval request.
#[derive(Clone, Debug)]
pub struct HitlDecision {
    pub action: HitlAction,
    pub comments: Option<String>,
    pub modified_data: Option<Value>,
    pub escalate_to: Option<String>,
}

/// Registration input for a new runner agent.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRunnerSpec {
    pub name: String,
    pub labels: std::collections::BTreeMap<String, String>,
    pub capabilities: RunnerCapabilities,
    pub max_concurrent_jobs: u32,
    pub vm_config: Option<VmConfig>,
}

impl Default for RegisterRunnerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            labels: Default::default(),
            capabilities: Default::default(),
            max_concurrent_jobs: 1,
            vm_config: None,
        }
    }
}

/// Sole owner of run state. Every status change flows through here; the
/// store's `conditional_update_run` serializes concurrent writers, so a
/// transition either lands exactly once or reports the status that beat it.
pub struct LifecycleEngine {
    store: Arc<dyn RunStore>,
    queue: Arc<RunQueue>,
    bus: Arc<EventBus>,
    registry: Arc<RunnerRegistry>,
    catalog: Arc<dyn BotCatalog>,
    secrets: Arc<dyn SecretsResolver>,
    notifier: Arc<dyn NotificationSink>,
    config: CoreConfig,
}

impl LifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<RunQueue>,
        bus: Arc<EventBus>,
        registry: Arc<RunnerRegistry>,
        catalog: Arc<dyn BotCatalog>,
        secrets: Arc<dyn SecretsResolver>,
        notifier: Arc<dyn NotificationSink>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            registry,
            catalog,
            secrets,
            notifier,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ── Create / enqueue ──

    /// Validate quotas and the bot version, persist a PENDING run, then
    /// enqueue it. Depth violations fail before any row is written.
    pub async fn create(&self, ctx: &RequestContext, spec: RunSpec) -> CoreResult<Run> {
        let now = now_ms();

        // 1. Quotas.
        if self.config.max_concurrent_runs > 0 {
            let active = self.store.count_active_runs(ctx.tenant_id).await?;
            if active >= self.config.max_concurrent_runs {
                return Err(CoreError::QuotaExceeded(format!(
                    "{active} active runs (limit {})",
                    self.config.max_concurrent_runs
                )));
            }
        }
        if self.config.max_monthly_runs > 0 {
            let monthly = self
                .store
                .count_runs_created_since(ctx.tenant_id, now - MONTH_MS)
                .await?;
            if monthly >= self.config.max_monthly_runs {
                return Err(CoreError::QuotaExceeded(format!(
                    "{monthly} runs in the last 30 days (limit {})",
                    self.config.max_monthly_runs
                )));
            }
        }

        // 2. Resolve the bot version; it must be executable.
        let version = self
            .catalog
            .resolve(spec.bot_id, spec.bot_version_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("bot {}", spec.bot_id)))?;
        if !version.is_executable() {
            return Err(CoreError::BotNotCompiled(format!(
                "bot {} version {}",
                spec.bot_id, version.version_id
            )));
        }

        // 3. Parent linkage and depth bound.
        let (parent_run_id, root_run_id, depth) = match spec.parent_run_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .load_run(parent_id)
                    .await?
                    .filter(|p| p.tenant_id == ctx.tenant_id)
                    .ok_or_else(|| CoreError::NotFound(format!("parent run {parent_id}")))?;
                let depth = parent.depth + 1;
                if depth > MAX_RUN_DEPTH {
                    return Err(CoreError::DepthExceeded {
                        depth,
                        max: MAX_RUN_DEPTH,
                    });
                }
                (Some(parent_id), parent.root_run_id, depth)
            }
            None => (None, Uuid::nil(), 0),
        };

        let timeout_seconds = spec
            .timeout_seconds
            .or(version.default_timeout_seconds)
            .unwrap_or(self.config.default_timeout_seconds);
        if timeout_seconds == 0 {
            return Err(CoreError::Validation("timeoutSeconds must be > 0".into()));
        }

        let id = Uuid::now_v7();
        let run = Run {
            id,
            tenant_id: ctx.tenant_id,
            bot_id: spec.bot_id,
            bot_version_id: version.version_id,
            plan_hash: version.plan_hash.clone(),
            status: RunStatus::Pending,
            priority: spec.priority.unwrap_or_default(),
            trigger_type: spec.trigger_type.unwrap_or_default(),
            triggered_by: ctx.actor_id.clone(),
            parent_run_id,
            root_run_id: if root_run_id.is_nil() { id } else { root_run_id },
            depth,
            inputs: spec.inputs,
            outputs: None,
            runner_id: None,
            selector: Selector {
                labels: spec.labels.clone(),
                capabilities: version.required_capabilities.clone(),
                pinned_runner_id: spec.pinned_runner_id,
            },
            timeout_seconds,
            timeout_at: now + i64::from(timeout_seconds) * 1000,
            retry: spec.retry.unwrap_or_default(),
            retry_count: 0,
            next_retry_at: None,
            retry_history: Vec::new(),
            created_at: now,
            queued_at: None,
            leased_at: None,
            started_at: None,
            completed_at: None,
            queue_duration_ms: None,
            error_code: None,
            error_message: None,
            cancel_reason: None,
            hitl_config: spec.hitl_config,
            active_hitl_id: None,
            requires_approval: spec.requires_approval,
            tags: spec.tags,
            labels: spec.labels,
            counters: RunCounters {
                total_steps: version.total_steps,
                ..Default::default()
            },
        };

        self.store.insert_run(&run).await?;
        info!(run_id = %run.id, tenant_id = %run.tenant_id, bot_id = %run.bot_id, "run created");

        self.enqueue(run.id).await
    }

    /// PENDING → QUEUED: insert the queue entry and announce the work.
    pub async fn enqueue(&self, run_id: Uuid) -> CoreResult<Run> {
        let run = self.load_run_required(run_id).await?;
        let now = now_ms();

        let n = self
            .store
            .conditional_update_run(
                run_id,
                &[RunStatus::Pending],
                &RunPatch::default().status(RunStatus::Queued).queued_at(now),
            )
            .await?;
        if n == 0 {
            let current = self.load_run_required(run_id).await?;
            return Err(CoreError::IllegalState {
                current: current.status,
                expected: vec![RunStatus::Pending],
            });
        }

        self.queue
            .enqueue(&QueueEntry {
                run_id,
                tenant_id: run.tenant_id,
                priority: run.priority,
                enqueued_at: now,
                available_at: now,
                selector: run.selector.clone(),
            })
            .await?;

        self.emit(
            RunEvent::new(run_id, run.tenant_id, EventKind::RunQueued, Severity::Info)
                .with_payload(json!({ "priority": run.priority, "retryCount": 0 })),
        )
        .await;

        self.load_run_required(run_id).await
    }

    // ── Lease / assignment ──

    /// QUEUED → LEASED for a specific runner. Returns the assignment frame,
    /// or `None` when the run was grabbed or cancelled first.
    pub async fn lease(
        &self,
        run_id: Uuid,
        profile: &RunnerProfile,
    ) -> CoreResult<Option<AssignPayload>> {
        let now = now_ms();
        let mut n = self
            .store
            .conditional_update_run(
                run_id,
                &[RunStatus::Queued],
                &RunPatch::default()
                    .status(RunStatus::Leased)
                    .leased_at(now)
                    .runner(Some(profile.runner_id)),
            )
            .await?;

        if n == 0 {
            // A claim can outrun the tick's retry-promotion pass: the queue
            // entry became available but the run is still RETRY_SCHEDULED.
            // Promote inline so the claimed entry is not lost.
            let Some(run) = self.store.load_run(run_id).await? else {
                return Ok(None);
            };
            if run.status != RunStatus::RetryScheduled
                || run.next_retry_at.is_some_and(|at| at > now)
            {
                return Ok(None);
            }
            self.promote_retry_inner(&run, now).await?;
            n = self
                .store
                .conditional_update_run(
                    run_id,
                    &[RunStatus::Queued],
                    &RunPatch::default()
                        .status(RunStatus::Leased)
                        .leased_at(now)
                        .runner(Some(profile.runner_id)),
                )
                .await?;
            if n == 0 {
                return Ok(None);
            }
        }

        let run = self.load_run_required(run_id).await?;

        // Resolve the package and secret bundle; failure returns the run to
        // the queue rather than stranding it in LEASED.
        let version = match self
            .catalog
            .resolve(run.bot_id, Some(run.bot_version_id))
            .await
        {
            Ok(Some(v)) => v,
            Ok(None) => {
                warn!(run_id = %run_id, "bot version disappeared; releasing lease");
                self.release_lease(run_id).await?;
                return Ok(None);
            }
            Err(err) => {
                self.release_lease(run_id).await?;
                return Err(CoreError::Storage(err));
            }
        };
        let secrets = match self.secrets.resolve(run.tenant_id, &run.plan_hash).await {
            Ok(s) => s,
            Err(err) => {
                warn!(run_id = %run_id, error = %format!("{err:#}"), "secret resolution failed; releasing lease");
                self.release_lease(run_id).await?;
                return Err(CoreError::Transient(format!("secret resolution: {err}")));
            }
        };

        self.emit(
            RunEvent::new(run_id, run.tenant_id, EventKind::RunLeased, Severity::Info)
                .with_payload(json!({ "runnerId": profile.runner_id })),
        )
        .await;
        debug!(run_id = %run_id, runner_id = %profile.runner_id, "run leased");

        let timeout_ms = (run.timeout_at - now).max(0);
        Ok(Some(AssignPayload {
            job_id: run.id,
            run_id: run.id,
            bot_id: run.bot_id,
            plan_hash: run.plan_hash.clone(),
            bot_package_url: version.package_url,
            variables: run.inputs.clone(),
            secrets,
            priority: run.priority,
            timeout_ms,
            retry_attempt: run.retry_count,
        }))
    }

    /// Roll a lease back to QUEUED when the assignment could not be
    /// delivered (runner vanished between claim and send).
    pub async fn release_lease(&self, run_id: Uuid) -> CoreResult<()> {
        let run = self.load_run_required(run_id).await?;
        let now = now_ms();
        let n = self
            .store
            .conditional_update_run(
                run_id,
                &[RunStatus::Leased],
                &RunPatch::default()
                    .status(RunStatus::Queued)
                    .runner(None)
                    .queued_at(now),
            )
            .await?;
        if n == 1 {
            self.queue
                .enqueue(&QueueEntry {
                    run_id,
                    tenant_id: run.tenant_id,
                    priority: run.priority,
                    enqueued_at: now,
                    available_at: now,
                    selector: run.selector.clone(),
                })
                .await?;
            debug!(run_id = %run_id, "lease released back to queue");
        }
        Ok(())
    }

    // ── Progress ──

    /// LEASED → RUNNING on the first progress frame. Idempotent: a run that
    /// already started is left alone.
    pub async fn mark_started(&self, run_id: Uuid) -> CoreResult<()> {
        let run = self.load_run_required(run_id).await?;
        if run.status == RunStatus::Running {
            return Ok(());
        }
        let now = now_ms();
        let queue_duration = match (run.leased_at, run.queued_at) {
            (Some(leased), Some(queued)) => leased - queued,
            _ => 0,
        };
        let n = self
            .store
            .conditional_update_run(
                run_id,
                &[RunStatus::Leased],
                &RunPatch::default()
                    .status(RunStatus::Running)
                    .started_at(now)
                    .queue_duration_ms(queue_duration),
            )
            .await?;
        if n == 0 {
            let current = self.load_run_required(run_id).await?;
            if current.status == RunStatus::Running {
                return Ok(());
            }
            return Err(CoreError::IllegalState {
                current: current.status,
                expected: vec![RunStatus::Leased],
            });
        }
        self.emit(
            RunEvent::new(run_id, run.tenant_id, EventKind::RunStarted, Severity::Info)
                .with_payload(json!({ "queueDurationMs": queue_duration })),
        )
        .await;
        Ok(())
    }

    /// Monotone counter update plus a live progress frame on the bus. No
    /// status change.
    pub async fn record_progress(&self, run_id: Uuid, update: &ProgressUpdate) -> CoreResult<()> {
        self.store.update_progress(run_id, update).await?;
        let topic = run_topic(run_id);
        self.bus.publish(
            &topic,
            BusEvent::new(
                topic.clone(),
                "PROGRESS",
                json!({
                    "runId": run_id,
                    "completedSteps": update.completed_steps,
                    "failedSteps": update.failed_steps,
                    "progressPct": update.progress_pct,
                    "currentNodeId": update.current_node_id,
                }),
            ),
        );
        Ok(())
    }

    /// Append a step-boundary event to the timeline (gateway ingestion).
    pub async fn record_step_event(
        &self,
        run_id: Uuid,
        kind: EventKind,
        step_id: Option<String>,
        node_id: Option<String>,
        payload: Value,
    ) -> CoreResult<()> {
        let run = self.load_run_required(run_id).await?;
        let severity = if kind == EventKind::StepError {
            Severity::Error
        } else {
            Severity::Info
        };
        self.emit(
            RunEvent::new(run_id, run.tenant_id, kind, severity)
                .with_step(step_id, node_id)
                .with_payload(payload),
        )
        .await;
        Ok(())
    }

    /// Append structured log lines (best-effort telemetry; failures are
    /// logged, never surfaced).
    pub async fn append_logs(&self, logs: Vec<RunLog>) {
        if logs.is_empty() {
            return;
        }
        if let Err(err) = self.store.append_logs(&logs).await {
            warn!(error = %format!("{err:#}"), "failed to append run logs");
        }
    }

    // ── HITL ──

    /// RUNNING → WAITING_APPROVAL plus a pending approval request.
    pub async fn request_hitl(&self, payload: &HitlRequestPayload) -> CoreResult<HitlRequest> {
        let run = self.load_run_required(payload.run_id).await?;
        let now = now_ms();
        let request_id = Uuid::now_v7();

        let n = self
            .store
            .conditional_update_run(
                run.id,
                &[RunStatus::Running],
                &RunPatch::default()
                    .status(RunStatus::WaitingApproval)
                    .active_hitl(Some(request_id)),
            )
            .await?;
        if n == 0 {
            let current = self.load_run_required(run.id).await?;
            return Err(CoreError::IllegalState {
                current: current.status,
                expected: vec![RunStatus::Running],
            });
        }

        let deadline = payload.deadline.or_else(|| {
            run.hitl_config
                .as_ref()
                .and_then(|c| c.default_deadline_minutes)
                .map(|m| now + i64::from(m) * 60_000)
        });
        let request = HitlRequest {
            id: request_id,
            run_id: run.id,
            tenant_id: run.tenant_id,
            step_id: payload.step_id.clone(),
            node_id: payload.node_id.clone(),
            status: HitlStatus::Pending,
            title: payload.title.clone(),
            message: payload.message.clone(),
            allowed_actions: if payload.allowed_actions.is_empty() {
                vec![HitlAction::Approve, HitlAction::Reject]
            } else {
                payload.allowed_actions.clone()
            },
            data_modification_allowed: payload.data_modification_allowed,
            assigned_to: None,
            approver_ids: payload.approver_ids.clone(),
            deadline,
            auto_expire: deadline.is_some(),
            action: None,
            resolved_by: None,
            resolved_at: None,
            comments: None,
            modified_data: None,
            audit_trail: vec![HitlAuditEntry {
                at: now,
                actor: "runner".to_string(),
                action: "requested".to_string(),
                detail: payload.node_id.clone(),
            }],
            created_at: now,
        };
        self.store.insert_hitl(&request).await?;

        self.emit(
            RunEvent::new(run.id, run.tenant_id, EventKind::HitlRequested, Severity::Info)
                .with_step(payload.step_id.clone(), payload.node_id.clone())
                .with_payload(json!({
                    "requestId": request_id,
                    "title": payload.title,
                    "allowedActions": request.allowed_actions,
                })),
        )
        .await;
        self.send_notification(
            &run,
            "hitl_requested",
            format!("Approval needed: {}", payload.title),
            request.approver_ids.clone(),
        )
        .await;

        Ok(request)
    }

    /// Apply a human decision to a pending request.
    pub async fn resolve_hitl(
        &self,
        request_id: Uuid,
        ctx: &RequestContext,
        decision: HitlDecision,
    ) -> CoreResult<HitlRequest> {
        let request = self
            .store
            .load_hitl(request_id)
            .await?
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| CoreError::NotFound(format!("approval request {request_id}")))?;

        if request.status != HitlStatus::Pending {
            return Err(CoreError::AlreadyResolved(request.status));
        }
        if !request.allowed_actions.contains(&decision.action) {
            return Err(CoreError::ActionNotAllowed(decision.action));
        }
        if decision.action == HitlAction::Modify && !request.data_modification_allowed {
            return Err(CoreError::ActionNotAllowed(decision.action));
        }
        if !request.approver_ids.is_empty()
            && !request.approver_ids.contains(&ctx.actor_id)
            && request.assigned_to.as_deref() != Some(ctx.actor_id.as_str())
        {
            return Err(CoreError::Forbidden(format!(
                "{} is not an approver for this request",
                ctx.actor_id
            )));
        }

        let run = self.load_run_required(request.run_id).await?;
        let now = now_ms();

        match decision.action {
            HitlAction::Approve | HitlAction::Modify => {
                let mut patch = RunPatch::default()
                    .status(RunStatus::Running)
                    .active_hitl(None);
                if decision.action == HitlAction::Modify {
                    if let Some(ref data) = decision.modified_data {
                        patch = patch.inputs(data.clone());
                    }
                }
                let n = self
                    .store
                    .conditional_update_run(run.id, &[RunStatus::WaitingApproval], &patch)
                    .await?;
                if n == 0 {
                    let current = self.load_run_required(run.id).await?;
                    return Err(CoreError::IllegalState {
                        current: current.status,
                        expected: vec![RunStatus::WaitingApproval],
                    });
                }
                let status = if decision.action == HitlAction::Modify {
                    HitlStatus::Modified
                } else {
                    HitlStatus::Approved
                };
                self.store
                    .resolve_hitl(
                        request_id,
                        &HitlResolution {
                            status,
                            action: Some(decision.action),
                            resolved_by: ctx.actor_id.clone(),
                            resolved_at: now,
                            comments: decision.comments.clone(),
                            modified_data: decision.modified_data.clone(),
                        },
                    )
                    .await?;
                self.audit_hitl(request_id, &ctx.actor_id, "resolved", decision.comments.clone())
                    .await;
                self.emit(
                    RunEvent::new(run.id, run.tenant_id, EventKind::HitlApproved, Severity::Info)
                        .with_payload(json!({
                            "requestId": request_id,
                            "action": decision.action,
                            "resolvedBy": ctx.actor_id,
                        })),
                )
                .await;

                // Tell the runner to carry on. A dead session means the work
                // cannot resume: treat it like any other disconnect.
                if let Some(runner_id) = run.runner_id {
                    let delivered = self.registry.send(
                        runner_id,
                        ServerMessage::HitlResolved(HitlResolvedPayload {
                            job_id: run.id,
                            run_id: run.id,
                            action: decision.action,
                            modified_data: decision.modified_data,
                        }),
                    );
                    if !delivered {
                        warn!(run_id = %run.id, runner_id = %runner_id, "runner gone at approval; orphaning");
                        let _ = self.orphan(run.id).await;
                    }
                }
            }
            HitlAction::Reject => {
                let n = self
                    .store
                    .conditional_update_run(
                        run.id,
                        &[RunStatus::WaitingApproval],
                        &RunPatch::default()
                            .status(RunStatus::Rejected)
                            .completed_at(now)
                            .active_hitl(None)
                            .error(
                                Some("REJECTED".to_string()),
                                decision.comments.clone().or_else(|| {
                                    Some("rejected by approver".to_string())
                                }),
                            ),
                    )
                    .await?;
                if n == 0 {
                    let current = self.load_run_required(run.id).await?;
                    return Err(CoreError::IllegalState {
                        current: current.status,
                        expected: vec![RunStatus::WaitingApproval],
                    });
                }
                self.store
                    .resolve_hitl(
                        request_id,
                        &HitlResolution {
                            status: HitlStatus::Rejected,
                            action: Some(HitlAction::Reject),
                            resolved_by: ctx.actor_id.clone(),
                            resolved_at: now,
                            comments: decision.comments.clone(),
                            modified_data: None,
                        },
                    )
                    .await?;
                self.audit_hitl(request_id, &ctx.actor_id, "rejected", decision.comments)
                    .await;
                self.emit(
                    RunEvent::new(run.id, run.tenant_id, EventKind::HitlRejected, Severity::Warn)
                        .with_payload(json!({ "requestId": request_id, "resolvedBy": ctx.actor_id })),
                )
                .await;
                if let Some(runner_id) = run.runner_id {
                    self.registry
                        .send(runner_id, ServerMessage::Cancel(JobRef { job_id: run.id }));
                }
            }
            HitlAction::Escalate => {
                let target = decision
                    .escalate_to
                    .or_else(|| {
                        run.hitl_config
                            .as_ref()
                            .and_then(|c| c.escalation_target.clone())
                    })
                    .ok_or_else(|| {
                        CoreError::Validation("no escalation target configured".into())
                    })?;
                self.store.escalate_hitl(request_id, &target).await?;
                self.audit_hitl(
                    request_id,
                    &ctx.actor_id,
                    "escalated",
                    Some(format!("to {target}")),
                )
                .await;
                self.emit(
                    RunEvent::new(run.id, run.tenant_id, EventKind::HitlEscalated, Severity::Info)
                        .with_payload(json!({ "requestId": request_id, "assignedTo": target })),
                )
                .await;
            }
        }

        self.store
            .load_hitl(request_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("approval request {request_id}")))
    }

    /// Tick-driven expiry of an overdue pending request.
    pub async fn expire_hitl(&self, request: &HitlRequest) -> CoreResult<()> {
        let run = self.load_run_required(request.run_id).await?;
        let auto_reject = run
            .hitl_config
            .as_ref()
            .map(|c| c.auto_reject_on_expiry)
            .unwrap_or(false);
        let now = now_ms();

        if auto_reject {
            let n = self
                .store
                .resolve_hitl(
                    request.id,
                    &HitlResolution {
                        status: HitlStatus::Expired,
                        action: None,
                        resolved_by: "system".to_string(),
                        resolved_at: now,
                        comments: Some("deadline passed".to_string()),
                        modified_data: None,
                    },
                )
                .await?;
            if n == 0 {
                return Ok(()); // resolved by a human in the meantime
            }
            self.audit_hitl(request.id, "system", "expired", None).await;
            self.store
                .conditional_update_run(
                    run.id,
                    &[RunStatus::WaitingApproval],
                    &RunPatch::default()
                        .status(RunStatus::Rejected)
                        .completed_at(now)
                        .active_hitl(None)
                        .error(
                            Some(APPROVAL_EXPIRED.to_string()),
                            Some("approval deadline passed".to_string()),
                        ),
                )
                .await?;
            self.emit(
                RunEvent::new(run.id, run.tenant_id, EventKind::HitlExpired, Severity::Warn)
                    .with_payload(json!({ "requestId": request.id, "autoRejected": true })),
            )
            .await;
            if let Some(runner_id) = run.runner_id {
                self.registry
                    .send(runner_id, ServerMessage::Cancel(JobRef { job_id: run.id }));
            }
        } else {
            // No auto-reject: hand the request to the escalation target (or
            // leave it unassigned) and stop the expiry clock.
            let target = run
                .hitl_config
                .as_ref()
                .and_then(|c| c.escalation_target.clone())
                .unwrap_or_else(|| "unassigned".to_string());
            let n = self.store.escalate_hitl(request.id, &target).await?;
            if n == 0 {
                return Ok(());
            }
            self.audit_hitl(request.id, "system", "auto-escalated", Some(target.clone()))
                .await;
            self.emit(
                RunEvent::new(run.id, run.tenant_id, EventKind::HitlEscalated, Severity::Warn)
                    .with_payload(json!({ "requestId": request.id, "assignedTo": target })),
            )
            .await;
        }
        Ok(())
    }

    // ── Completion / retry ──

    /// Apply a terminal report from the runner. Late results for runs no
    /// longer in a completable state are discarded (logged once at WARN) and
    /// the caller should instruct the runner to drop the job.
    pub async fn complete(&self, run_id: Uuid, result: RunResult) -> CoreResult<Run> {
        let run = self.load_run_required(run_id).await?;
        if !RunStatus::completable().contains(&run.status) {
            warn!(run_id = %run_id, status = ?run.status, "late result discarded");
            return Err(CoreError::IllegalState {
                current: run.status,
                expected: RunStatus::completable().to_vec(),
            });
        }

        // Counters first; monotone, so a stale report cannot regress them.
        let _ = self
            .store
            .update_progress(
                run_id,
                &ProgressUpdate {
                    completed_steps: Some(result.steps_executed.saturating_sub(result.steps_failed)),
                    failed_steps: Some(result.steps_failed),
                    ..Default::default()
                },
            )
            .await;

        let now = now_ms();
        match result.status {
            ResultStatus::Success => {
                let mut patch = RunPatch::default()
                    .status(RunStatus::Succeeded)
                    .completed_at(now);
                if let Some(ref output) = result.output {
                    patch = patch.outputs(output.clone());
                }
                let n = self
                    .store
                    .conditional_update_run(run_id, RunStatus::completable(), &patch)
                    .await?;
                if n == 0 {
                    return self.discarded(run_id).await;
                }
                self.emit(
                    RunEvent::new(run_id, run.tenant_id, EventKind::RunCompleted, Severity::Info)
                        .with_payload(json!({
                            "durationMs": result.duration_ms,
                            "stepsExecuted": result.steps_executed,
                        })),
                )
                .await;
                info!(run_id = %run_id, duration_ms = result.duration_ms, "run succeeded");
            }
            ResultStatus::Cancelled => {
                let n = self
                    .store
                    .conditional_update_run(
                        run_id,
                        RunStatus::completable(),
                        &RunPatch::default()
                            .status(RunStatus::Cancelled)
                            .completed_at(now)
                            .cancel_reason("cancelled by runner".to_string()),
                    )
                    .await?;
                if n == 0 {
                    return self.discarded(run_id).await;
                }
                self.emit(
                    RunEvent::new(run_id, run.tenant_id, EventKind::RunCancelled, Severity::Warn)
                        .with_payload(json!({ "reason": "cancelled by runner" })),
                )
                .await;
            }
            ResultStatus::Failed => {
                let error = result.error.clone().unwrap_or_else(|| ErrorInfo {
                    code: "UNKNOWN".to_string(),
                    message: "runner reported failure without detail".to_string(),
                    node_id: None,
                    retryable: false,
                });
                if error.retryable && run.retry_count < run.retry.max_retries {
                    return self.schedule_retry(&run, &error).await;
                }
                let n = self
                    .store
                    .conditional_update_run(
                        run_id,
                        RunStatus::completable(),
                        &RunPatch::default()
                            .status(RunStatus::Failed)
                            .completed_at(now)
                            .active_hitl(None)
                            .error(Some(error.code.clone()), Some(error.message.clone())),
                    )
                    .await?;
                if n == 0 {
                    return self.discarded(run_id).await;
                }
                self.emit(
                    RunEvent::new(run_id, run.tenant_id, EventKind::RunFailed, Severity::Error)
                        .with_step(None, error.node_id.clone())
                        .with_payload(json!({
                            "errorCode": error.code,
                            "errorMessage": error.message,
                            "retryCount": run.retry_count,
                        })),
                )
                .await;
                self.send_notification(
                    &run,
                    "run_failed",
                    format!("Run failed: {}", error.message),
                    vec![run.triggered_by.clone()],
                )
                .await;
            }
        }

        self.load_run_required(run_id).await
    }

    /// Treat a dropped session's in-flight run as a transient failure,
    /// feeding the normal retry pipeline.
    pub async fn orphan(&self, run_id: Uuid) -> CoreResult<Run> {
        let run = self.load_run_required(run_id).await?;
        if !matches!(run.status, RunStatus::Leased | RunStatus::Running) {
            return Ok(run);
        }
        let now = now_ms();
        self.complete(
            run_id,
            RunResult {
                status: ResultStatus::Failed,
                started_at: run.started_at,
                completed_at: now,
                duration_ms: run.started_at.map(|s| now - s).unwrap_or_default(),
                steps_executed: run.counters.completed_steps,
                steps_failed: run.counters.failed_steps,
                output: None,
                error: Some(ErrorInfo {
                    code: RUNNER_DISCONNECTED.to_string(),
                    message: "runner session dropped with the job in flight".to_string(),
                    node_id: None,
                    retryable: true,
                }),
            },
        )
        .await
    }

    /// Schedule the next attempt with exponential backoff. The queue entry
    /// is inserted now with a delayed `available_at`; the tick promotes the
    /// run (and bumps `retry_count`) once the delay elapses.
    async fn schedule_retry(&self, run: &Run, error: &ErrorInfo) -> CoreResult<Run> {
        let now = now_ms();
        let delay_s = run.retry.delay_seconds(run.retry_count);
        let next_retry_at = now + (delay_s as i64) * 1000;

        let n = self
            .store
            .conditional_update_run(
                run.id,
                RunStatus::completable(),
                &RunPatch::default()
                    .status(RunStatus::RetryScheduled)
                    .runner(None)
                    .active_hitl(None)
                    .next_retry_at(Some(next_retry_at))
                    .error(Some(error.code.clone()), Some(error.message.clone()))
                    .push_retry_record(RetryRecord {
                        attempt: run.retry_count,
                        error_code: Some(error.code.clone()),
                        error_message: Some(error.message.clone()),
                        scheduled_at: now,
                        next_retry_at,
                    }),
            )
            .await?;
        if n == 0 {
            return self.discarded(run.id).await;
        }

        self.queue
            .enqueue(&QueueEntry {
                run_id: run.id,
                tenant_id: run.tenant_id,
                priority: run.priority,
                enqueued_at: now,
                available_at: next_retry_at,
                selector: run.selector.clone(),
            })
            .await?;

        self.emit(
            RunEvent::new(run.id, run.tenant_id, EventKind::RetryScheduled, Severity::Warn)
                .with_payload(json!({
                    "attempt": run.retry_count,
                    "delaySeconds": delay_s,
                    "nextRetryAt": next_retry_at,
                    "errorCode": error.code,
                })),
        )
        .await;
        info!(run_id = %run.id, delay_s, "retry scheduled");

        self.load_run_required(run.id).await
    }

    /// RETRY_SCHEDULED → QUEUED once the backoff delay has elapsed
    /// (tick pass 1).
    pub async fn promote_retry(&self, run: &Run) -> CoreResult<()> {
        self.promote_retry_inner(run, now_ms()).await
    }

    async fn promote_retry_inner(&self, run: &Run, now: Timestamp) -> CoreResult<()> {
        let n = self
            .store
            .conditional_update_run(
                run.id,
                &[RunStatus::RetryScheduled],
                &RunPatch::default()
                    .status(RunStatus::Queued)
                    .queued_at(now)
                    .retry_count(run.retry_count + 1)
                    .next_retry_at(None),
            )
            .await?;
        if n == 0 {
            return Ok(()); // raced with cancel/timeout
        }
        self.emit(
            RunEvent::new(run.id, run.tenant_id, EventKind::RunQueued, Severity::Info)
                .with_payload(json!({
                    "priority": run.priority,
                    "retryCount": run.retry_count + 1,
                })),
        )
        .await;
        self.queue.kick();
        Ok(())
    }

    // ── Cancel / pause / resume / timeout ──

    /// Cancel a run from any non-terminal state. Idempotent: cancelling an
    /// already-cancelled run returns it unchanged without a second event.
    pub async fn cancel(
        &self,
        run_id: Uuid,
        actor: &str,
        reason: Option<String>,
        cascade_children: bool,
    ) -> CoreResult<Run> {
        let cancelled = self.cancel_single(run_id, actor, reason.clone()).await?;

        if cascade_children {
            // Children in any order; a failed child cancel never blocks the
            // parent. Iterative walk, no recursion.
            let mut pending = vec![run_id];
            while let Some(parent) = pending.pop() {
                let children = self.store.list_children(parent).await?;
                for child in children {
                    pending.push(child.id);
                    if child.status.is_terminal() {
                        continue;
                    }
                    if let Err(err) = self
                        .cancel_single(child.id, actor, reason.clone())
                        .await
                    {
                        warn!(run_id = %child.id, error = %err, "child cancel failed");
                    }
                }
            }
        }

        Ok(cancelled)
    }

    async fn cancel_single(
        &self,
        run_id: Uuid,
        actor: &str,
        reason: Option<String>,
    ) -> CoreResult<Run> {
        let run = self.load_run_required(run_id).await?;
        if run.status == RunStatus::Cancelled {
            return Ok(run);
        }
        if run.status.is_terminal() {
            return Err(CoreError::IllegalState {
                current: run.status,
                expected: RunStatus::non_terminal().to_vec(),
            });
        }

        let now = now_ms();
        let reason_text = reason.unwrap_or_else(|| format!("cancelled by {actor}"));
        let n = self
            .store
            .conditional_update_run(
                run_id,
                RunStatus::non_terminal(),
                &RunPatch::default()
                    .status(RunStatus::Cancelled)
                    .completed_at(now)
                    .active_hitl(None)
                    .cancel_reason(reason_text.clone()),
            )
            .await?;
        if n == 0 {
            let current = self.load_run_required(run_id).await?;
            if current.status == RunStatus::Cancelled {
                return Ok(current);
            }
            return Err(CoreError::IllegalState {
                current: current.status,
                expected: RunStatus::non_terminal().to_vec(),
            });
        }

        self.queue.remove(run_id).await?;
        self.close_pending_hitl(run_id, "run cancelled").await;

        self.emit(
            RunEvent::new(run_id, run.tenant_id, EventKind::RunCancelled, Severity::Warn)
                .with_payload(json!({ "reason": reason_text, "cancelledBy": actor })),
        )
        .await;

        // Fire-and-forget: the runner should abort, and any late result for
        // the now-terminal run is discarded anyway.
        if let Some(runner_id) = run.runner_id {
            self.registry
                .send(runner_id, ServerMessage::Cancel(JobRef { job_id: run_id }));
        }

        self.load_run_required(run_id).await
    }

    /// RUNNING → PAUSED (operator-driven).
    pub async fn pause(&self, run_id: Uuid, actor: &str, reason: Option<String>) -> CoreResult<Run> {
        let run = self.load_run_required(run_id).await?;
        let n = self
            .store
            .conditional_update_run(
                run_id,
                &[RunStatus::Running],
                &RunPatch::default().status(RunStatus::Paused),
            )
            .await?;
        if n == 0 {
            let current = self.load_run_required(run_id).await?;
            return Err(CoreError::IllegalState {
                current: current.status,
                expected: vec![RunStatus::Running],
            });
        }
        self.emit(
            RunEvent::new(run_id, run.tenant_id, EventKind::RunPaused, Severity::Info)
                .with_payload(json!({ "pausedBy": actor, "reason": reason })),
        )
        .await;
        if let Some(runner_id) = run.runner_id {
            self.registry
                .send(runner_id, ServerMessage::Pause(JobRef { job_id: run_id }));
        }
        self.load_run_required(run_id).await
    }

    /// PAUSED → RUNNING.
    pub async fn resume(&self, run_id: Uuid, actor: &str) -> CoreResult<Run> {
        let run = self.load_run_required(run_id).await?;
        let n = self
            .store
            .conditional_update_run(
                run_id,
                &[RunStatus::Paused],
                &RunPatch::default().status(RunStatus::Running),
            )
            .await?;
        if n == 0 {
            let current = self.load_run_required(run_id).await?;
            return Err(CoreError::IllegalState {
                current: current.status,
                expected: vec![RunStatus::Paused],
            });
        }
        self.emit(
            RunEvent::new(run_id, run.tenant_id, EventKind::RunResumed, Severity::Info)
                .with_payload(json!({ "resumedBy": actor })),
        )
        .await;
        if let Some(runner_id) = run.runner_id {
            self.registry
                .send(runner_id, ServerMessage::Resume(JobRef { job_id: run_id }));
        }
        self.load_run_required(run_id).await
    }

    /// Tick-driven: any non-terminal run past its `timeout_at` becomes
    /// TIMED_OUT. Idempotent across racing tick leaders.
    pub async fn timeout(&self, run_id: Uuid) -> CoreResult<()> {
        let run = self.load_run_required(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let now = now_ms();
        let n = self
            .store
            .conditional_update_run(
                run_id,
                RunStatus::non_terminal(),
                &RunPatch::default()
                    .status(RunStatus::TimedOut)
                    .completed_at(now)
                    .active_hitl(None)
                    .error(
                        Some(TIMEOUT.to_string()),
                        Some(format!("exceeded {}s timeout", run.timeout_seconds)),
                    ),
            )
            .await?;
        if n == 0 {
            return Ok(());
        }

        self.queue.remove(run_id).await?;
        self.close_pending_hitl(run_id, "run timed out").await;

        self.emit(
            RunEvent::new(run_id, run.tenant_id, EventKind::RunTimedOut, Severity::Warn)
                .with_payload(json!({ "timeoutSeconds": run.timeout_seconds })),
        )
        .await;
        if let Some(runner_id) = run.runner_id {
            self.registry
                .send(runner_id, ServerMessage::Cancel(JobRef { job_id: run_id }));
        }
        warn!(run_id = %run_id, "run timed out");
        Ok(())
    }

    /// Manual retry: build a fresh run from a terminal failed/timed-out/
    /// cancelled one.
    pub async fn retry_run(
        &self,
        ctx: &RequestContext,
        run_id: Uuid,
        inputs: Option<Value>,
    ) -> CoreResult<Run> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        if !matches!(
            run.status,
            RunStatus::Failed | RunStatus::TimedOut | RunStatus::Cancelled
        ) {
            return Err(CoreError::NotRetriable(run.status));
        }

        self.create(
            ctx,
            RunSpec {
                bot_id: run.bot_id,
                bot_version_id: Some(run.bot_version_id),
                inputs: inputs.unwrap_or(run.inputs),
                priority: Some(run.priority),
                trigger_type: Some(TriggerType::Manual),
                parent_run_id: run.parent_run_id,
                timeout_seconds: Some(run.timeout_seconds),
                retry: Some(run.retry),
                hitl_config: run.hitl_config,
                requires_approval: run.requires_approval,
                tags: run.tags,
                labels: run.labels,
                pinned_runner_id: run.selector.pinned_runner_id,
            },
        )
        .await
    }

    // ── Reads ──

    pub async fn get_run(&self, ctx: &RequestContext, run_id: Uuid) -> CoreResult<RunDetail> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;
        let child_count = self.store.count_children(run_id).await?;
        let event_count = self.store.count_events(run_id).await?;
        Ok(RunDetail {
            run,
            child_count,
            event_count,
        })
    }

    pub async fn list_runs(&self, ctx: &RequestContext, mut filter: RunFilter) -> CoreResult<Page<Run>> {
        filter.tenant_id = Some(ctx.tenant_id);
        Ok(self.store.list_runs(&filter).await?)
    }

    pub async fn list_events(
        &self,
        ctx: &RequestContext,
        run_id: Uuid,
        filter: EventFilter,
    ) -> CoreResult<Page<RunEvent>> {
        self.get_run(ctx, run_id).await?;
        Ok(self.store.list_events(run_id, &filter).await?)
    }

    pub async fn list_logs(
        &self,
        ctx: &RequestContext,
        run_id: Uuid,
        filter: LogFilter,
    ) -> CoreResult<Page<RunLog>> {
        self.get_run(ctx, run_id).await?;
        Ok(self.store.list_logs(run_id, &filter).await?)
    }

    pub async fn list_hitl(
        &self,
        ctx: &RequestContext,
        mut filter: HitlFilter,
    ) -> CoreResult<Page<HitlRequest>> {
        filter.tenant_id = Some(ctx.tenant_id);
        Ok(self.store.list_hitl(&filter).await?)
    }

    pub async fn list_runners(&self, ctx: &RequestContext) -> CoreResult<Vec<Runner>> {
        Ok(self.store.list_runners(ctx.tenant_id).await?)
    }

    // ── Runner registration ──

    /// Register a new runner agent. The plaintext API key is returned
    /// exactly once; only its SHA-256 is stored.
    pub async fn register_runner(
        &self,
        ctx: &RequestContext,
        spec: RegisterRunnerSpec,
    ) -> CoreResult<(Runner, String)> {
        if spec.name.trim().is_empty() {
            return Err(CoreError::Validation("runner name must not be empty".into()));
        }
        let (api_key, api_key_hash) = mint_api_key();
        let runner = Runner {
            id: Uuid::now_v7(),
            tenant_id: ctx.tenant_id,
            name: spec.name,
            api_key_hash,
            status: RunnerStatus::Offline,
            capabilities: spec.capabilities,
            labels: spec.labels,
            max_concurrent_jobs: spec.max_concurrent_jobs.max(1),
            last_heartbeat_at: None,
            vm_config: spec.vm_config,
            registered_at: now_ms(),
        };
        self.store.insert_runner(&runner).await?;
        info!(runner_id = %runner.id, tenant_id = %runner.tenant_id, "runner registered");
        Ok((runner, api_key))
    }

    // ── Internals ──

    async fn load_run_required(&self, run_id: Uuid) -> CoreResult<Run> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))
    }

    async fn discarded(&self, run_id: Uuid) -> CoreResult<Run> {
        let current = self.load_run_required(run_id).await?;
        warn!(run_id = %run_id, status = ?current.status, "late result discarded");
        Err(CoreError::IllegalState {
            current: current.status,
            expected: RunStatus::completable().to_vec(),
        })
    }

    /// Close a pending approval request when its run leaves
    /// WAITING_APPROVAL through cancellation or timeout.
    async fn close_pending_hitl(&self, run_id: Uuid, detail: &str) {
        let pending = match self.store.pending_hitl_for_run(run_id).await {
            Ok(p) => p,
            Err(err) => {
                warn!(run_id = %run_id, error = %format!("{err:#}"), "pending approval lookup failed");
                return;
            }
        };
        if let Some(request) = pending {
            let resolution = HitlResolution {
                status: HitlStatus::Expired,
                action: None,
                resolved_by: "system".to_string(),
                resolved_at: now_ms(),
                comments: Some(detail.to_string()),
                modified_data: None,
            };
            if let Err(err) = self.store.resolve_hitl(request.id, &resolution).await {
                warn!(run_id = %run_id, error = %format!("{err:#}"), "failed to expire approval request");
            }
            self.audit_hitl(request.id, "system", "expired", Some(detail.to_string()))
                .await;
        }
    }

    /// Persist and fan out an event. Telemetry never fails the mutation it
    /// accompanies.
    async fn emit(&self, event: RunEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
        if let Err(err) = self.store.append_event(&event).await {
            warn!(run_id = %event.run_id, error = %format!("{err:#}"), "failed to append event");
        }
        let topic = run_topic(event.run_id);
        self.bus
            .publish(&topic, BusEvent::new(topic.clone(), event.kind.as_str(), payload));
    }

    async fn audit_hitl(&self, request_id: Uuid, actor: &str, action: &str, detail: Option<String>) {
        let entry = HitlAuditEntry {
            at: now_ms(),
            actor: actor.to_string(),
            action: action.to_string(),
            detail,
        };
        if let Err(err) = self.store.append_hitl_audit(request_id, &entry).await {
            warn!(request_id = %request_id, error = %format!("{err:#}"), "failed to append audit entry");
        }
    }

    async fn send_notification(
        &self,
        run: &Run,
        kind: &str,
        subject: String,
        recipients: Vec<String>,
    ) {
        let intent = NotificationIntent {
            tenant_id: run.tenant_id,
            run_id: run.id,
            kind: kind.to_string(),
            subject: subject.clone(),
            body: subject,
            recipients,
        };
        if let Err(err) = self.notifier.notify(intent).await {
            warn!(run_id = %run.id, error = %format!("{err:#}"), "notification delivery failed");
        }
    }

    /// Publish a runner presence event on the shared `runners` topic.
    pub async fn emit_runner_presence(&self, runner_id: Uuid, kind: EventKind) {
        self.bus.publish(
            RUNNERS_TOPIC,
            BusEvent::new(
                RUNNERS_TOPIC,
                kind.as_str(),
                json!({ "runnerId": runner_id }),
            ),
        );
    }
}

/// Mint a runner API key: environment-tagged hex over 32 random bytes.
/// Returns `(plaintext, sha256_hex)`.
pub fn mint_api_key() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let key = format!("skr_{}", hex::encode(bytes));
    let hash = hash_api_key(&key);
    (key, hash)
}

/// SHA-256 of the full plaintext key, hex-encoded — the only form ever
/// stored or compared.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{BotVersion, BotVersionState, NoSecrets, NoopNotifier, StaticCatalog};
    use crate::store_memory::MemoryStore;
    use crate::wire::HitlRequestPayload;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    const PLAN_HASH: &str = "9f86d081884c7d65";

    struct Harness {
        engine: Arc<LifecycleEngine>,
        store: Arc<MemoryStore>,
        registry: Arc<RunnerRegistry>,
        ctx: RequestContext,
        bot_id: Uuid,
        version_id: Uuid,
    }

    fn harness() -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn RunStore> = store.clone();
        let queue = Arc::new(RunQueue::new(store_dyn.clone()));
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(RunnerRegistry::new());

        let bot_id = Uuid::now_v7();
        let version_id = Uuid::now_v7();
        let catalog = StaticCatalog::new();
        catalog.insert(BotVersion {
            bot_id,
            version_id,
            state: BotVersionState::Published,
            plan_hash: PLAN_HASH.to_string(),
            package_url: "https://packages.test/bot.tgz".to_string(),
            total_steps: 3,
            required_capabilities: vec!["web.browser".to_string()],
            default_timeout_seconds: None,
        });

        let ctx = RequestContext::new(Uuid::now_v7(), "tester");
        let engine = Arc::new(LifecycleEngine::new(
            store_dyn,
            queue,
            bus,
            registry.clone(),
            Arc::new(catalog),
            Arc::new(NoSecrets),
            Arc::new(NoopNotifier),
            CoreConfig::default(),
        ));

        Harness {
            engine,
            store,
            registry,
            ctx,
            bot_id,
            version_id,
        }
    }

    impl Harness {
        fn spec(&self) -> RunSpec {
            RunSpec {
                bot_id: self.bot_id,
                bot_version_id: Some(self.version_id),
                inputs: json!({"x": 1}),
                ..Default::default()
            }
        }

        /// Register a runner and attach a fake session so control messages
        /// have somewhere to go.
        async fn connect_runner(
            &self,
            capabilities: Vec<String>,
        ) -> (RunnerProfile, mpsc::UnboundedReceiver<ServerMessage>) {
            let (runner, _key) = self
                .engine
                .register_runner(
                    &self.ctx,
                    RegisterRunnerSpec {
                        name: "r1".to_string(),
                        capabilities: RunnerCapabilities {
                            tags: capabilities,
                            max_concurrent_jobs: 4,
                            ..Default::default()
                        },
                        max_concurrent_jobs: 4,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let profile = runner.profile();
            let (tx, rx) = mpsc::unbounded_channel();
            self.registry.register(crate::registry::ConnectedRunner {
                runner_id: runner.id,
                tenant_id: runner.tenant_id,
                session_id: Uuid::now_v7(),
                sender: tx,
                profile: profile.clone(),
                max_concurrent_jobs: 4,
                current_jobs: Vec::new(),
                last_heartbeat: now_ms(),
                connected_at: now_ms(),
                draining: false,
            });
            (profile, rx)
        }

        /// Dispatcher in miniature: claim the best entry and lease it.
        async fn claim_and_lease(&self, profile: &RunnerProfile) -> Option<AssignPayload> {
            let entry = self
                .engine
                .queue()
                .claim(profile, now_ms())
                .await
                .unwrap()?;
            self.engine.lease(entry.run_id, profile).await.unwrap()
        }

        async fn event_kinds(&self, run_id: Uuid) -> Vec<EventKind> {
            self.store
                .list_events(run_id, &EventFilter::default())
                .await
                .unwrap()
                .items
                .iter()
                .map(|e| e.kind)
                .collect()
        }
    }

    fn success_result(steps: u32, output: Value) -> RunResult {
        RunResult {
            status: ResultStatus::Success,
            started_at: Some(now_ms()),
            completed_at: now_ms(),
            duration_ms: 1234,
            steps_executed: steps,
            steps_failed: 0,
            output: Some(output),
            error: None,
        }
    }

    fn failed_result(retryable: bool) -> RunResult {
        RunResult {
            status: ResultStatus::Failed,
            started_at: Some(now_ms()),
            completed_at: now_ms(),
            duration_ms: 50,
            steps_executed: 1,
            steps_failed: 1,
            output: None,
            error: Some(ErrorInfo {
                code: "STEP_CRASHED".to_string(),
                message: "element not found".to_string(),
                node_id: Some("node-2".to_string()),
                retryable,
            }),
        }
    }

    // ── Scenario: happy path ──

    #[tokio::test]
    async fn happy_path_produces_exact_event_sequence() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.root_run_id, run.id);
        assert_eq!(run.counters.total_steps, 3);

        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        let assign = h.claim_and_lease(&profile).await.unwrap();
        assert_eq!(assign.plan_hash, PLAN_HASH);
        assert_eq!(assign.retry_attempt, 0);

        let leased = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(leased.status, RunStatus::Leased);
        assert_eq!(leased.runner_id, Some(profile.runner_id));

        // Runner streams three steps.
        h.engine.mark_started(run.id).await.unwrap();
        for i in 0..3u32 {
            h.engine
                .record_step_event(
                    run.id,
                    EventKind::StepStart,
                    Some(format!("step-{i}")),
                    Some(format!("node-{i}")),
                    json!({"index": i}),
                )
                .await
                .unwrap();
            h.engine
                .record_progress(
                    run.id,
                    &ProgressUpdate {
                        completed_steps: Some(i + 1),
                        progress_pct: Some(((i + 1) * 33) as u8),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            h.engine
                .record_step_event(
                    run.id,
                    EventKind::StepEnd,
                    Some(format!("step-{i}")),
                    Some(format!("node-{i}")),
                    json!({"index": i}),
                )
                .await
                .unwrap();
        }

        let done = h
            .engine
            .complete(run.id, success_result(3, json!({"y": 2})))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.outputs, Some(json!({"y": 2})));
        assert_eq!(done.counters.completed_steps, 3);
        assert!(done.completed_at.unwrap() >= done.created_at);

        let kinds = h.event_kinds(run.id).await;
        assert_eq!(
            kinds,
            vec![
                EventKind::RunQueued,
                EventKind::RunLeased,
                EventKind::RunStarted,
                EventKind::StepStart,
                EventKind::StepEnd,
                EventKind::StepStart,
                EventKind::StepEnd,
                EventKind::StepStart,
                EventKind::StepEnd,
                EventKind::RunCompleted,
            ]
        );

        // Detail fetch carries inputs, outputs and the event count.
        let detail = h.engine.get_run(&h.ctx, run.id).await.unwrap();
        assert_eq!(detail.run.inputs, json!({"x": 1}));
        assert_eq!(detail.event_count, 10);
    }

    // ── Scenario: priority ordering ──

    #[tokio::test]
    async fn queue_assigns_by_priority_not_arrival() {
        let h = harness();
        let mut spec_a = h.spec();
        spec_a.priority = Some(Priority::Normal);
        let mut spec_b = h.spec();
        spec_b.priority = Some(Priority::Critical);
        let mut spec_c = h.spec();
        spec_c.priority = Some(Priority::High);

        let a = h.engine.create(&h.ctx, spec_a).await.unwrap();
        let b = h.engine.create(&h.ctx, spec_b).await.unwrap();
        let c = h.engine.create(&h.ctx, spec_c).await.unwrap();

        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        let first = h.claim_and_lease(&profile).await.unwrap();
        let second = h.claim_and_lease(&profile).await.unwrap();
        let third = h.claim_and_lease(&profile).await.unwrap();

        assert_eq!(
            [first.run_id, second.run_id, third.run_id],
            [b.id, c.id, a.id]
        );
    }

    // ── Scenario: retry with backoff ──

    #[tokio::test]
    async fn retry_backoff_doubles_then_fails_terminally() {
        let h = harness();
        let mut spec = h.spec();
        spec.retry = Some(RetryPolicy {
            max_retries: 2,
            retry_delay_seconds: 10,
            backoff_multiplier: 2.0,
            max_delay_seconds: 60,
        });
        let run = h.engine.create(&h.ctx, spec).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;

        // Attempt 1 fails → scheduled ~10s out, retry_count still 0.
        h.claim_and_lease(&profile).await.unwrap();
        let t0 = now_ms();
        let scheduled = h.engine.complete(run.id, failed_result(true)).await.unwrap();
        assert_eq!(scheduled.status, RunStatus::RetryScheduled);
        assert_eq!(scheduled.retry_count, 0);
        let next = scheduled.next_retry_at.unwrap();
        assert!((next - t0 - 10_000).abs() < 1_500, "next={next} t0={t0}");
        assert_eq!(scheduled.retry_history.len(), 1);

        // Tick promotes: retry_count becomes 1.
        h.engine.promote_retry(&scheduled).await.unwrap();
        let queued = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(queued.status, RunStatus::Queued);
        assert_eq!(queued.retry_count, 1);

        // The delayed entry only surfaces once available_at passes.
        let entry = h
            .engine
            .queue()
            .claim(&profile, next + 1)
            .await
            .unwrap()
            .expect("entry should be claimable after the delay");
        h.engine.lease(entry.run_id, &profile).await.unwrap();

        // Attempt 2 fails → delay doubles to ~20s.
        let t1 = now_ms();
        let scheduled = h.engine.complete(run.id, failed_result(true)).await.unwrap();
        assert_eq!(scheduled.status, RunStatus::RetryScheduled);
        let next2 = scheduled.next_retry_at.unwrap();
        assert!((next2 - t1 - 20_000).abs() < 1_500, "next2={next2} t1={t1}");

        h.engine.promote_retry(&scheduled).await.unwrap();
        let entry = h
            .engine
            .queue()
            .claim(&profile, next2 + 1)
            .await
            .unwrap()
            .unwrap();
        h.engine.lease(entry.run_id, &profile).await.unwrap();

        // Attempt 3: retries exhausted → terminal FAILED.
        let failed = h.engine.complete(run.id, failed_result(true)).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some("STEP_CRASHED"));
        assert_eq!(failed.retry_count, 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_skips_retry_pipeline() {
        let h = harness();
        let mut spec = h.spec();
        spec.retry = Some(RetryPolicy {
            max_retries: 3,
            ..Default::default()
        });
        let run = h.engine.create(&h.ctx, spec).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();

        let failed = h.engine.complete(run.id, failed_result(false)).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
    }

    // ── Scenario: HITL approve ──

    #[tokio::test]
    async fn hitl_approve_round_trip() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, mut rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.registry.assign_job(profile.runner_id, run.id);
        h.engine.mark_started(run.id).await.unwrap();

        let request = h
            .engine
            .request_hitl(&HitlRequestPayload {
                job_id: run.id,
                run_id: run.id,
                step_id: Some("step-1".to_string()),
                node_id: Some("approval-node".to_string()),
                title: "Approve payment".to_string(),
                message: None,
                allowed_actions: vec![HitlAction::Approve, HitlAction::Reject],
                data_modification_allowed: false,
                deadline: None,
                approver_ids: vec!["approver-1".to_string()],
            })
            .await
            .unwrap();

        let waiting = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, RunStatus::WaitingApproval);
        assert_eq!(waiting.active_hitl_id, Some(request.id));

        // Someone outside the approver list is refused.
        let stranger = RequestContext::new(h.ctx.tenant_id, "mallory");
        let err = h
            .engine
            .resolve_hitl(
                request.id,
                &stranger,
                HitlDecision {
                    action: HitlAction::Approve,
                    comments: None,
                    modified_data: None,
                    escalate_to: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        let approver = RequestContext::new(h.ctx.tenant_id, "approver-1");
        let resolved = h
            .engine
            .resolve_hitl(
                request.id,
                &approver,
                HitlDecision {
                    action: HitlAction::Approve,
                    comments: Some("looks right".to_string()),
                    modified_data: None,
                    escalate_to: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, HitlStatus::Approved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("approver-1"));
        assert_eq!(resolved.audit_trail.len(), 2);

        let resumed = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(resumed.status, RunStatus::Running);
        assert_eq!(resumed.active_hitl_id, None);

        let kinds = h.event_kinds(run.id).await;
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::HitlRequested)
                .count(),
            1
        );
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::HitlApproved)
                .count(),
            1
        );

        // The runner was told to resume.
        let mut saw_resume = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, ServerMessage::HitlResolved(_)) {
                saw_resume = true;
            }
        }
        assert!(saw_resume);

        // A second resolution attempt is rejected.
        let err = h
            .engine
            .resolve_hitl(
                request.id,
                &approver,
                HitlDecision {
                    action: HitlAction::Approve,
                    comments: None,
                    modified_data: None,
                    escalate_to: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyResolved(HitlStatus::Approved)));
    }

    #[tokio::test]
    async fn hitl_reject_is_terminal() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.engine.mark_started(run.id).await.unwrap();

        let request = h
            .engine
            .request_hitl(&HitlRequestPayload {
                job_id: run.id,
                run_id: run.id,
                step_id: None,
                node_id: None,
                title: "Approve".to_string(),
                message: None,
                allowed_actions: vec![],
                data_modification_allowed: false,
                deadline: None,
                approver_ids: vec![],
            })
            .await
            .unwrap();

        let resolved = h
            .engine
            .resolve_hitl(
                request.id,
                &h.ctx,
                HitlDecision {
                    action: HitlAction::Reject,
                    comments: Some("not today".to_string()),
                    modified_data: None,
                    escalate_to: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, HitlStatus::Rejected);

        let rejected = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(rejected.status, RunStatus::Rejected);
        assert!(rejected.status.is_terminal());
    }

    #[tokio::test]
    async fn hitl_modify_replaces_inputs() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.engine.mark_started(run.id).await.unwrap();

        let request = h
            .engine
            .request_hitl(&HitlRequestPayload {
                job_id: run.id,
                run_id: run.id,
                step_id: None,
                node_id: None,
                title: "Check amount".to_string(),
                message: None,
                allowed_actions: vec![HitlAction::Approve, HitlAction::Modify],
                data_modification_allowed: true,
                deadline: None,
                approver_ids: vec![],
            })
            .await
            .unwrap();

        h.engine
            .resolve_hitl(
                request.id,
                &h.ctx,
                HitlDecision {
                    action: HitlAction::Modify,
                    comments: None,
                    modified_data: Some(json!({"x": 99})),
                    escalate_to: None,
                },
            )
            .await
            .unwrap();

        let modified = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(modified.status, RunStatus::Running);
        assert_eq!(modified.inputs, json!({"x": 99}));
    }

    #[tokio::test]
    async fn hitl_request_outside_running_is_rejected() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        // Still QUEUED — the runner may not open approvals yet.
        let err = h
            .engine
            .request_hitl(&HitlRequestPayload {
                job_id: run.id,
                run_id: run.id,
                step_id: None,
                node_id: None,
                title: "too early".to_string(),
                message: None,
                allowed_actions: vec![],
                data_modification_allowed: false,
                deadline: None,
                approver_ids: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { .. }));
    }

    // ── Scenario: orphan on disconnect ──

    #[tokio::test]
    async fn orphaned_run_reenters_retry_pipeline() {
        let h = harness();
        let mut spec = h.spec();
        spec.retry = Some(RetryPolicy {
            max_retries: 1,
            ..Default::default()
        });
        let run = h.engine.create(&h.ctx, spec).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.engine.mark_started(run.id).await.unwrap();

        let orphaned = h.engine.orphan(run.id).await.unwrap();
        assert_eq!(orphaned.status, RunStatus::RetryScheduled);
        assert_eq!(orphaned.error_code.as_deref(), Some(RUNNER_DISCONNECTED));
        assert_eq!(orphaned.runner_id, None);

        h.engine.promote_retry(&orphaned).await.unwrap();
        let queued = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(queued.status, RunStatus::Queued);
        assert_eq!(queued.retry_count, 1);
    }

    #[tokio::test]
    async fn orphan_with_no_retries_left_fails_terminally() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();

        let failed = h.engine.orphan(run.id).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some(RUNNER_DISCONNECTED));
    }

    // ── Scenario: timeout ──

    #[tokio::test]
    async fn timeout_is_terminal_and_late_results_are_discarded() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, mut rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.registry.assign_job(profile.runner_id, run.id);

        h.engine.timeout(run.id).await.unwrap();
        let timed_out = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(timed_out.status, RunStatus::TimedOut);
        assert_eq!(timed_out.error_code.as_deref(), Some(TIMEOUT));

        // job:cancel was dispatched.
        let mut saw_cancel = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, ServerMessage::Cancel(_)) {
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);

        // A late result bounces with ILLEGAL_STATE and changes nothing.
        let events_before = h.event_kinds(run.id).await.len();
        let err = h
            .engine
            .complete(run.id, success_result(3, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { .. }));
        let after = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(after.status, RunStatus::TimedOut);
        assert_eq!(h.event_kinds(run.id).await.len(), events_before);

        // Timeout is idempotent across racing tick leaders.
        h.engine.timeout(run.id).await.unwrap();
    }

    // ── Cancellation ──

    #[tokio::test]
    async fn cancel_twice_yields_one_event() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();

        let first = h
            .engine
            .cancel(run.id, "tester", Some("mind changed".to_string()), false)
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Cancelled);

        let second = h.engine.cancel(run.id, "tester", None, false).await.unwrap();
        assert_eq!(second.status, RunStatus::Cancelled);

        let cancel_events = h
            .event_kinds(run.id)
            .await
            .iter()
            .filter(|k| **k == EventKind::RunCancelled)
            .count();
        assert_eq!(cancel_events, 1);

        // The queue entry is gone.
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        assert!(h.claim_and_lease(&profile).await.is_none());
    }

    #[tokio::test]
    async fn cancel_cascades_to_children() {
        let h = harness();
        let parent = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let mut child_spec = h.spec();
        child_spec.parent_run_id = Some(parent.id);
        let child = h.engine.create(&h.ctx, child_spec).await.unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.root_run_id, parent.id);

        h.engine
            .cancel(parent.id, "tester", None, true)
            .await
            .unwrap();

        let child_after = h.store.load_run(child.id).await.unwrap().unwrap();
        assert_eq!(child_after.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_succeeded_run_is_illegal() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.engine
            .complete(run.id, success_result(3, json!({})))
            .await
            .unwrap();

        let err = h.engine.cancel(run.id, "tester", None, false).await.unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { .. }));
    }

    // ── Pause / resume ──

    #[tokio::test]
    async fn pause_resume_round_trip() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, mut rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.registry.assign_job(profile.runner_id, run.id);
        h.engine.mark_started(run.id).await.unwrap();

        let paused = h
            .engine
            .pause(run.id, "operator", Some("maintenance".to_string()))
            .await
            .unwrap();
        assert_eq!(paused.status, RunStatus::Paused);

        let resumed = h.engine.resume(run.id, "operator").await.unwrap();
        assert_eq!(resumed.status, RunStatus::Running);

        let frames: Vec<ServerMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(frames.iter().any(|m| matches!(m, ServerMessage::Pause(_))));
        assert!(frames.iter().any(|m| matches!(m, ServerMessage::Resume(_))));
    }

    #[tokio::test]
    async fn pause_from_queued_is_illegal() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let err = h.engine.pause(run.id, "operator", None).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::IllegalState {
                current: RunStatus::Queued,
                ..
            }
        ));
    }

    // ── Create-time validation ──

    #[tokio::test]
    async fn depth_limit_rejects_before_writing() {
        let h = harness();
        let mut parent_id = None;
        // Build a chain right up to the depth limit.
        for _ in 0..=MAX_RUN_DEPTH {
            let mut spec = h.spec();
            spec.parent_run_id = parent_id;
            let run = h.engine.create(&h.ctx, spec).await.unwrap();
            parent_id = Some(run.id);
        }
        let mut over = h.spec();
        over.parent_run_id = parent_id;
        let err = h.engine.create(&h.ctx, over).await.unwrap_err();
        assert!(matches!(err, CoreError::DepthExceeded { depth: 11, .. }));
    }

    #[tokio::test]
    async fn concurrency_quota_is_enforced() {
        let h = harness();
        // Rebuild the engine with a tight quota.
        let store: Arc<dyn RunStore> = h.store.clone();
        let engine = LifecycleEngine::new(
            store.clone(),
            Arc::new(RunQueue::new(store)),
            Arc::new(EventBus::new()),
            h.registry.clone(),
            {
                let catalog = StaticCatalog::new();
                catalog.insert(BotVersion {
                    bot_id: h.bot_id,
                    version_id: h.version_id,
                    state: BotVersionState::Published,
                    plan_hash: PLAN_HASH.to_string(),
                    package_url: "https://packages.test/bot.tgz".to_string(),
                    total_steps: 3,
                    required_capabilities: vec![],
                    default_timeout_seconds: None,
                });
                Arc::new(catalog)
            },
            Arc::new(NoSecrets),
            Arc::new(NoopNotifier),
            CoreConfig {
                max_concurrent_runs: 1,
                ..Default::default()
            },
        );

        engine.create(&h.ctx, h.spec()).await.unwrap();
        let err = engine.create(&h.ctx, h.spec()).await.unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn draft_bot_version_is_not_executable() {
        let h = harness();
        let draft_bot = Uuid::now_v7();
        let draft_version = Uuid::now_v7();
        // A harness-side catalog only knows the published bot; register the
        // draft through a dedicated engine.
        let catalog = StaticCatalog::new();
        catalog.insert(BotVersion {
            bot_id: draft_bot,
            version_id: draft_version,
            state: BotVersionState::Draft,
            plan_hash: String::new(),
            package_url: String::new(),
            total_steps: 0,
            required_capabilities: vec![],
            default_timeout_seconds: None,
        });
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let engine = LifecycleEngine::new(
            store.clone(),
            Arc::new(RunQueue::new(store)),
            Arc::new(EventBus::new()),
            Arc::new(RunnerRegistry::new()),
            Arc::new(catalog),
            Arc::new(NoSecrets),
            Arc::new(NoopNotifier),
            CoreConfig::default(),
        );

        let err = engine
            .create(
                &h.ctx,
                RunSpec {
                    bot_id: draft_bot,
                    bot_version_id: Some(draft_version),
                    inputs: json!({}),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BotNotCompiled(_)));
    }

    // ── Lease bookkeeping ──

    #[tokio::test]
    async fn release_lease_returns_run_to_queue() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();

        h.engine.release_lease(run.id).await.unwrap();
        let back = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(back.status, RunStatus::Queued);
        assert_eq!(back.runner_id, None);

        // It can be leased again.
        let assign = h.claim_and_lease(&profile).await.unwrap();
        assert_eq!(assign.run_id, run.id);
    }

    #[tokio::test]
    async fn lease_promotes_retry_when_claim_outruns_tick() {
        let h = harness();
        let mut spec = h.spec();
        spec.retry = Some(RetryPolicy {
            max_retries: 1,
            retry_delay_seconds: 0,
            ..Default::default()
        });
        let run = h.engine.create(&h.ctx, spec).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        let scheduled = h.engine.complete(run.id, failed_result(true)).await.unwrap();
        assert_eq!(scheduled.status, RunStatus::RetryScheduled);

        // Zero delay: the entry is immediately claimable, ahead of any tick.
        let assign = h.claim_and_lease(&profile).await.unwrap();
        assert_eq!(assign.run_id, run.id);
        assert_eq!(assign.retry_attempt, 1);
        let leased = h.store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(leased.status, RunStatus::Leased);
    }

    // ── Manual retry ──

    #[tokio::test]
    async fn retry_run_builds_a_fresh_run_from_failed() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.engine.complete(run.id, failed_result(false)).await.unwrap();

        let fresh = h
            .engine
            .retry_run(&h.ctx, run.id, Some(json!({"x": 2})))
            .await
            .unwrap();
        assert_ne!(fresh.id, run.id);
        assert_eq!(fresh.status, RunStatus::Queued);
        assert_eq!(fresh.inputs, json!({"x": 2}));
        assert_eq!(fresh.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_run_refuses_succeeded() {
        let h = harness();
        let run = h.engine.create(&h.ctx, h.spec()).await.unwrap();
        let (profile, _rx) = h.connect_runner(vec!["web.browser".to_string()]).await;
        h.claim_and_lease(&profile).await.unwrap();
        h.engine
            .complete(run.id, success_result(3, json!({})))
            .await
            .unwrap();

        let err = h.engine.retry_run(&h.ctx, run.id, None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotRetriable(RunStatus::Succeeded)));
    }

    // ── API keys ──

    #[test]
    fn minted_keys_are_tagged_and_hash_deterministically() {
        let (key, hash) = mint_api_key();
        assert!(key.starts_with("skr_"));
        assert_eq!(key.len(), 4 + 64); // tag + 32 bytes hex
        assert_eq!(hash, hash_api_key(&key));
        assert_ne!(hash, hash_api_key("skr_other"));
    }
}
