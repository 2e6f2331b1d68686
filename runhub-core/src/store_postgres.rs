use crate::events::RunEvent;
use crate::store::{RunPatch, RunStore};
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

/// Serialize an enum to its TEXT column form (the serde string name).
fn to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(anyhow!("expected string-serializable enum, got {other}")),
    }
}

/// Parse a TEXT column back into its enum.
fn from_text<T: DeserializeOwned>(text: String) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(text)).map_err(Into::into)
}

fn run_from_row(row: &PgRow) -> Result<Run> {
    let priority_rank: i16 = row.get("priority");
    Ok(Run {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        bot_id: row.get("bot_id"),
        bot_version_id: row.get("bot_version_id"),
        plan_hash: row.get("plan_hash"),
        status: from_text(row.get("status"))?,
        priority: Priority::from_rank(priority_rank)
            .ok_or_else(|| anyhow!("invalid priority rank {priority_rank}"))?,
        trigger_type: from_text(row.get("trigger_type"))?,
        triggered_by: row.get("triggered_by"),
        parent_run_id: row.get("parent_run_id"),
        root_run_id: row.get("root_run_id"),
        depth: row.get::<i16, _>("depth") as u16,
        inputs: row.get("inputs"),
        outputs: row.get("outputs"),
        runner_id: row.get("runner_id"),
        selector: serde_json::from_value(row.get("selector")).context("selector")?,
        timeout_seconds: row.get::<i32, _>("timeout_seconds") as u32,
        timeout_at: row.get("timeout_at"),
        retry: serde_json::from_value(row.get("retry")).context("retry policy")?,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        next_retry_at: row.get("next_retry_at"),
        retry_history: serde_json::from_value(row.get("retry_history")).context("retry history")?,
        created_at: row.get("created_at"),
        queued_at: row.get("queued_at"),
        leased_at: row.get("leased_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        queue_duration_ms: row.get("queue_duration_ms"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        cancel_reason: row.get("cancel_reason"),
        hitl_config: row
            .get::<Option<serde_json::Value>, _>("hitl_config")
            .map(serde_json::from_value)
            .transpose()
            .context("hitl config")?,
        active_hitl_id: row.get("active_hitl_id"),
        requires_approval: row.get("requires_approval"),
        tags: serde_json::from_value(row.get("tags")).context("tags")?,
        labels: serde_json::from_value(row.get("labels")).context("labels")?,
        counters: RunCounters {
            total_steps: row.get::<i32, _>("total_steps") as u32,
            completed_steps: row.get::<i32, _>("completed_steps") as u32,
            failed_steps: row.get::<i32, _>("failed_steps") as u32,
            progress_pct: row.get::<i16, _>("progress_pct") as u8,
            memory_peak_mb: row.get::<i32, _>("memory_peak_mb") as u32,
            current_node_id: row.get("current_node_id"),
        },
    })
}

fn event_from_row(row: &PgRow) -> Result<RunEvent> {
    Ok(RunEvent {
        id: row.get("id"),
        run_id: row.get("run_id"),
        tenant_id: row.get("tenant_id"),
        seq: row.get::<i64, _>("seq") as u64,
        kind: from_text(row.get("kind"))?,
        severity: from_text(row.get("severity"))?,
        step_id: row.get("step_id"),
        node_id: row.get("node_id"),
        payload: row.get("payload"),
        timestamp: row.get("timestamp"),
    })
}

fn log_from_row(row: &PgRow) -> Result<RunLog> {
    Ok(RunLog {
        id: row.get("id"),
        run_id: row.get("run_id"),
        tenant_id: row.get("tenant_id"),
        level: from_text(row.get("level"))?,
        source: row.get("source"),
        step_id: row.get("step_id"),
        message: row.get("message"),
        data: row.get("data"),
        timestamp: row.get("timestamp"),
    })
}

fn hitl_from_row(row: &PgRow) -> Result<HitlRequest> {
    Ok(HitlRequest {
        id: row.get("id"),
        run_id: row.get("run_id"),
        tenant_id: row.get("tenant_id"),
        step_id: row.get("step_id"),
        node_id: row.get("node_id"),
        status: from_text(row.get("status"))?,
        title: row.get("title"),
        message: row.get("message"),
        allowed_actions: serde_json::from_value(row.get("allowed_actions"))
            .context("allowed actions")?,
        data_modification_allowed: row.get("data_modification_allowed"),
        assigned_to: row.get("assigned_to"),
        approver_ids: serde_json::from_value(row.get("approver_ids")).context("approver ids")?,
        deadline: row.get("deadline"),
        auto_expire: row.get("auto_expire"),
        action: row
            .get::<Option<String>, _>("action")
            .map(from_text)
            .transpose()?,
        resolved_by: row.get("resolved_by"),
        resolved_at: row.get("resolved_at"),
        comments: row.get("comments"),
        modified_data: row.get("modified_data"),
        audit_trail: serde_json::from_value(row.get("audit_trail")).context("audit trail")?,
        created_at: row.get("created_at"),
    })
}

fn runner_from_row(row: &PgRow) -> Result<Runner> {
    Ok(Runner {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        api_key_hash: row.get("api_key_hash"),
        status: from_text(row.get("status"))?,
        capabilities: serde_json::from_value(row.get("capabilities")).context("capabilities")?,
        labels: serde_json::from_value(row.get("labels")).context("labels")?,
        max_concurrent_jobs: row.get::<i32, _>("max_concurrent_jobs") as u32,
        last_heartbeat_at: row.get("last_heartbeat_at"),
        vm_config: row
            .get::<Option<serde_json::Value>, _>("vm_config")
            .map(serde_json::from_value)
            .transpose()
            .context("vm config")?,
        registered_at: row.get("registered_at"),
    })
}

fn entry_from_row(row: &PgRow) -> Result<QueueEntry> {
    let priority_rank: i16 = row.get("priority");
    Ok(QueueEntry {
        run_id: row.get("run_id"),
        tenant_id: row.get("tenant_id"),
        priority: Priority::from_rank(priority_rank)
            .ok_or_else(|| anyhow!("invalid priority rank {priority_rank}"))?,
        enqueued_at: row.get("enqueued_at"),
        available_at: row.get("available_at"),
        selector: serde_json::from_value(row.get("selector")).context("selector")?,
    })
}

/// PostgreSQL-backed implementation of `RunStore`.
pub struct PostgresRunStore {
    pool: sqlx::PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run runhub migrations")?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    // ── Runs ──

    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, tenant_id, bot_id, bot_version_id, plan_hash, status,
                priority, trigger_type, triggered_by, parent_run_id,
                root_run_id, depth, inputs, outputs, runner_id, selector,
                timeout_seconds, timeout_at, retry, retry_count,
                next_retry_at, retry_history, created_at, queued_at,
                leased_at, started_at, completed_at, queue_duration_ms,
                error_code, error_message, cancel_reason, hitl_config,
                active_hitl_id, requires_approval, tags, labels,
                total_steps, completed_steps, failed_steps, progress_pct,
                memory_peak_mb, current_node_id
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26,
                $27, $28, $29, $30, $31, $32, $33, $34, $35, $36, $37, $38,
                $39, $40, $41, $42
            )
            "#,
        )
        .bind(run.id)
        .bind(run.tenant_id)
        .bind(run.bot_id)
        .bind(run.bot_version_id)
        .bind(&run.plan_hash)
        .bind(run.status.as_str())
        .bind(run.priority.rank())
        .bind(to_text(&run.trigger_type)?)
        .bind(&run.triggered_by)
        .bind(run.parent_run_id)
        .bind(run.root_run_id)
        .bind(run.depth as i16)
        .bind(&run.inputs)
        .bind(&run.outputs)
        .bind(run.runner_id)
        .bind(serde_json::to_value(&run.selector)?)
        .bind(run.timeout_seconds as i32)
        .bind(run.timeout_at)
        .bind(serde_json::to_value(&run.retry)?)
        .bind(run.retry_count as i32)
        .bind(run.next_retry_at)
        .bind(serde_json::to_value(&run.retry_history)?)
        .bind(run.created_at)
        .bind(run.queued_at)
        .bind(run.leased_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.queue_duration_ms)
        .bind(&run.error_code)
        .bind(&run.error_message)
        .bind(&run.cancel_reason)
        .bind(
            run.hitl_config
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(run.active_hitl_id)
        .bind(run.requires_approval)
        .bind(serde_json::to_value(&run.tags)?)
        .bind(serde_json::to_value(&run.labels)?)
        .bind(run.counters.total_steps as i32)
        .bind(run.counters.completed_steps as i32)
        .bind(run.counters.failed_steps as i32)
        .bind(run.counters.progress_pct as i16)
        .bind(run.counters.memory_peak_mb as i32)
        .bind(&run.counters.current_node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn conditional_update_run(
        &self,
        id: Uuid,
        where_status_in: &[RunStatus],
        patch: &RunPatch,
    ) -> Result<u64> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("UPDATE runs SET ");
        let mut any = false;
        let mut set = |qb: &mut QueryBuilder<sqlx::Postgres>, any: &mut bool| {
            if *any {
                qb.push(", ");
            }
            *any = true;
        };

        if let Some(status) = patch.status {
            set(&mut qb, &mut any);
            qb.push("status = ").push_bind(status.as_str());
        }
        if let Some(at) = patch.queued_at {
            set(&mut qb, &mut any);
            qb.push("queued_at = ").push_bind(at);
        }
        if let Some(at) = patch.leased_at {
            set(&mut qb, &mut any);
            qb.push("leased_at = ").push_bind(at);
        }
        if let Some(at) = patch.started_at {
            set(&mut qb, &mut any);
            qb.push("started_at = ").push_bind(at);
        }
        if let Some(at) = patch.completed_at {
            set(&mut qb, &mut any);
            qb.push("completed_at = ").push_bind(at);
        }
        if let Some(ms) = patch.queue_duration_ms {
            set(&mut qb, &mut any);
            qb.push("queue_duration_ms = ").push_bind(ms);
        }
        if let Some(runner_id) = patch.runner_id {
            set(&mut qb, &mut any);
            qb.push("runner_id = ").push_bind(runner_id);
        }
        if let Some(ref inputs) = patch.inputs {
            set(&mut qb, &mut any);
            qb.push("inputs = ").push_bind(inputs.clone());
        }
        if let Some(ref outputs) = patch.outputs {
            set(&mut qb, &mut any);
            qb.push("outputs = ").push_bind(outputs.clone());
        }
        if let Some(ref code) = patch.error_code {
            set(&mut qb, &mut any);
            qb.push("error_code = ").push_bind(code.clone());
        }
        if let Some(ref message) = patch.error_message {
            set(&mut qb, &mut any);
            qb.push("error_message = ").push_bind(message.clone());
        }
        if let Some(ref reason) = patch.cancel_reason {
            set(&mut qb, &mut any);
            qb.push("cancel_reason = ").push_bind(reason.clone());
        }
        if let Some(count) = patch.retry_count {
            set(&mut qb, &mut any);
            qb.push("retry_count = ").push_bind(count as i32);
        }
        if let Some(at) = patch.next_retry_at {
            set(&mut qb, &mut any);
            qb.push("next_retry_at = ").push_bind(at);
        }
        if let Some(ref record) = patch.push_retry_record {
            set(&mut qb, &mut any);
            qb.push("retry_history = retry_history || ")
                .push_bind(serde_json::to_value(record)?)
                .push("::jsonb");
        }
        if let Some(hitl) = patch.active_hitl_id {
            set(&mut qb, &mut any);
            qb.push("active_hitl_id = ").push_bind(hitl);
        }

        if !any {
            return Ok(0);
        }

        qb.push(" WHERE id = ").push_bind(id).push(" AND status IN (");
        {
            let mut sep = qb.separated(", ");
            for status in where_status_in {
                sep.push_bind(status.as_str());
            }
        }
        qb.push(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn update_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                total_steps = GREATEST(total_steps, COALESCE($2, total_steps)),
                completed_steps = GREATEST(completed_steps, COALESCE($3, completed_steps)),
                failed_steps = GREATEST(failed_steps, COALESCE($4, failed_steps)),
                progress_pct = GREATEST(progress_pct, COALESCE($5, progress_pct)),
                memory_peak_mb = GREATEST(memory_peak_mb, COALESCE($6, memory_peak_mb)),
                current_node_id = COALESCE($7, current_node_id)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.total_steps.map(|v| v as i32))
        .bind(update.completed_steps.map(|v| v as i32))
        .bind(update.failed_steps.map(|v| v as i32))
        .bind(update.progress_pct.map(|v| v.min(100) as i16))
        .bind(update.memory_peak_mb.map(|v| v as i32))
        .bind(&update.current_node_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("run not found: {id}"));
        }
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Page<Run>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT *, COUNT(*) OVER () AS total FROM runs WHERE TRUE");
        if let Some(tenant_id) = filter.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(bot_id) = filter.bot_id {
            qb.push(" AND bot_id = ").push_bind(bot_id);
        }
        if let Some(parent) = filter.parent_run_id {
            qb.push(" AND parent_run_id = ").push_bind(parent);
        }
        if let Some(runner_id) = filter.runner_id {
            qb.push(" AND runner_id = ").push_bind(runner_id);
        }
        if let Some(ref tag) = filter.tag {
            qb.push(" AND tags @> ")
                .push_bind(serde_json::json!([tag]))
                .push("::jsonb");
        }
        qb.push(" ORDER BY created_at DESC");
        qb.push(" LIMIT ")
            .push_bind(filter.limit.unwrap_or(100) as i64);
        qb.push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0) as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let total = rows
            .first()
            .map(|r| r.get::<i64, _>("total") as u64)
            .unwrap_or(0);
        let items = rows.iter().map(run_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    async fn count_active_runs(&self, tenant_id: Uuid) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM runs WHERE tenant_id = $1 AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED', 'TIMED_OUT', 'REJECTED')",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn count_runs_created_since(&self, tenant_id: Uuid, since: Timestamp) -> Result<u64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM runs WHERE tenant_id = $1 AND created_at >= $2")
                .bind(tenant_id)
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn list_children(&self, parent_run_id: Uuid) -> Result<Vec<Run>> {
        let rows =
            sqlx::query("SELECT * FROM runs WHERE parent_run_id = $1 ORDER BY created_at")
                .bind(parent_run_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn count_children(&self, parent_run_id: Uuid) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM runs WHERE parent_run_id = $1")
            .bind(parent_run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn list_timed_out(&self, now: Timestamp, limit: usize) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE timeout_at <= $1
              AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED', 'TIMED_OUT', 'REJECTED')
            ORDER BY timeout_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_retry_due(&self, now: Timestamp, limit: usize) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE status = 'RETRY_SCHEDULED' AND next_retry_at <= $1
            ORDER BY next_retry_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    // ── Events ──

    async fn append_event(&self, event: &RunEvent) -> Result<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO run_events (
                id, run_id, tenant_id, seq, kind, severity, step_id, node_id,
                payload, timestamp
            )
            SELECT $1, $2, $3,
                   COALESCE((SELECT MAX(seq) FROM run_events WHERE run_id = $2), 0) + 1,
                   $4, $5, $6, $7, $8, $9
            RETURNING seq
            "#,
        )
        .bind(event.id)
        .bind(event.run_id)
        .bind(event.tenant_id)
        .bind(event.kind.as_str())
        .bind(to_text(&event.severity)?)
        .bind(&event.step_id)
        .bind(&event.node_id)
        .bind(&event.payload)
        .bind(event.timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("seq") as u64)
    }

    async fn list_events(&self, run_id: Uuid, filter: &EventFilter) -> Result<Page<RunEvent>> {
        let after_seq = filter.after_seq.unwrap_or(0) as i64;
        let rows = sqlx::query(
            r#"
            SELECT *, COUNT(*) OVER () AS total FROM run_events
            WHERE run_id = $1 AND seq > $2
            ORDER BY seq
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(run_id)
        .bind(after_seq)
        .bind(filter.limit.unwrap_or(100) as i64)
        .bind(filter.offset.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await?;
        let total = rows
            .first()
            .map(|r| r.get::<i64, _>("total") as u64)
            .unwrap_or(0);
        let items = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    async fn count_events(&self, run_id: Uuid) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM run_events WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    // ── Logs ──

    async fn append_logs(&self, logs: &[RunLog]) -> Result<()> {
        for log in logs {
            sqlx::query(
                r#"
                INSERT INTO run_logs (
                    id, run_id, tenant_id, level, source, step_id, message,
                    data, timestamp
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(log.id)
            .bind(log.run_id)
            .bind(log.tenant_id)
            .bind(to_text(&log.level)?)
            .bind(&log.source)
            .bind(&log.step_id)
            .bind(&log.message)
            .bind(&log.data)
            .bind(log.timestamp)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn list_logs(&self, run_id: Uuid, filter: &LogFilter) -> Result<Page<RunLog>> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "SELECT *, COUNT(*) OVER () AS total FROM run_logs WHERE run_id = ",
        );
        qb.push_bind(run_id);
        if let Some(min_level) = filter.min_level {
            // Levels sort textually nowhere near their severity; enumerate.
            let allowed: Vec<&str> = [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error]
                .iter()
                .filter(|l| **l >= min_level)
                .map(|l| match l {
                    LogLevel::Debug => "debug",
                    LogLevel::Info => "info",
                    LogLevel::Warn => "warn",
                    LogLevel::Error => "error",
                })
                .collect();
            qb.push(" AND level IN (");
            {
                let mut sep = qb.separated(", ");
                for level in allowed {
                    sep.push_bind(level);
                }
            }
            qb.push(")");
        }
        if let Some(ref step_id) = filter.step_id {
            qb.push(" AND step_id = ").push_bind(step_id.clone());
        }
        qb.push(" ORDER BY timestamp");
        qb.push(" LIMIT ")
            .push_bind(filter.limit.unwrap_or(100) as i64);
        qb.push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0) as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let total = rows
            .first()
            .map(|r| r.get::<i64, _>("total") as u64)
            .unwrap_or(0);
        let items = rows.iter().map(log_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    // ── HITL ──

    async fn insert_hitl(&self, request: &HitlRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hitl_requests (
                id, run_id, tenant_id, step_id, node_id, status, title,
                message, allowed_actions, data_modification_allowed,
                assigned_to, approver_ids, deadline, auto_expire, action,
                resolved_by, resolved_at, comments, modified_data,
                audit_trail, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21
            )
            "#,
        )
        .bind(request.id)
        .bind(request.run_id)
        .bind(request.tenant_id)
        .bind(&request.step_id)
        .bind(&request.node_id)
        .bind(to_text(&request.status)?)
        .bind(&request.title)
        .bind(&request.message)
        .bind(serde_json::to_value(&request.allowed_actions)?)
        .bind(request.data_modification_allowed)
        .bind(&request.assigned_to)
        .bind(serde_json::to_value(&request.approver_ids)?)
        .bind(request.deadline)
        .bind(request.auto_expire)
        .bind(request.action.as_ref().map(to_text).transpose()?)
        .bind(&request.resolved_by)
        .bind(request.resolved_at)
        .bind(&request.comments)
        .bind(&request.modified_data)
        .bind(serde_json::to_value(&request.audit_trail)?)
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_hitl(&self, id: Uuid) -> Result<Option<HitlRequest>> {
        let row = sqlx::query("SELECT * FROM hitl_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(hitl_from_row).transpose()
    }

    async fn resolve_hitl(&self, id: Uuid, resolution: &HitlResolution) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE hitl_requests SET
                status = $2, action = $3, resolved_by = $4, resolved_at = $5,
                comments = $6, modified_data = $7
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(to_text(&resolution.status)?)
        .bind(resolution.action.as_ref().map(to_text).transpose()?)
        .bind(&resolution.resolved_by)
        .bind(resolution.resolved_at)
        .bind(&resolution.comments)
        .bind(&resolution.modified_data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn escalate_hitl(&self, id: Uuid, assigned_to: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE hitl_requests SET assigned_to = $2, deadline = NULL
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(assigned_to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_hitl_audit(&self, id: Uuid, entry: &HitlAuditEntry) -> Result<()> {
        let result = sqlx::query(
            "UPDATE hitl_requests SET audit_trail = audit_trail || $2::jsonb WHERE id = $1",
        )
        .bind(id)
        .bind(serde_json::to_value(entry)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("hitl request not found: {id}"));
        }
        Ok(())
    }

    async fn pending_hitl_for_run(&self, run_id: Uuid) -> Result<Option<HitlRequest>> {
        let row = sqlx::query(
            "SELECT * FROM hitl_requests WHERE run_id = $1 AND status = 'PENDING' LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(hitl_from_row).transpose()
    }

    async fn list_hitl(&self, filter: &HitlFilter) -> Result<Page<HitlRequest>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT *, COUNT(*) OVER () AS total FROM hitl_requests WHERE TRUE");
        if let Some(tenant_id) = filter.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id);
        }
        if let Some(run_id) = filter.run_id {
            qb.push(" AND run_id = ").push_bind(run_id);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(to_text(&status)?);
        }
        if let Some(ref assigned_to) = filter.assigned_to {
            qb.push(" AND assigned_to = ").push_bind(assigned_to.clone());
        }
        qb.push(" ORDER BY created_at DESC");
        qb.push(" LIMIT ")
            .push_bind(filter.limit.unwrap_or(100) as i64);
        qb.push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0) as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let total = rows
            .first()
            .map(|r| r.get::<i64, _>("total") as u64)
            .unwrap_or(0);
        let items = rows.iter().map(hitl_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    async fn list_expired_hitl(&self, now: Timestamp, limit: usize) -> Result<Vec<HitlRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM hitl_requests
            WHERE status = 'PENDING' AND auto_expire AND deadline <= $1
            ORDER BY deadline
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(hitl_from_row).collect()
    }

    // ── Runners ──

    async fn insert_runner(&self, runner: &Runner) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runners (
                id, tenant_id, name, api_key_hash, status, capabilities,
                labels, max_concurrent_jobs, last_heartbeat_at, vm_config,
                registered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(runner.id)
        .bind(runner.tenant_id)
        .bind(&runner.name)
        .bind(&runner.api_key_hash)
        .bind(to_text(&runner.status)?)
        .bind(serde_json::to_value(&runner.capabilities)?)
        .bind(serde_json::to_value(&runner.labels)?)
        .bind(runner.max_concurrent_jobs as i32)
        .bind(runner.last_heartbeat_at)
        .bind(
            runner
                .vm_config
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(runner.registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_runner(&self, id: Uuid) -> Result<Option<Runner>> {
        let row = sqlx::query("SELECT * FROM runners WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(runner_from_row).transpose()
    }

    async fn find_runner_by_key_hash(&self, api_key_hash: &str) -> Result<Option<Runner>> {
        let row = sqlx::query("SELECT * FROM runners WHERE api_key_hash = $1")
            .bind(api_key_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(runner_from_row).transpose()
    }

    async fn update_runner_status(&self, id: Uuid, status: RunnerStatus) -> Result<()> {
        let result = sqlx::query("UPDATE runners SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(to_text(&status)?)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("runner not found: {id}"));
        }
        Ok(())
    }

    async fn record_heartbeat(&self, id: Uuid, at: Timestamp) -> Result<()> {
        let result = sqlx::query("UPDATE runners SET last_heartbeat_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("runner not found: {id}"));
        }
        Ok(())
    }

    async fn sweep_stale_runners(&self, cutoff: Timestamp, limit: usize) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE runners SET status = 'OFFLINE'
            WHERE id IN (
                SELECT id FROM runners
                WHERE status = 'ONLINE'
                  AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)
                LIMIT $2
            )
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn list_runners(&self, tenant_id: Uuid) -> Result<Vec<Runner>> {
        let rows = sqlx::query("SELECT * FROM runners WHERE tenant_id = $1 ORDER BY registered_at")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(runner_from_row).collect()
    }

    // ── Queue ──

    async fn queue_insert(&self, entry: &QueueEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_entries (
                run_id, tenant_id, priority, enqueued_at, available_at,
                selector, pinned_runner_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.run_id)
        .bind(entry.tenant_id)
        .bind(entry.priority.rank())
        .bind(entry.enqueued_at)
        .bind(entry.available_at)
        .bind(serde_json::to_value(&entry.selector)?)
        .bind(entry.selector.pinned_runner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_claim(
        &self,
        profile: &RunnerProfile,
        now: Timestamp,
    ) -> Result<Option<QueueEntry>> {
        // Atomic claim: pick the best matching row under SKIP LOCKED and
        // delete it in the same statement. Selector matching uses JSONB
        // containment; the pinned column short-circuits it.
        let labels = serde_json::to_value(&profile.labels)?;
        let capabilities = serde_json::to_value(&profile.capabilities)?;
        let row = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE run_id = (
                SELECT run_id FROM queue_entries
                WHERE available_at <= $1
                  AND tenant_id = $2
                  AND (
                      pinned_runner_id = $3
                      OR (
                          pinned_runner_id IS NULL
                          AND selector->'labels' <@ $4::jsonb
                          AND selector->'capabilities' <@ $5::jsonb
                      )
                  )
                ORDER BY priority, available_at, enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING run_id, tenant_id, priority, enqueued_at, available_at, selector
            "#,
        )
        .bind(now)
        .bind(profile.tenant_id)
        .bind(profile.runner_id)
        .bind(labels)
        .bind(capabilities)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn queue_remove(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn queue_pinned_waiting(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, tenant_id, priority, enqueued_at, available_at, selector
            FROM queue_entries
            WHERE pinned_runner_id IS NOT NULL
            ORDER BY enqueued_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    // ── Tick leadership ──

    async fn acquire_tick_lease(&self, holder: Uuid, ttl_ms: i64, now: Timestamp) -> Result<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO tick_lease (id, holder, expires_at)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE tick_lease.holder = EXCLUDED.holder
                   OR tick_lease.expires_at <= $3
            RETURNING holder
            "#,
        )
        .bind(holder)
        .bind(now + ttl_ms)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
