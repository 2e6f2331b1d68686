//! Runner gateway: one task per websocket session, a dispatcher task that
//! matches queued runs to idle runners, and a liveness monitor that evicts
//! silent sessions. The protocol logic lives in [`Session`] and is driven
//! entirely through channels, so the socket pump stays a thin adapter.

use crate::http::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use runhub_core::bus::{BusEvent, RUNNERS_TOPIC};
use runhub_core::engine::hash_api_key;
use runhub_core::error::CoreError;
use runhub_core::events::EventKind;
use runhub_core::registry::ConnectedRunner;
use runhub_core::types::*;
use runhub_core::wire::*;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub async fn runner_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

/// Why a session ended; drives cleanup and logging.
#[derive(Debug)]
pub enum SessionError {
    Protocol(String),
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            SessionError::Closed => write!(f, "session closed"),
        }
    }
}

/// Per-job step tracker: step boundaries are derived from changes of
/// `current_step.index` across progress frames.
#[derive(Default)]
struct JobTrack {
    current: Option<CurrentStep>,
    completed_steps: u32,
}

/// Authenticated session state and message handlers. All handlers are
/// synchronous with respect to this session (one task per session); cross-
/// session state lives in the registry.
pub struct Session {
    state: AppState,
    pub runner_id: Uuid,
    tenant_id: Uuid,
    pub session_id: Uuid,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    jobs: HashMap<Uuid, JobTrack>,
}

impl Session {
    /// Verify the auth frame, register the session (kicking any older one)
    /// and persist the runner as ONLINE. On failure the caller sends the
    /// reply and closes the socket.
    pub async fn authenticate(
        state: AppState,
        auth: AuthPayload,
    ) -> Result<(Session, mpsc::UnboundedReceiver<ServerMessage>), String> {
        let runner = match state
            .store
            .find_runner_by_key_hash(&hash_api_key(&auth.api_key))
            .await
        {
            Ok(Some(runner)) => runner,
            Ok(None) => return Err("unknown api key".to_string()),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "runner lookup failed");
                return Err("authentication unavailable".to_string());
            }
        };
        if runner.id != auth.runner_id {
            return Err("runner id does not match api key".to_string());
        }

        let now = now_ms();
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::now_v7();

        let mut profile = runner.profile();
        // The handshake advertises live capabilities; they win over the
        // registered snapshot.
        profile.capabilities = auth.capabilities.tags.clone();
        let max_jobs = if auth.capabilities.max_concurrent_jobs > 0 {
            auth.capabilities.max_concurrent_jobs.min(runner.max_concurrent_jobs)
        } else {
            runner.max_concurrent_jobs
        };

        let kicked = state.registry.register(ConnectedRunner {
            runner_id: runner.id,
            tenant_id: runner.tenant_id,
            session_id,
            sender: tx.clone(),
            profile,
            max_concurrent_jobs: max_jobs as usize,
            current_jobs: Vec::new(),
            last_heartbeat: now,
            connected_at: now,
            draining: false,
        });
        if let Some(old) = kicked {
            // Kick-old semantics: the replaced session pump sees Shutdown
            // and closes its socket.
            let _ = old.send(ServerMessage::Shutdown {
                reason: "superseded by a newer session".to_string(),
            });
            info!(runner_id = %runner.id, "existing session kicked");
        }

        if let Err(err) = state.store.record_heartbeat(runner.id, now).await {
            warn!(runner_id = %runner.id, error = %format!("{err:#}"), "heartbeat persist failed");
        }
        if let Err(err) = state
            .store
            .update_runner_status(runner.id, RunnerStatus::Online)
            .await
        {
            warn!(runner_id = %runner.id, error = %format!("{err:#}"), "status persist failed");
        }
        state.bus.publish(
            RUNNERS_TOPIC,
            BusEvent::new(
                RUNNERS_TOPIC,
                EventKind::RunnerOnline.as_str(),
                json!({ "runnerId": runner.id, "version": auth.version }),
            ),
        );
        info!(runner_id = %runner.id, tenant_id = %runner.tenant_id, "runner online");

        Ok((
            Session {
                state,
                runner_id: runner.id,
                tenant_id: runner.tenant_id,
                session_id,
                outbound: tx,
                jobs: HashMap::new(),
            },
            rx,
        ))
    }

    fn reply(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    /// Dispatch one inbound frame. `Err` tears the session down.
    pub async fn handle(&mut self, message: RunnerMessage) -> Result<(), SessionError> {
        match message {
            RunnerMessage::Auth(_) => Err(SessionError::Protocol(
                "duplicate auth frame".to_string(),
            )),
            RunnerMessage::Heartbeat(hb) => {
                self.on_heartbeat(hb).await;
                Ok(())
            }
            RunnerMessage::Progress(progress) => self.on_progress(progress).await,
            RunnerMessage::Result(result) => self.on_result(result).await,
            RunnerMessage::Hitl(request) => self.on_hitl(request).await,
        }
    }

    async fn on_heartbeat(&mut self, hb: HeartbeatPayload) {
        let now = now_ms();
        self.state.registry.touch_heartbeat(self.runner_id, now);
        if let Err(err) = self.state.store.record_heartbeat(self.runner_id, now).await {
            warn!(runner_id = %self.runner_id, error = %format!("{err:#}"), "heartbeat persist failed");
        }

        let draining = hb.status == HeartbeatState::Draining;
        self.state.registry.set_draining(self.runner_id, draining);
        let status = if draining {
            RunnerStatus::Draining
        } else if self.state.registry.at_capacity(self.runner_id) {
            RunnerStatus::Busy
        } else {
            RunnerStatus::Online
        };
        if let Err(err) = self.state.store.update_runner_status(self.runner_id, status).await {
            warn!(runner_id = %self.runner_id, error = %format!("{err:#}"), "status persist failed");
        }

        self.reply(ServerMessage::HeartbeatAck { success: true });
        if !draining {
            // Capacity may have opened up (e.g. draining ended).
            self.state.engine.queue().kick();
        }
    }

    async fn on_progress(&mut self, progress: ProgressPayload) -> Result<(), SessionError> {
        if !self
            .state
            .registry
            .owns_job(self.runner_id, progress.run_id)
        {
            return Err(SessionError::Protocol(format!(
                "progress for job {} this session does not own",
                progress.run_id
            )));
        }
        let run_id = progress.run_id;

        // First frame flips LEASED → RUNNING; later calls are no-ops.
        if let Err(err) = self.state.engine.mark_started(run_id).await {
            debug!(run_id = %run_id, error = %err, "mark_started skipped");
        }

        // Step boundaries from index changes.
        let track = self.jobs.entry(run_id).or_default();
        let mut completed = track.completed_steps;
        if let Some(step) = progress.current_step.clone() {
            let boundary = match &track.current {
                None => true,
                Some(prev) => prev.index != step.index,
            };
            if boundary {
                if let Some(prev) = track.current.take() {
                    completed += 1;
                    let _ = self
                        .state
                        .engine
                        .record_step_event(
                            run_id,
                            EventKind::StepEnd,
                            Some(format!("step-{}", prev.index)),
                            Some(prev.node_id.clone()),
                            json!({ "index": prev.index }),
                        )
                        .await;
                }
                let _ = self
                    .state
                    .engine
                    .record_step_event(
                        run_id,
                        EventKind::StepStart,
                        Some(format!("step-{}", step.index)),
                        Some(step.node_id.clone()),
                        json!({ "index": step.index, "nodeType": step.node_type }),
                    )
                    .await;
                track.current = Some(step);
                track.completed_steps = completed;
            }
        }

        if let Some(ref error) = progress.error {
            let _ = self
                .state
                .engine
                .record_step_event(
                    run_id,
                    EventKind::StepError,
                    None,
                    error.node_id.clone(),
                    json!({ "errorCode": error.code, "errorMessage": error.message }),
                )
                .await;
        }

        let current_node = self
            .jobs
            .get(&run_id)
            .and_then(|t| t.current.as_ref())
            .map(|s| s.node_id.clone());
        if let Err(err) = self
            .state
            .engine
            .record_progress(
                run_id,
                &ProgressUpdate {
                    completed_steps: Some(completed),
                    progress_pct: Some(progress.progress.min(100)),
                    current_node_id: current_node,
                    ..Default::default()
                },
            )
            .await
        {
            warn!(run_id = %run_id, error = %err, "progress update failed");
        }

        // Forward the log batch.
        let logs: Vec<RunLog> = progress
            .logs
            .iter()
            .map(|l| RunLog {
                id: Uuid::now_v7(),
                run_id,
                tenant_id: self.tenant_id,
                level: l.level,
                source: Some("runner".to_string()),
                step_id: l.node_id.clone(),
                message: l.message.clone(),
                data: None,
                timestamp: l.timestamp,
            })
            .collect();
        self.state.engine.append_logs(logs).await;

        Ok(())
    }

    async fn on_result(&mut self, result: ResultPayload) -> Result<(), SessionError> {
        if !self.state.registry.owns_job(self.runner_id, result.run_id) {
            return Err(SessionError::Protocol(format!(
                "result for job {} this session does not own",
                result.run_id
            )));
        }
        let run_id = result.run_id;

        // Close the last open step before the terminal transition.
        if let Some(track) = self.jobs.get_mut(&run_id) {
            if let Some(prev) = track.current.take() {
                track.completed_steps += 1;
                let _ = self
                    .state
                    .engine
                    .record_step_event(
                        run_id,
                        EventKind::StepEnd,
                        Some(format!("step-{}", prev.index)),
                        Some(prev.node_id.clone()),
                        json!({ "index": prev.index }),
                    )
                    .await;
            }
        }

        let outcome = self
            .state
            .engine
            .complete(
                run_id,
                RunResult {
                    status: result.status,
                    started_at: result.started_at,
                    completed_at: result.completed_at,
                    duration_ms: result.duration_ms,
                    steps_executed: result.steps_executed,
                    steps_failed: result.steps_failed,
                    output: result.output.clone(),
                    error: result.error.clone(),
                },
            )
            .await;
        match outcome {
            Ok(_) => {}
            Err(CoreError::IllegalState { current, .. }) => {
                // Late result: the run finished without this runner (cancel,
                // timeout). Tell it to drop the job.
                warn!(run_id = %run_id, status = ?current, "dropping late result");
                self.reply(ServerMessage::Cancel(JobRef { job_id: run_id }));
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "result ingestion failed");
            }
        }

        self.jobs.remove(&run_id);
        let idle = self
            .state
            .registry
            .finish_job(self.runner_id, run_id)
            .unwrap_or(false);
        if idle {
            if let Err(err) = self
                .state
                .store
                .update_runner_status(self.runner_id, RunnerStatus::Online)
                .await
            {
                warn!(runner_id = %self.runner_id, error = %format!("{err:#}"), "status persist failed");
            }
        }
        // Freed capacity: give the dispatcher a chance to hand us more work.
        self.state.engine.queue().kick();
        Ok(())
    }

    async fn on_hitl(&mut self, request: HitlRequestPayload) -> Result<(), SessionError> {
        if !self.state.registry.owns_job(self.runner_id, request.run_id) {
            return Err(SessionError::Protocol(format!(
                "approval request for job {} this session does not own",
                request.run_id
            )));
        }
        match self.state.engine.request_hitl(&request).await {
            Ok(created) => {
                debug!(run_id = %request.run_id, request_id = %created.id, "approval requested");
                Ok(())
            }
            Err(CoreError::IllegalState { current, .. }) => {
                // The step must abort; the session survives.
                self.reply(ServerMessage::Error {
                    message: format!("approval not possible while run is {current:?}"),
                });
                Ok(())
            }
            Err(err) => {
                warn!(run_id = %request.run_id, error = %err, "approval request failed");
                Ok(())
            }
        }
    }

    /// Session teardown: orphan in-flight runs and mark the runner offline.
    /// A session that was kicked leaves cleanup to its replacement.
    pub async fn disconnect(self) {
        let Some(orphans) = self
            .state
            .registry
            .unregister(self.runner_id, self.session_id)
        else {
            return;
        };
        info!(runner_id = %self.runner_id, orphans = orphans.len(), "runner disconnected");

        for run_id in orphans {
            match self.state.engine.orphan(run_id).await {
                Ok(run) => {
                    debug!(run_id = %run_id, status = ?run.status, "orphaned run rerouted")
                }
                Err(err) => warn!(run_id = %run_id, error = %err, "orphan handling failed"),
            }
        }

        if let Err(err) = self
            .state
            .store
            .update_runner_status(self.runner_id, RunnerStatus::Offline)
            .await
        {
            warn!(runner_id = %self.runner_id, error = %format!("{err:#}"), "status persist failed");
        }
        self.state.bus.publish(
            RUNNERS_TOPIC,
            BusEvent::new(
                RUNNERS_TOPIC,
                EventKind::RunnerOffline.as_str(),
                json!({ "runnerId": self.runner_id }),
            ),
        );
    }
}

/// Socket pump: handshake, then a select loop over inbound frames and
/// outbound control messages.
async fn run_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let handshake = Duration::from_secs(state.config.handshake_timeout_seconds.max(1));

    // The first frame must be runner:auth within the handshake window.
    let auth = match tokio::time::timeout(handshake, ws_rx.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => {
            match serde_json::from_str::<RunnerMessage>(&text) {
                Ok(RunnerMessage::Auth(auth)) => auth,
                Ok(_) | Err(_) => {
                    let _ = send_frame(
                        &mut ws_tx,
                        &ServerMessage::AuthReply(AuthReplyPayload {
                            success: false,
                            error: Some("first frame must be runner:auth".to_string()),
                        }),
                    )
                    .await;
                    return;
                }
            }
        }
        _ => {
            debug!("handshake timed out or socket closed");
            return;
        }
    };

    let (mut session, mut outbound_rx) = match Session::authenticate(state, auth).await {
        Ok(pair) => pair,
        Err(reason) => {
            let _ = send_frame(
                &mut ws_tx,
                &ServerMessage::AuthReply(AuthReplyPayload {
                    success: false,
                    error: Some(reason),
                }),
            )
            .await;
            return;
        }
    };
    if send_frame(
        &mut ws_tx,
        &ServerMessage::AuthReply(AuthReplyPayload {
            success: true,
            error: None,
        }),
    )
    .await
    .is_err()
    {
        session.disconnect().await;
        return;
    }

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        let shutdown = matches!(message, ServerMessage::Shutdown { .. });
                        if send_frame(&mut ws_tx, &message).await.is_err() || shutdown {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let parsed = serde_json::from_str::<RunnerMessage>(&text);
                        let outcome = match parsed {
                            Ok(message) => session.handle(message).await,
                            Err(err) => Err(SessionError::Protocol(format!("malformed frame: {err}"))),
                        };
                        if let Err(err) = outcome {
                            warn!(runner_id = %session.runner_id, error = %err, "closing session");
                            let _ = send_frame(
                                &mut ws_tx,
                                &ServerMessage::Error { message: err.to_string() },
                            )
                            .await;
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: ignored
                    Some(Err(err)) => {
                        debug!(error = %err, "socket error");
                        break;
                    }
                }
            }
        }
    }

    session.disconnect().await;
}

async fn send_frame(
    ws_tx: &mut (impl SinkExt<WsMessage> + Unpin),
    message: &ServerMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|_| ())?;
    ws_tx.send(WsMessage::Text(text.into())).await.map_err(|_| ())
}

// ─── Dispatcher ───────────────────────────────────────────────

/// Assignment loop: woken by the queue signal (or a fallback interval), it
/// walks assignable runners and pushes claimed work to their sessions.
pub fn spawn_dispatcher(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let queue = state.engine.queue().clone();
        let mut fallback = tokio::time::interval(Duration::from_secs(2));
        fallback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = queue.notified() => {}
                _ = fallback.tick() => {}
            }
            assign_pending(&state).await;
        }
    })
}

/// One dispatch round. Snapshots the registry (no lock across awaits), then
/// claims and assigns per runner until queues or capacity run out.
pub async fn assign_pending(state: &AppState) {
    for candidate in state.registry.candidates() {
        let runner_id = candidate.profile.runner_id;
        let mut free = candidate.free_slots;
        while free > 0 {
            let entry = match state
                .engine
                .queue()
                .claim(&candidate.profile, now_ms())
                .await
            {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "queue claim failed");
                    break;
                }
            };

            match state.engine.lease(entry.run_id, &candidate.profile).await {
                Ok(Some(assign)) => {
                    state.registry.assign_job(runner_id, entry.run_id);
                    let delivered = state
                        .registry
                        .send(runner_id, ServerMessage::Assign(assign));
                    if !delivered {
                        // Session vanished between claim and send: roll the
                        // lease back so the work is not lost.
                        state.registry.finish_job(runner_id, entry.run_id);
                        if let Err(err) = state.engine.release_lease(entry.run_id).await {
                            warn!(run_id = %entry.run_id, error = %err, "lease rollback failed");
                        }
                        break;
                    }
                    debug!(run_id = %entry.run_id, runner_id = %runner_id, "job assigned");
                    free -= 1;
                }
                // Entry was stale (run cancelled or grabbed); try the next.
                Ok(None) => continue,
                Err(err) => {
                    warn!(run_id = %entry.run_id, error = %err, "lease failed");
                    break;
                }
            }
        }

        if state.registry.at_capacity(runner_id) {
            if let Err(err) = state
                .store
                .update_runner_status(runner_id, RunnerStatus::Busy)
                .await
            {
                warn!(runner_id = %runner_id, error = %format!("{err:#}"), "status persist failed");
            }
        }
    }
}

// ─── Liveness monitor ─────────────────────────────────────────

/// Force-disconnect sessions that have gone silent. The session pump
/// observes the Shutdown frame and runs normal orphan cleanup.
pub fn spawn_liveness_monitor(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let cutoff = now_ms() - (state.config.session_dead_seconds as i64) * 1000;
            for (runner_id, _session_id) in state.registry.stale_sessions(cutoff) {
                warn!(runner_id = %runner_id, "session silent past deadline; disconnecting");
                state.registry.send(
                    runner_id,
                    ServerMessage::Shutdown {
                        reason: "heartbeat deadline exceeded".to_string(),
                    },
                );
            }
        }
    })
}
