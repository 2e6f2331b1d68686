use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use runhub_core::bus::{run_topic, EventBus, Subscription, RUNNERS_TOPIC};
use runhub_core::config::CoreConfig;
use runhub_core::engine::{HitlDecision, LifecycleEngine, RegisterRunnerSpec};
use runhub_core::error::CoreError;
use runhub_core::registry::RunnerRegistry;
use runhub_core::store::RunStore;
use runhub_core::types::*;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared handles every route and gateway session needs.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LifecycleEngine>,
    pub store: Arc<dyn RunStore>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<RunnerRegistry>,
    pub config: CoreConfig,
}

/// Control API router. Tenant and actor identity arrive via headers stamped
/// by the external auth middleware; the handlers parse them defensively.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/runs", get(list_runs).post(create_run))
        .route("/v1/runs/{id}", get(get_run))
        .route("/v1/runs/{id}/cancel", post(cancel_run))
        .route("/v1/runs/{id}/pause", post(pause_run))
        .route("/v1/runs/{id}/resume", post(resume_run))
        .route("/v1/runs/{id}/retry", post(retry_run))
        .route("/v1/runs/{id}/events", get(get_events))
        .route("/v1/runs/{id}/logs", get(get_logs))
        .route("/v1/runs/{id}/stream", get(stream_run))
        .route("/v1/hitl", get(list_hitl))
        .route("/v1/hitl/{id}/action", post(process_hitl_action))
        .route("/v1/runners", get(list_runners).post(register_runner))
        .route("/v1/runners/stream", get(stream_runners))
        .route("/ws/runner", get(crate::gateway::runner_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Error mapping ────────────────────────────────────────────

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::BotNotCompiled(_) => StatusCode::CONFLICT,
            CoreError::DepthExceeded { .. } | CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::IllegalState { .. }
            | CoreError::NotRetriable(_)
            | CoreError::AlreadyResolved(_) => StatusCode::CONFLICT,
            CoreError::ActionNotAllowed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Protocol(_) => StatusCode::BAD_REQUEST,
            CoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if !self.0.is_client_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({
            "error": { "code": self.0.code(), "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Parse the tenant/actor context stamped by the auth middleware.
fn request_ctx(headers: &HeaderMap) -> ApiResult<RequestContext> {
    let tenant = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| CoreError::Validation("missing or invalid x-tenant-id header".into()))?;
    let actor = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    Ok(RequestContext::new(tenant, actor))
}

// ─── Handlers ─────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connectedRunners": state.registry.connected_count(),
        "droppedBusEvents": state.bus.dropped_events(),
    }))
}

async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<RunSpec>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let ctx = request_ctx(&headers)?;
    let run = state.engine.create(&ctx, spec).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<RunFilter>,
) -> ApiResult<Json<Value>> {
    let ctx = request_ctx(&headers)?;
    let page = state.engine.list_runs(&ctx, filter).await?;
    Ok(Json(json!({ "runs": page.items, "total": page.total })))
}

async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunDetail>> {
    let ctx = request_ctx(&headers)?;
    Ok(Json(state.engine.get_run(&ctx, id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CancelBody {
    reason: Option<String>,
    cascade_children: bool,
}

async fn cancel_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<Run>> {
    let ctx = request_ctx(&headers)?;
    // Tenant scoping before mutating.
    state.engine.get_run(&ctx, id).await?;
    let Json(body) = body.unwrap_or_default();
    let run = state
        .engine
        .cancel(id, &ctx.actor_id, body.reason, body.cascade_children)
        .await?;
    Ok(Json(run))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PauseBody {
    reason: Option<String>,
}

async fn pause_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<PauseBody>>,
) -> ApiResult<Json<Run>> {
    let ctx = request_ctx(&headers)?;
    state.engine.get_run(&ctx, id).await?;
    let Json(body) = body.unwrap_or_default();
    Ok(Json(state.engine.pause(id, &ctx.actor_id, body.reason).await?))
}

async fn resume_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Run>> {
    let ctx = request_ctx(&headers)?;
    state.engine.get_run(&ctx, id).await?;
    Ok(Json(state.engine.resume(id, &ctx.actor_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RetryBody {
    inputs: Option<Value>,
}

async fn retry_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<RetryBody>>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let ctx = request_ctx(&headers)?;
    let Json(body) = body.unwrap_or_default();
    let run = state.engine.retry_run(&ctx, id, body.inputs).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(filter): Query<EventFilter>,
) -> ApiResult<Json<Value>> {
    let ctx = request_ctx(&headers)?;
    let page = state.engine.list_events(&ctx, id, filter).await?;
    Ok(Json(json!({ "events": page.items, "total": page.total })))
}

async fn get_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(filter): Query<LogFilter>,
) -> ApiResult<Json<Value>> {
    let ctx = request_ctx(&headers)?;
    let page = state.engine.list_logs(&ctx, id, filter).await?;
    Ok(Json(json!({ "logs": page.items, "total": page.total })))
}

/// Subscription → SSE adapter. Lag is tolerated: the store keeps the
/// canonical record, this stream is live telemetry.
fn sse_stream(sub: Subscription) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    futures::stream::unfold(sub, |mut sub| async move {
        let event = sub.recv().await?;
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Some((Ok(Event::default().data(payload)), sub))
    })
}

async fn stream_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>> {
    let ctx = request_ctx(&headers)?;
    state.engine.get_run(&ctx, id).await?;
    let sub = state.bus.subscribe(&run_topic(id));
    Ok(Sse::new(sse_stream(sub)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn stream_runners(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>> {
    request_ctx(&headers)?;
    let sub = state.bus.subscribe(RUNNERS_TOPIC);
    Ok(Sse::new(sse_stream(sub)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn list_hitl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<HitlFilter>,
) -> ApiResult<Json<Value>> {
    let ctx = request_ctx(&headers)?;
    let page = state.engine.list_hitl(&ctx, filter).await?;
    Ok(Json(json!({ "requests": page.items, "total": page.total })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HitlActionBody {
    action: HitlAction,
    #[serde(default)]
    comments: Option<String>,
    #[serde(default)]
    modified_data: Option<Value>,
    #[serde(default)]
    escalate_to: Option<String>,
}

async fn process_hitl_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<HitlActionBody>,
) -> ApiResult<Json<HitlRequest>> {
    let ctx = request_ctx(&headers)?;
    let request = state
        .engine
        .resolve_hitl(
            id,
            &ctx,
            HitlDecision {
                action: body.action,
                comments: body.comments,
                modified_data: body.modified_data,
                escalate_to: body.escalate_to,
            },
        )
        .await?;
    Ok(Json(request))
}

async fn register_runner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<RegisterRunnerSpec>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let ctx = request_ctx(&headers)?;
    let (runner, api_key) = state.engine.register_runner(&ctx, spec).await?;
    // The plaintext key appears in this response and nowhere else.
    Ok((
        StatusCode::CREATED,
        Json(json!({ "runner": runner, "apiKey": api_key })),
    ))
}

async fn list_runners(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = request_ctx(&headers)?;
    let runners = state.engine.list_runners(&ctx).await?;
    let runners: Vec<Value> = runners
        .into_iter()
        .map(|r| {
            let connected = state.registry.is_connected(r.id);
            let mut value = serde_json::to_value(&r).unwrap_or(Value::Null);
            if let Value::Object(ref mut map) = value {
                map.insert("connected".to_string(), Value::Bool(connected));
                map.insert(
                    "currentJobs".to_string(),
                    Value::from(state.registry.job_count(r.id)),
                );
            }
            value
        })
        .collect();
    let total = runners.len();
    Ok(Json(json!({ "runners": runners, "total": total })))
}
