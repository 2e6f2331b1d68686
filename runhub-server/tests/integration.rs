//! In-process HTTP tests: the control API wired to a memory store, driven
//! through tower without binding a socket.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use runhub_core::bus::EventBus;
use runhub_core::config::CoreConfig;
use runhub_core::engine::LifecycleEngine;
use runhub_core::external::{BotVersion, BotVersionState, NoSecrets, NoopNotifier, StaticCatalog};
use runhub_core::queue::RunQueue;
use runhub_core::registry::RunnerRegistry;
use runhub_core::store::RunStore;
use runhub_core::store_memory::MemoryStore;
use runhub_server::http::{app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

struct TestServer {
    router: Router,
    tenant: Uuid,
    bot_id: Uuid,
    version_id: Uuid,
}

fn server() -> TestServer {
    let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(RunQueue::new(store.clone()));
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(RunnerRegistry::new());

    let bot_id = Uuid::now_v7();
    let version_id = Uuid::now_v7();
    let catalog = StaticCatalog::new();
    catalog.insert(BotVersion {
        bot_id,
        version_id,
        state: BotVersionState::Published,
        plan_hash: "a1b2c3".to_string(),
        package_url: "https://packages.test/invoice-bot.tgz".to_string(),
        total_steps: 4,
        required_capabilities: vec![],
        default_timeout_seconds: None,
    });

    let config = CoreConfig::default();
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        queue,
        bus.clone(),
        registry.clone(),
        Arc::new(catalog),
        Arc::new(NoSecrets),
        Arc::new(NoopNotifier),
        config.clone(),
    ));

    let state = AppState {
        engine,
        store,
        bus,
        registry,
        config,
    };

    TestServer {
        router: app(state),
        tenant: Uuid::now_v7(),
        bot_id,
        version_id,
    }
}

impl TestServer {
    async fn request(
        &self,
        method: &str,
        uri: &str,
        tenant: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            builder = builder
                .header("x-tenant-id", tenant.to_string())
                .header("x-actor-id", "it-test");
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn run_spec(&self) -> Value {
        json!({
            "botId": self.bot_id,
            "botVersionId": self.version_id,
            "inputs": {"invoice": 42},
            "priority": "HIGH",
            "tags": ["billing"]
        })
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = server();
    let (status, body) = server.request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connectedRunners"], 0);
}

#[tokio::test]
async fn create_get_list_cancel_round_trip() {
    let server = server();
    let tenant = server.tenant;

    let (status, created) = server
        .request("POST", "/v1/runs", Some(tenant), Some(server.run_spec()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "QUEUED");
    assert_eq!(created["priority"], "HIGH");
    assert_eq!(created["inputs"]["invoice"], 42);
    let run_id = created["id"].as_str().unwrap().to_string();

    let (status, detail) = server
        .request("GET", &format!("/v1/runs/{run_id}"), Some(tenant), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["id"], created["id"]);
    assert_eq!(detail["childCount"], 0);
    assert_eq!(detail["eventCount"], 1); // RUN_QUEUED

    let (status, listed) = server
        .request("GET", "/v1/runs?status=QUEUED", Some(tenant), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);

    let (status, cancelled) = server
        .request(
            "POST",
            &format!("/v1/runs/{run_id}/cancel"),
            Some(tenant),
            Some(json!({"reason": "integration test"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "CANCELLED");
    assert_eq!(cancelled["cancelReason"], "integration test");

    let (status, events) = server
        .request(
            "GET",
            &format!("/v1/runs/{run_id}/events"),
            Some(tenant),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = events["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["RUN_QUEUED", "RUN_CANCELLED"]);
}

#[tokio::test]
async fn missing_tenant_header_is_rejected() {
    let server = server();
    let (status, body) = server
        .request("POST", "/v1/runs", None, Some(server.run_spec()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn unknown_run_is_404_and_unknown_bot_mapped() {
    let server = server();
    let tenant = server.tenant;

    let (status, body) = server
        .request(
            "GET",
            &format!("/v1/runs/{}", Uuid::now_v7()),
            Some(tenant),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, body) = server
        .request(
            "POST",
            "/v1/runs",
            Some(tenant),
            Some(json!({
                "botId": Uuid::now_v7(),
                "inputs": {}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn tenants_cannot_see_each_other() {
    let server = server();
    let (_, created) = server
        .request("POST", "/v1/runs", Some(server.tenant), Some(server.run_spec()))
        .await;
    let run_id = created["id"].as_str().unwrap().to_string();

    let other_tenant = Uuid::now_v7();
    let (status, _) = server
        .request("GET", &format!("/v1/runs/{run_id}"), Some(other_tenant), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, listed) = server
        .request("GET", "/v1/runs", Some(other_tenant), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 0);
}

#[tokio::test]
async fn runner_registration_returns_key_once() {
    let server = server();
    let (status, body) = server
        .request(
            "POST",
            "/v1/runners",
            Some(server.tenant),
            Some(json!({
                "name": "warehouse-agent",
                "maxConcurrentJobs": 3,
                "capabilities": {"os": "windows", "tags": ["desktop.automation"]}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let api_key = body["apiKey"].as_str().unwrap();
    assert!(api_key.starts_with("skr_"));
    assert_eq!(body["runner"]["status"], "OFFLINE");
    // The stored hash never leaves the server.
    assert!(body["runner"].get("apiKeyHash").is_none());

    let (status, listed) = server
        .request("GET", "/v1/runners", Some(server.tenant), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["runners"][0]["connected"], false);
}

#[tokio::test]
async fn pause_requires_running_state() {
    let server = server();
    let (_, created) = server
        .request("POST", "/v1/runs", Some(server.tenant), Some(server.run_spec()))
        .await;
    let run_id = created["id"].as_str().unwrap().to_string();

    let (status, body) = server
        .request(
            "POST",
            &format!("/v1/runs/{run_id}/pause"),
            Some(server.tenant),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ILLEGAL_STATE");
}

#[tokio::test]
async fn hitl_list_is_tenant_scoped_and_empty() {
    let server = server();
    let (status, body) = server
        .request("GET", "/v1/hitl", Some(server.tenant), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
}
