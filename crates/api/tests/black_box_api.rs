use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use fieldops_api::app::{AppServices, Stores, build_app};
use fieldops_api::config::RunnerSettings;
use fieldops_api::delivery::build_runner;
use fieldops_core::{Clock, ManualClock, OperatorId, TenantId};
use fieldops_outbox::{
    AssumeTargetExists, DeadLetterRecord, HandlerError, HandlerRegistry, InMemoryOutboxStore,
    NewEvent, NoCircuit, OutboxError, ReplayTargetCheck,
};

const RUNNER: &str = "api-test-runner";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(services: AppServices) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(Arc::new(services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct TargetGone;

#[async_trait]
impl ReplayTargetCheck for TargetGone {
    async fn target_exists(&self, _dead_letter: &DeadLetterRecord) -> Result<bool, OutboxError> {
        Ok(false)
    }
}

struct Fixture {
    stores: Stores,
    clock: Arc<dyn Clock>,
    tenant: TenantId,
}

/// One tenant with one `webhook.crm_export` event dead-lettered by a
/// permanent `http_422` rejection, plus a heartbeat for `RUNNER`.
async fn fixture() -> Fixture {
    let stores = Stores::in_memory(InMemoryOutboxStore::arc());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
    let tenant = TenantId::new();

    let event = NewEvent::new(
        tenant,
        "webhook.crm_export",
        json!({"target_host": "crm.example.com", "customer_id": 7}),
        "crm-export-7",
    )
    .unwrap();
    stores.outbox.enqueue(event, clock.now()).await.unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("webhook.*", |_, _| {
        Err(HandlerError::permanent("payload rejected").with_code("http_422"))
    });
    let settings = RunnerSettings {
        name: RUNNER.to_string(),
        ..RunnerSettings::default()
    };
    let runner = build_runner(&stores, handlers, Arc::new(NoCircuit), clock.clone(), &settings);
    let report = runner.run_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    Fixture {
        stores,
        clock,
        tenant,
    }
}

async fn spawn_with(fixture: &Fixture, check: Arc<dyn ReplayTargetCheck>) -> TestServer {
    TestServer::spawn(AppServices::new(
        fixture.stores.clone(),
        check,
        fixture.clock.clone(),
    ))
    .await
}

async fn first_dead_letter_id(
    client: &reqwest::Client,
    srv: &TestServer,
    tenant: TenantId,
) -> String {
    let body: serde_json::Value = client
        .get(format!("{}/dead-letters", srv.base_url))
        .header("x-tenant-id", tenant.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["items"][0]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let fx = fixture().await;
    let srv = spawn_with(&fx, Arc::new(AssumeTargetExists)).await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_header_is_required_for_tenant_routes() {
    let fx = fixture().await;
    let srv = spawn_with(&fx, Arc::new(AssumeTargetExists)).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/dead-letters", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "missing_tenant");

    let res = client
        .get(format!("{}/backlog", srv.base_url))
        .header("x-tenant-id", "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dead_letters_are_listed_filtered_and_tenant_scoped() {
    let fx = fixture().await;
    let srv = spawn_with(&fx, Arc::new(AssumeTargetExists)).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/dead-letters?error_code=http_422&limit=10", srv.base_url))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["total"], 1);
    assert_eq!(page["pagination"]["limit"], 10);
    let item = &page["items"][0];
    assert_eq!(item["kind"], "webhook.crm_export");
    assert_eq!(item["mode"], "webhook");
    assert_eq!(item["target_host"], "crm.example.com");
    assert_eq!(item["last_error_code"], "http_422");

    let res = client
        .get(format!("{}/dead-letters?error_code=timeout", srv.base_url))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = res.json().await.unwrap();
    assert_eq!(page["total"], 0);

    let id = item["id"].as_str().unwrap();
    let res = client
        .get(format!("{}/dead-letters/{}", srv.base_url, id))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Another tenant cannot see it.
    let res = client
        .get(format!("{}/dead-letters/{}", srv.base_url, id))
        .header("x-tenant-id", TenantId::new().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/dead-letters/not-a-uuid", srv.base_url))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn replay_requeues_once_and_is_audited() {
    let fx = fixture().await;
    let srv = spawn_with(&fx, Arc::new(AssumeTargetExists)).await;
    let client = reqwest::Client::new();
    let id = first_dead_letter_id(&client, &srv, fx.tenant).await;
    let operator = OperatorId::new();

    // Operator identity is mandatory for replay.
    let res = client
        .post(format!("{}/dead-letters/{}/replay", srv.base_url, id))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/dead-letters/{}/replay", srv.base_url, id))
        .header("x-tenant-id", fx.tenant.to_string())
        .header("x-operator-id", operator.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: serde_json::Value = res.json().await.unwrap();
    assert_eq!(outcome["transition"], "requeued");
    assert_eq!(outcome["event"]["status"], "pending");
    assert_eq!(outcome["event"]["attempts"], 0);
    assert_eq!(outcome["dead_letter"]["replay_count"], 1);
    assert_eq!(
        outcome["dead_letter"]["last_replayed_by"].as_str().unwrap(),
        operator.to_string()
    );

    // Second replay while the first is still pending is refused.
    let res = client
        .post(format!("{}/dead-letters/{}/replay", srv.base_url, id))
        .header("x-tenant-id", fx.tenant.to_string())
        .header("x-operator-id", operator.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "already_pending");

    let res = client
        .get(format!("{}/dead-letters/{}/audit", srv.base_url, id))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let entries: serde_json::Value = res.json().await.unwrap();
    let outcomes: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["outcome"].as_str().unwrap())
        .collect();
    assert_eq!(outcomes, vec!["requeued", "rejected"]);

    let res = client
        .get(format!("{}/backlog", srv.base_url))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    let backlog: serde_json::Value = res.json().await.unwrap();
    assert_eq!(backlog["pending"], 1);
    assert_eq!(backlog["dead"], 0);
}

#[tokio::test]
async fn replay_of_unknown_dead_letter_is_not_found() {
    let fx = fixture().await;
    let srv = spawn_with(&fx, Arc::new(AssumeTargetExists)).await;

    let res = reqwest::Client::new()
        .post(format!(
            "{}/dead-letters/{}/replay",
            srv.base_url,
            uuid::Uuid::now_v7()
        ))
        .header("x-tenant-id", fx.tenant.to_string())
        .header("x-operator-id", OperatorId::new().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn replay_with_missing_target_is_gone() {
    let fx = fixture().await;
    let srv = spawn_with(&fx, Arc::new(TargetGone)).await;
    let client = reqwest::Client::new();
    let id = first_dead_letter_id(&client, &srv, fx.tenant).await;

    let res = client
        .post(format!("{}/dead-letters/{}/replay", srv.base_url, id))
        .header("x-tenant-id", fx.tenant.to_string())
        .header("x-operator-id", OperatorId::new().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GONE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "target_missing");

    // Nothing was requeued.
    let res = client
        .get(format!("{}/backlog", srv.base_url))
        .header("x-tenant-id", fx.tenant.to_string())
        .send()
        .await
        .unwrap();
    let backlog: serde_json::Value = res.json().await.unwrap();
    assert_eq!(backlog["pending"], 0);
    assert_eq!(backlog["dead"], 1);
}

#[tokio::test]
async fn runner_health_reports_status() {
    let fx = fixture().await;
    let srv = spawn_with(&fx, Arc::new(AssumeTargetExists)).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/runners/{}/health", srv.base_url, RUNNER))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let health: serde_json::Value = res.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["heartbeat"]["runner_name"], RUNNER);
    assert_eq!(health["heartbeat"]["consecutive_failures"], 0);

    let res = client
        .get(format!("{}/runners/no-such-runner/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
