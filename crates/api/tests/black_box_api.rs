use std::sync::Arc;

use patchflow_core::{RunId, TenantId};
use patchflow_infra::config::PatchflowConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Same router as prod over in-memory stores, on an ephemeral port.
    /// No workers run, so admitted runs keep their slot.
    async fn spawn() -> Self {
        let services = patchflow_api::app::build_in_memory_services(
            &PatchflowConfig::default(),
            patchflow_api::app::passthrough_registry(),
        )
        .expect("services");
        let app = patchflow_api::app::build_app(Arc::new(services));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn create_run(&self, tenant: TenantId) -> reqwest::Response {
        self.client
            .post(self.url("/runs"))
            .header("X-Tenant-Id", tenant.to_string())
            .json(&json!({ "context": {} }))
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn notify_job(tenant: TenantId) -> Value {
    json!({
        "type": "notify",
        "tenantId": tenant,
        "runId": RunId::new(),
        "payload": { "event": "run.completed" },
    })
}

#[tokio::test]
async fn health_reports_backend() {
    let server = TestServer::spawn().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in_memory");
}

#[tokio::test]
async fn tenant_scoped_routes_require_header() {
    let server = TestServer::spawn().await;

    let resp = server.client.get(server.url("/dead-letters")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "missing_tenant");

    let resp = server
        .client
        .get(server.url("/dead-letters"))
        .header("X-Tenant-Id", "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn enqueued_job_is_readable_by_its_tenant_only() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new();

    let resp = server
        .client
        .post(server.url("/jobs"))
        .json(&notify_job(tenant))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let job_id = resp.json::<Value>().await.unwrap()["jobId"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = server
        .client
        .get(server.url(&format!("/jobs/{job_id}")))
        .header("X-Tenant-Id", tenant.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let job: Value = resp.json().await.unwrap();
    assert_eq!(job["status"], "pending");
    assert_eq!(job["type"], "notify");
    assert_eq!(job["attempt"], 1);

    let resp = server
        .client
        .get(server.url(&format!("/jobs/{job_id}")))
        .header("X-Tenant-Id", TenantId::new().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_enqueue_is_a_validation_error() {
    let server = TestServer::spawn().await;

    let resp = server
        .client
        .post(server.url("/jobs"))
        .json(&json!({ "type": "no-such-type", "tenantId": TenantId::new(), "runId": RunId::new() }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>().await.unwrap()["error"], "validation_error");

    // Notify without an event fails envelope validation in the store.
    let mut job = notify_job(TenantId::new());
    job["payload"] = json!({});
    let resp = server.client.post(server.url("/jobs")).json(&job).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn second_run_on_free_plan_is_rejected_with_retry_after() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new();

    let resp = server.create_run(tenant).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    assert!(body["runId"].is_string());
    assert!(body["jobId"].is_string());

    let resp = server.create_run(tenant).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "concurrency_limit");
    assert_eq!(body["limit"], 1);
    assert_eq!(body["current"], 1);

    // Another tenant is unaffected.
    let resp = server.create_run(TenantId::new()).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = server
        .client
        .get(server.url(&format!("/tenants/{tenant}/concurrency")))
        .send()
        .await
        .unwrap();
    let state: Value = resp.json().await.unwrap();
    assert_eq!(state["inFlightCount"], 1);
    assert_eq!(state["planLimit"], 1);
    assert_eq!(state["plan"], "free");
}

#[tokio::test]
async fn plan_upgrade_raises_the_limit() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new();

    let resp = server
        .client
        .put(server.url(&format!("/tenants/{tenant}/plan")))
        .json(&json!({ "plan": "pro" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json::<Value>().await.unwrap()["planLimit"], 5);

    for _ in 0..5 {
        assert_eq!(server.create_run(tenant).await.status(), StatusCode::ACCEPTED);
    }
    assert_eq!(server.create_run(tenant).await.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn paused_tenant_gets_503_until_resumed() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new();

    let resp = server
        .client
        .post(server.url(&format!("/tenants/{tenant}/pause")))
        .json(&json!({ "reason": "incident" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["changed"], true);
    assert_eq!(body["state"]["status"], "paused");
    assert_eq!(body["state"]["statusReason"], "incident");

    let resp = server.create_run(tenant).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(resp.headers().contains_key("retry-after"));
    assert_eq!(resp.json::<Value>().await.unwrap()["error"], "tenant_paused");

    let resp = server
        .client
        .post(server.url(&format!("/tenants/{tenant}/resume")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(server.create_run(tenant).await.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn suspended_tenant_gets_403() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new();

    let resp = server
        .client
        .post(server.url(&format!("/tenants/{tenant}/suspend")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json::<Value>().await.unwrap()["state"]["statusReason"], "operator request");

    let resp = server.create_run(tenant).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.json::<Value>().await.unwrap()["error"], "tenant_suspended");
}

#[tokio::test]
async fn invalid_pipeline_is_rejected_before_admission() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new();

    let resp = server
        .client
        .post(server.url("/runs"))
        .header("X-Tenant-Id", tenant.to_string())
        .json(&json!({ "pipeline": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // No slot was taken.
    assert_eq!(server.create_run(tenant).await.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unknown_run_and_dead_letter_are_not_found() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new().to_string();

    let resp = server
        .client
        .get(server.url(&format!("/runs/{}", RunId::new())))
        .header("X-Tenant-Id", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server
        .client
        .get(server.url("/dead-letters"))
        .header("X-Tenant-Id", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!([]));

    let resp = server
        .client
        .get(server.url("/runs/not-an-id"))
        .header("X-Tenant-Id", &tenant)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>().await.unwrap()["error"], "invalid_id");
}

#[tokio::test]
async fn metrics_expose_queue_depth() {
    let server = TestServer::spawn().await;
    let tenant = TenantId::new();
    server
        .client
        .post(server.url("/jobs"))
        .json(&notify_job(tenant))
        .send()
        .await
        .unwrap();

    let resp = server.client.get(server.url("/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp.text().await.unwrap();
    assert!(text.contains("patchflow_queue_depth 1"), "{text}");
    assert!(text.contains("patchflow_jobs_enqueued_total"));
}
