//! Router tests: workers join through the API, connectors are managed
//! through the API, and commands reach an in-memory fleet.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use sourcegrid_api::{ApiState, build_router};
use sourcegrid_cluster::MembershipManager;
use sourcegrid_dispatch::{InMemoryWorkers, Verb};
use sourcegrid_orchestrator::{Orchestrator, OrchestratorConfig, StaticCatalog};
use sourcegrid_state::{ConnectorType, ResourceLimits, StateStore, WorkerNode};

struct TestApi {
    router: Router,
    workers: Arc<InMemoryWorkers>,
}

fn test_api() -> TestApi {
    let store = StateStore::open_in_memory().unwrap();
    let workers = Arc::new(InMemoryWorkers::new());
    let membership = MembershipManager::new(store.clone());
    let catalog = StaticCatalog::new(vec![ConnectorType {
        name: "gen".to_string(),
        description: "synthetic records".to_string(),
        source_class: Some("org.example.GenSource".to_string()),
        sink_class: None,
        archive: None,
    }]);
    let orchestrator = Orchestrator::new(
        store,
        workers.clone(),
        Arc::new(membership.clone()),
        Arc::new(catalog),
        OrchestratorConfig::default(),
    );
    TestApi {
        router: build_router(ApiState {
            orchestrator,
            membership,
        }),
        workers,
    }
}

impl TestApi {
    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Start a simulated worker and join it through the API.
    async fn add_worker(&self, id: &str) {
        let capacity = ResourceLimits::new(16.0, 64 << 30, 1 << 40);
        self.workers
            .add_node(WorkerNode::new(id, "127.0.0.1", 7000, capacity));
        let (status, _) = self
            .call(
                "POST",
                "/admin/v3/workers",
                Some(json!({
                    "node_id": id,
                    "address": "127.0.0.1",
                    "port": 7000,
                    "capacity": { "cpu": 16.0, "ram_bytes": 64u64 << 30, "disk_bytes": 1u64 << 40 }
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }
}

fn source_body(parallelism: u32) -> Value {
    json!({
        "class_name": "org.example.GenSource",
        "archive": "builtin://gen",
        "topic": "persistent://t1/ns1/out",
        "parallelism": parallelism,
        "configs": { "rate": 10 }
    })
}

const SRC: &str = "/admin/v3/sources/t1/ns1/src1";

#[tokio::test]
async fn register_get_and_list() {
    let api = test_api();
    api.add_worker("node-a").await;

    let (status, body) = api.call("POST", SRC, Some(source_body(2))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["version"], 1);

    let (status, body) = api.call("GET", SRC, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["parallelism"], 2);
    assert_eq!(body["data"]["topic"], "persistent://t1/ns1/out");

    let (status, body) = api.call("GET", "/admin/v3/sources/t1/ns1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!(["src1"]));

    assert_eq!(api.workers.running_instances().len(), 2);
}

#[tokio::test]
async fn register_errors_map_to_status_codes() {
    let api = test_api();
    api.add_worker("node-a").await;
    api.call("POST", SRC, Some(source_body(1))).await;

    let (status, body) = api.call("POST", SRC, Some(source_body(1))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("already exists"));

    let (status, _) = api
        .call("POST", "/admin/v3/sources/t1/ns1/src2", Some(source_body(0)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = api.call("GET", "/admin/v3/sources/t1/ns1/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Undecodable bodies come back in the envelope, not as a bare 422.
    let mut bad = source_body(1);
    bad["processing_guarantees"] = json!("EXACTLY_TWICE");
    let (status, body) = api
        .call("POST", "/admin/v3/sources/t1/ns1/src3", Some(bad.clone()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("invalid config"));

    let (status, body) = api.call("PUT", SRC, Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("invalid update"));

    // A name that cannot travel in a worker command path.
    let (status, body) = api
        .call("POST", "/admin/v3/sources/t1/ns1/a%3Fb", Some(source_body(1)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("reserved character"));
    assert_eq!(api.workers.count(Verb::Start), 1);
}

#[tokio::test]
async fn update_and_version_conflict() {
    let api = test_api();
    api.add_worker("node-a").await;
    api.call("POST", SRC, Some(source_body(1))).await;

    let mut update = source_body(3);
    update["expected_version"] = json!(1);
    let (status, body) = api.call("PUT", SRC, Some(update.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["to_version"], 2);
    assert_eq!(body["data"]["phase"]["phase"], "completed");
    assert_eq!(body["data"]["created"].as_array().unwrap().len(), 2);

    let (status, _) = api.call("PUT", SRC, Some(update)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Same config and parallelism as stored.
    let (status, _) = api.call("PUT", SRC, Some(source_body(3))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_endpoints() {
    let api = test_api();
    api.add_worker("node-a").await;
    api.add_worker("node-b").await;
    api.call("POST", SRC, Some(source_body(3))).await;

    let (status, body) = api.call("GET", &format!("{SRC}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["healthy"], true);
    assert_eq!(body["data"]["num_running"], 3);

    let (status, body) = api.call("GET", &format!("{SRC}/2/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "RUNNING");
    assert!(body["data"]["node_id"].is_string());

    let (status, _) = api.call("GET", &format!("{SRC}/7/status"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn instance_and_bulk_verbs() {
    let api = test_api();
    api.add_worker("node-a").await;
    api.call("POST", SRC, Some(source_body(2))).await;

    let (status, _) = api.call("POST", &format!("{SRC}/1/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(api.workers.running_instances().len(), 1);

    let (status, _) = api.call("POST", &format!("{SRC}/start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(api.workers.running_instances().len(), 2);

    let (status, _) = api.call("POST", &format!("{SRC}/0/restart"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(api.workers.count(Verb::Restart), 1);

    api.workers.reject_starts("node-a", Some("disk full"));
    let (status, body) = api.call("POST", &format!("{SRC}/restart"), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn deregister_removes_everything() {
    let api = test_api();
    api.add_worker("node-a").await;
    api.call("POST", SRC, Some(source_body(2))).await;

    let (status, body) = api.call("DELETE", SRC, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["removed"], 2);
    assert_eq!(body["data"]["unconfirmed"], json!([]));
    assert!(api.workers.running_instances().is_empty());

    let (status, _) = api.call("DELETE", SRC, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deregister_lists_unconfirmed_stops() {
    let api = test_api();
    api.add_worker("node-a").await;
    api.call("POST", SRC, Some(source_body(1))).await;
    api.workers.set_unreachable("node-a", true);

    let (status, body) = api.call("DELETE", SRC, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let unconfirmed = body["data"]["unconfirmed"].as_array().unwrap();
    assert_eq!(unconfirmed.len(), 1);
    assert_eq!(unconfirmed[0]["ordinal"], 0);
    assert_eq!(unconfirmed[0]["node_id"], "node-a");
    assert_eq!(unconfirmed[0]["action"], "remove");
    assert_eq!(unconfirmed[0]["error"]["kind"], "unreachable");

    let (status, _) = api.call("GET", SRC, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn builtin_sources_lists_catalog() {
    let api = test_api();
    let (status, body) = api.call("GET", "/admin/v3/sources/builtinsources", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["name"], "gen");
}

#[tokio::test]
async fn worker_membership_lifecycle() {
    let api = test_api();
    api.add_worker("node-a").await;

    let (status, body) = api.call("GET", "/admin/v3/workers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], "node-a");
    assert_eq!(body["data"][0]["status"], "ready");

    let (status, _) = api
        .call(
            "POST",
            "/admin/v3/workers/node-a/heartbeat",
            Some(json!({ "draining": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = api.call("GET", "/admin/v3/workers", None).await;
    assert_eq!(body["data"][0]["status"], "draining");

    let (status, _) = api
        .call("POST", "/admin/v3/workers/ghost/heartbeat", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = api.call("DELETE", "/admin/v3/workers/node-a", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = api.call("GET", "/admin/v3/workers", None).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn worker_reports_are_ingested() {
    let api = test_api();
    api.add_worker("node-a").await;
    api.call("POST", SRC, Some(source_body(1))).await;

    // Ordinal 9 does not exist and is ignored.
    let report = json!([
        {
            "tenant": "t1",
            "namespace": "ns1",
            "name": "src1",
            "ordinal": 0,
            "status": { "running": true, "config_version": 1 }
        },
        {
            "tenant": "t1",
            "namespace": "ns1",
            "name": "src1",
            "ordinal": 9,
            "status": { "running": false, "last_error": "boom" }
        }
    ]);
    let (status, body) = api
        .call("POST", "/admin/v3/workers/node-a/reports", Some(report.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["received"], 2);
    assert_eq!(body["data"]["applied"], 1);

    let (status, _) = api
        .call("POST", "/admin/v3/workers/ghost/reports", Some(report))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
