//! Wire contract of the line-delimited JSON protocol.
//!
//! Requests are fed through `handle_line` and responses are checked in
//! their serialized form, the shape workers and `fleet-ctl` depend on.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use fleet_coordinator::config::GlobalConfig;
use fleet_coordinator::ipc::server::handle_line;
use fleet_coordinator::orchestrator::Orchestrator;
use fleet_coordinator::pool::{EmailPool, LocationPool};
use fleet_coordinator::queue::{SystemClock, TaskQueue};
use fleet_coordinator::store::{StateStore, StoreOptions};

async fn orchestrator(data_dir: &Path) -> Orchestrator {
    let toml = format!(
        "data_dir = '{}'\nmax_concurrent_sessions = 1\n\n[worker]\nprogram = \"/definitely/not/a/worker-binary\"\n",
        data_dir.display()
    );
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("config"));
    let store = Arc::new(StateStore::new(StoreOptions::from_config(&config)));
    store.initialize().await.expect("initialize");
    let queue = Arc::new(TaskQueue::from_config(
        Arc::clone(&store),
        Arc::new(SystemClock),
        &config.queue,
    ));
    let locations = LocationPool::from_config(Arc::clone(&store), &config.pools);
    let emails = EmailPool::from_config(Arc::clone(&store), &config.pools);
    let (orchestrator, _events) = Orchestrator::new(config, store, queue, locations, emails);
    orchestrator
}

async fn call(orchestrator: &Orchestrator, request: &Value) -> Value {
    let response = handle_line(&request.to_string(), orchestrator).await;
    serde_json::to_value(&response).expect("response serializes")
}

#[tokio::test]
async fn task_lifecycle_over_the_wire() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;

    let enqueued = call(
        &orch,
        &json!({"command": "enqueue", "count": 2, "config": {"region": "us"}}),
    )
    .await;
    assert_eq!(enqueued["ok"], json!(true));
    assert_eq!(enqueued["data"].as_array().map(Vec::len), Some(2));
    assert_eq!(enqueued["data"][0]["type"], json!("create_account"));
    assert_eq!(enqueued["data"][0]["status"], json!("pending"));
    assert!(enqueued.get("error").is_none());

    let leased = call(&orch, &json!({"command": "next_task", "device_id": "dev-A"})).await;
    assert_eq!(leased["ok"], json!(true));
    assert_eq!(leased["data"]["id"], json!(1));
    assert_eq!(leased["data"]["status"], json!("in_progress"));
    assert_eq!(leased["data"]["deviceId"], json!("dev-A"));
    assert_eq!(leased["data"]["attempts"], json!(1));
    assert_eq!(leased["data"]["config"]["region"], json!("us"));

    let done = call(
        &orch,
        &json!({"command": "complete", "device_id": "dev-A", "task_id": 1, "result": {"account": "x"}}),
    )
    .await;
    assert_eq!(done["ok"], json!(true));
    assert_eq!(done["data"]["status"], json!("completed"));
    assert_eq!(done["data"]["result"]["account"], json!("x"));
}

#[tokio::test]
async fn wrong_holder_gets_not_assigned_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;
    call(&orch, &json!({"command": "enqueue", "count": 1})).await;
    call(&orch, &json!({"command": "next_task", "device_id": "dev-A"})).await;

    let response = call(
        &orch,
        &json!({"command": "fail", "device_id": "dev-B", "task_id": 1, "error": "timeout"}),
    )
    .await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(
        response["error"],
        json!("not assigned: task 1 is not assigned to dev-B")
    );
    assert!(response.get("data").is_none());
}

#[tokio::test]
async fn failure_is_reported_with_retry_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;
    call(&orch, &json!({"command": "enqueue", "count": 1})).await;
    call(&orch, &json!({"command": "next_task", "device_id": "dev-A"})).await;

    let response = call(
        &orch,
        &json!({"command": "fail", "device_id": "dev-A", "task_id": 1, "error": "timeout"}),
    )
    .await;
    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["data"]["status"], json!("pending"));
    assert_eq!(response["data"]["lastError"], json!("timeout"));
}

#[tokio::test]
async fn exhaustion_is_success_with_null_data() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;

    let task = call(&orch, &json!({"command": "next_task", "device_id": "dev-A"})).await;
    assert_eq!(task, json!({"ok": true, "data": null}));

    let email = call(
        &orch,
        &json!({"command": "allocate", "pool": "emails", "requester_id": "dev-A"}),
    )
    .await;
    assert_eq!(email, json!({"ok": true, "data": null}));
}

#[tokio::test]
async fn pool_allocate_and_release_round() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;
    orch.emails().add_emails(["a@x.io"]).await.expect("seed");

    let allocated = call(
        &orch,
        &json!({"command": "allocate", "pool": "emails", "requester_id": "dev-A"}),
    )
    .await;
    assert_eq!(allocated, json!({"ok": true, "data": "a@x.io"}));

    let released = call(
        &orch,
        &json!({"command": "release", "pool": "emails", "requester_id": "dev-A", "key": "A@X.io"}),
    )
    .await;
    assert_eq!(released, json!({"ok": true, "data": null}));

    let foreign = call(
        &orch,
        &json!({"command": "mark_used", "pool": "emails", "requester_id": "dev-B", "key": "a@x.io"}),
    )
    .await;
    assert_eq!(foreign["ok"], json!(false));
    assert!(foreign["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("not assigned:")));
}

#[tokio::test]
async fn status_reports_counts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;
    call(&orch, &json!({"command": "enqueue", "count": 3, "task_type": "test"})).await;
    call(&orch, &json!({"command": "next_task", "device_id": "dev-A"})).await;

    let status = call(&orch, &json!({"command": "status"})).await;
    assert_eq!(status["ok"], json!(true));
    assert_eq!(status["data"]["queue"]["pending"], json!(2));
    assert_eq!(status["data"]["queue"]["in_progress"], json!(1));
    assert_eq!(status["data"]["queue"]["total"], json!(3));
    assert_eq!(status["data"]["running_processes"], json!(0));
    assert_eq!(status["data"]["devices"][0]["device_id"], json!("dev-A"));
    assert_eq!(status["data"]["devices"][0]["leased_tasks"], json!([1]));
}

#[tokio::test]
async fn launch_errors_surface_as_failed_responses() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;

    let over = call(
        &orch,
        &json!({"command": "launch", "device_ids": ["dev-A", "dev-B"]}),
    )
    .await;
    assert_eq!(over["ok"], json!(false));
    assert!(over["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("capacity:")));

    let missing = call(&orch, &json!({"command": "launch", "device_ids": ["dev-A"]})).await;
    assert!(missing["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("spawn:")));
}

#[tokio::test]
async fn checkpoint_returns_summary() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;

    let response = call(&orch, &json!({"command": "checkpoint", "label": "nightly"})).await;
    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["data"]["label"], json!("nightly"));
    assert!(response["data"]["id"].is_string());
    assert!(response["data"].get("document").is_none());
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(temp.path()).await;

    for line in [
        "not json",
        r#"{"command": "explode"}"#,
        r#"{"command": "next_task"}"#,
        r#"{"command": "allocate", "pool": "phones", "requester_id": "dev-A"}"#,
    ] {
        let response = serde_json::to_value(handle_line(line, &orch).await).expect("serializes");
        assert_eq!(response["ok"], json!(false), "line: {line}");
        assert!(response["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("invalid request:")));
    }
}
