//! End-to-end queue walk-through across two devices.

use fleet_coordinator::models::task::{TaskConfig, TaskStatus, TaskType};

use super::test_helpers::{manual_clock, open_store, queue_with};

fn hinge_config() -> TaskConfig {
    let mut config = TaskConfig::new();
    config.insert("app".into(), serde_json::json!("hinge"));
    config
}

#[tokio::test]
async fn failed_task_is_retried_by_another_device() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(temp.path()).await;
    let queue = queue_with(&store, &manual_clock(), 3);

    let added = queue
        .add_batch(2, TaskType::CreateAccount, hinge_config())
        .await
        .unwrap();
    assert_eq!(added.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);

    let first = queue.get_next_task("dev-A").await.unwrap().expect("task 1");
    assert_eq!(first.id, 1);
    assert_eq!(first.status, TaskStatus::InProgress);
    assert_eq!(first.device_id.as_deref(), Some("dev-A"));
    assert_eq!(first.attempts, 1);
    assert_eq!(first.config["app"], "hinge");

    let second = queue.get_next_task("dev-B").await.unwrap().expect("task 2");
    assert_eq!(second.id, 2);

    let failed = queue.mark_failed("dev-A", 1, "timeout").await.unwrap();
    assert_eq!(failed.status, TaskStatus::Pending);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.last_error.as_deref(), Some("timeout"));

    let retried = queue.get_next_task("dev-B").await.unwrap().expect("task 1 again");
    assert_eq!(retried.id, 1);
    assert_eq!(retried.attempts, 2);
    assert_eq!(retried.device_id.as_deref(), Some("dev-B"));

    let held = store
        .read(|doc| doc.queue.device_assignments.get("dev-B").cloned())
        .await
        .unwrap();
    assert_eq!(held, vec![2, 1]);
    assert!(store
        .read(|doc| !doc.queue.device_assignments.contains_key("dev-A"))
        .await);
}

#[tokio::test]
async fn completion_records_result_and_frees_device() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(temp.path()).await;
    let queue = queue_with(&store, &manual_clock(), 3);
    queue
        .add_batch(1, TaskType::Test, TaskConfig::new())
        .await
        .unwrap();

    let task = queue.get_next_task("dev-A").await.unwrap().expect("task");
    let done = queue
        .mark_completed("dev-A", task.id, Some(serde_json::json!({"username": "u1"})))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(serde_json::json!({"username": "u1"})));
    assert!(queue.tasks_for_device("dev-A").await.is_empty());

    let counts = queue.counts().await;
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.total, 1);
}

#[tokio::test]
async fn ids_continue_after_existing_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(temp.path()).await;
    let queue = queue_with(&store, &manual_clock(), 3);
    queue
        .add_batch(3, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    let more = queue
        .add_batch(2, TaskType::Custom, TaskConfig::new())
        .await
        .unwrap();
    assert_eq!(more[0].id, 4);
    assert_eq!(more[1].id, 5);
    assert_eq!(queue.list_tasks().await.len(), 5);
}

#[tokio::test]
async fn clear_finished_keeps_retryable_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(temp.path()).await;
    let queue = queue_with(&store, &manual_clock(), 1);
    queue
        .add_batch(3, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();

    let a = queue.get_next_task("dev-A").await.unwrap().unwrap();
    queue.mark_completed("dev-A", a.id, None).await.unwrap();
    let b = queue.get_next_task("dev-A").await.unwrap().unwrap();
    queue.mark_failed("dev-A", b.id, "boom").await.unwrap();

    assert_eq!(queue.clear_finished().await.unwrap(), 2);
    let remaining = queue.list_tasks().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, 3);
    assert_eq!(remaining[0].status, TaskStatus::Pending);
}

#[tokio::test]
async fn ids_stay_unique_after_clearing_finished() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let store = open_store(temp.path()).await;
        let queue = queue_with(&store, &manual_clock(), 3);
        queue
            .add_batch(2, TaskType::CreateAccount, TaskConfig::new())
            .await
            .unwrap();
        for _ in 0..2 {
            let task = queue.get_next_task("dev-A").await.unwrap().unwrap();
            queue.mark_completed("dev-A", task.id, None).await.unwrap();
        }
        assert_eq!(queue.clear_finished().await.unwrap(), 2);

        let added = queue
            .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
            .await
            .unwrap();
        assert_eq!(added[0].id, 3);
        queue.get_next_task("dev-A").await.unwrap().unwrap();
        queue.mark_completed("dev-A", 3, None).await.unwrap();
        assert_eq!(queue.clear_finished().await.unwrap(), 1);
        assert!(queue.list_tasks().await.is_empty());
    }

    let store = open_store(temp.path()).await;
    let queue = queue_with(&store, &manual_clock(), 3);
    let added = queue
        .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    assert_eq!(added[0].id, 4);
}

#[tokio::test]
async fn wrong_device_cannot_report() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(temp.path()).await;
    let queue = queue_with(&store, &manual_clock(), 3);
    queue
        .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    queue.get_next_task("dev-A").await.unwrap().unwrap();

    let err = queue.mark_failed("dev-B", 1, "nope").await.unwrap_err();
    assert_eq!(err.to_string(), "not assigned: task 1 is not assigned to dev-B");
    assert_eq!(
        queue.get_task(1).await.unwrap().status,
        TaskStatus::InProgress
    );
}
