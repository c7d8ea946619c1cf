//! Lifecycle event handling, launch guards, and global status.

use fleet_coordinator::models::event::LifecycleEvent;
use fleet_coordinator::models::session::{SessionStatus, WorkerSession};
use fleet_coordinator::models::task::{TaskConfig, TaskStatus, TaskType};
use fleet_coordinator::orchestrator::session_manager::record_session;
use fleet_coordinator::store::StateStore;
use fleet_coordinator::AppError;

use super::test_helpers::fleet;

async fn running_session(store: &StateStore, device: &str) -> WorkerSession {
    let mut session = WorkerSession::new(device.into(), 4723);
    session.transition(SessionStatus::Running);
    record_session(store, session.clone()).await.unwrap();
    session
}

#[tokio::test]
async fn clean_exit_completes_leased_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let queue = fleet.orchestrator.queue();
    queue
        .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    queue.get_next_task("dev-A").await.unwrap().unwrap();
    let session = running_session(&fleet.store, "dev-A").await;

    fleet
        .orchestrator
        .handle_event(LifecycleEvent::ProcessExited {
            device_id: "dev-A".into(),
            session_id: session.id.clone(),
            exit_code: Some(0),
        })
        .await
        .unwrap();

    assert_eq!(queue.get_task(1).await.unwrap().status, TaskStatus::Completed);
    let stored = fleet
        .store
        .read(|doc| doc.servers.sessions["dev-A"].clone())
        .await;
    assert_eq!(stored.status, SessionStatus::Exited);
    assert_eq!(stored.exit_code, Some(0));
}

#[tokio::test]
async fn crash_exit_fails_leased_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let queue = fleet.orchestrator.queue();
    queue
        .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    queue.get_next_task("dev-A").await.unwrap().unwrap();
    let session = running_session(&fleet.store, "dev-A").await;

    fleet
        .orchestrator
        .handle_event(LifecycleEvent::ProcessExited {
            device_id: "dev-A".into(),
            session_id: session.id,
            exit_code: Some(2),
        })
        .await
        .unwrap();

    let task = queue.get_task(1).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.last_error.as_deref(), Some("worker exited with code 2"));
}

#[tokio::test]
async fn exit_for_unknown_session_still_releases_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let queue = fleet.orchestrator.queue();
    queue
        .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    queue.get_next_task("dev-A").await.unwrap().unwrap();

    fleet
        .orchestrator
        .handle_event(LifecycleEvent::ProcessExited {
            device_id: "dev-A".into(),
            session_id: "gone".into(),
            exit_code: None,
        })
        .await
        .unwrap();

    let task = queue.get_task(1).await.unwrap();
    assert_eq!(task.last_error.as_deref(), Some("worker killed by signal"));
}

#[tokio::test]
async fn stale_exit_keeps_leases_of_replacement_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let queue = fleet.orchestrator.queue();
    queue
        .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    let old = running_session(&fleet.store, "dev-A").await;
    let current = running_session(&fleet.store, "dev-A").await;
    queue.get_next_task("dev-A").await.unwrap().unwrap();

    fleet
        .orchestrator
        .handle_event(LifecycleEvent::ProcessExited {
            device_id: "dev-A".into(),
            session_id: old.id,
            exit_code: Some(1),
        })
        .await
        .unwrap();

    let task = queue.get_task(1).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.attempts, 1);
    assert!(task.last_error.is_none());
    let stored = fleet
        .store
        .read(|doc| doc.servers.sessions["dev-A"].clone())
        .await;
    assert_eq!(stored.id, current.id);
    assert_eq!(stored.status, SessionStatus::Running);
}

#[tokio::test]
async fn lease_reclaimed_event_is_informational() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    fleet
        .orchestrator
        .handle_event(LifecycleEvent::LeaseReclaimed {
            device_id: "dev-A".into(),
            task_id: 1,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn launch_rejects_empty_device_list() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let err = fleet
        .orchestrator
        .launch_session(&["  ".to_owned()], TaskConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[tokio::test]
async fn launch_over_session_limit_is_capacity_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let devices: Vec<String> = ["dev-A", "dev-B", "dev-C"].map(String::from).to_vec();
    let err = fleet
        .orchestrator
        .launch_session(&devices, TaskConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Capacity(_)));
    assert!(fleet.store.read(|doc| doc.servers.sessions.is_empty()).await);
}

#[tokio::test]
async fn failed_spawn_marks_session_exited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let err = fleet
        .orchestrator
        .launch_session(&["dev-A".to_owned()], TaskConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Spawn(_)));

    let session = fleet
        .store
        .read(|doc| doc.servers.sessions["dev-A"].clone())
        .await;
    assert_eq!(session.status, SessionStatus::Exited);
    assert_eq!(session.appium_port, fleet.config.worker.appium_base_port);
    assert!(fleet.orchestrator.children().lock().await.is_empty());
}

#[tokio::test]
async fn terminate_without_worker_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let err = fleet.orchestrator.terminate_session("dev-A").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn status_merges_sessions_and_assignments() {
    let temp = tempfile::tempdir().expect("tempdir");
    let fleet = fleet(temp.path()).await;
    let queue = fleet.orchestrator.queue();
    queue
        .add_batch(3, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    queue.get_next_task("dev-B").await.unwrap().unwrap();
    running_session(&fleet.store, "dev-A").await;
    fleet
        .orchestrator
        .emails()
        .add_emails(["a@x.io", "b@x.io"])
        .await
        .unwrap();
    fleet.orchestrator.emails().allocate("dev-B").await.unwrap();

    let status = fleet.orchestrator.get_global_status().await;
    assert_eq!(status.queue.pending, 2);
    assert_eq!(status.queue.in_progress, 1);
    assert_eq!(status.running_processes, 0);
    assert_eq!(status.emails.allocated, 1);
    assert_eq!(status.emails.available, 1);
    assert_eq!(status.locations.total, 0);

    let ids: Vec<&str> = status.devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["dev-A", "dev-B"]);
    assert_eq!(status.devices[0].session_status, Some(SessionStatus::Running));
    assert!(status.devices[0].leased_tasks.is_empty());
    assert_eq!(status.devices[1].leased_tasks, vec![1]);
    assert!(status.devices[1].session_id.is_none());
}

#[tokio::test]
async fn dispatcher_applies_exit_events_from_channel() {
    use std::sync::Arc;

    use fleet_coordinator::orchestrator::dispatcher::spawn_lifecycle_dispatcher;

    let temp = tempfile::tempdir().expect("tempdir");
    let super::test_helpers::Fleet {
        orchestrator,
        events,
        store,
        ..
    } = fleet(temp.path()).await;
    let queue = Arc::clone(orchestrator.queue());
    queue
        .add_batch(1, TaskType::CreateAccount, TaskConfig::new())
        .await
        .unwrap();
    queue.get_next_task("dev-A").await.unwrap().unwrap();
    let session = running_session(&store, "dev-A").await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = spawn_lifecycle_dispatcher(Arc::clone(&orchestrator), events, cancel.clone());
    orchestrator
        .event_sender()
        .send(LifecycleEvent::ProcessExited {
            device_id: "dev-A".into(),
            session_id: session.id,
            exit_code: Some(0),
        })
        .await
        .unwrap();

    for _ in 0..50 {
        if queue.get_task(1).await.unwrap().status == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(queue.get_task(1).await.unwrap().status, TaskStatus::Completed);
    cancel.cancel();
    handle.await.unwrap();
}
