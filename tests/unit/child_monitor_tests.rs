//! Child process exit detection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use fleet_coordinator::orchestrator::child_monitor::poll_children;
use fleet_coordinator::orchestrator::ActiveChildren;

#[tokio::test]
async fn empty_registry_reports_nothing() {
    let children: ActiveChildren = Arc::new(Mutex::new(HashMap::new()));
    assert!(poll_children(&children).await.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn exited_child_is_reported_and_removed() {
    use fleet_coordinator::models::event::LifecycleEvent;
    use fleet_coordinator::orchestrator::TrackedChild;

    let mut child = tokio::process::Command::new("sh")
        .args(["-c", "exit 3"])
        .spawn()
        .expect("spawn sh");
    child.wait().await.expect("wait");

    let children: ActiveChildren = Arc::new(Mutex::new(HashMap::new()));
    children.lock().await.insert(
        "dev-A".into(),
        TrackedChild {
            session_id: "s-1".into(),
            child,
        },
    );

    let events = poll_children(&children).await;
    assert_eq!(
        events,
        vec![LifecycleEvent::ProcessExited {
            device_id: "dev-A".into(),
            session_id: "s-1".into(),
            exit_code: Some(3),
        }]
    );
    assert!(children.lock().await.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn running_child_stays_tracked() {
    use fleet_coordinator::orchestrator::TrackedChild;

    let child = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .expect("spawn sleep");

    let children: ActiveChildren = Arc::new(Mutex::new(HashMap::new()));
    children.lock().await.insert(
        "dev-A".into(),
        TrackedChild {
            session_id: "s-1".into(),
            child,
        },
    );

    assert!(poll_children(&children).await.is_empty());
    assert_eq!(children.lock().await.len(), 1);
}
