//! Task lease transitions and queue section helpers.

use chrono::{TimeZone, Utc};

use fleet_coordinator::models::task::{QueueState, Task, TaskConfig, TaskStatus, TaskType};

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
}

fn task(id: u64, max_attempts: u32) -> Task {
    Task::new(id, TaskType::CreateAccount, TaskConfig::new(), max_attempts, at(0))
}

#[test]
fn new_task_is_pending_and_leasable() {
    let t = task(1, 3);
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.attempts, 0);
    assert!(t.device_id.is_none());
    assert!(t.is_leasable());
    assert!(!t.is_terminal());
}

#[test]
fn lease_sets_holder_and_counts_attempt() {
    let mut t = task(1, 3);
    t.lease("dev-A", at(5));
    assert_eq!(t.status, TaskStatus::InProgress);
    assert_eq!(t.device_id.as_deref(), Some("dev-A"));
    assert_eq!(t.started_at, Some(at(5)));
    assert_eq!(t.attempts, 1);
    assert!(t.is_leased_to("dev-A"));
    assert!(!t.is_leased_to("dev-B"));
    assert!(!t.is_leasable());
}

#[test]
fn complete_clears_lease_and_stores_result() {
    let mut t = task(1, 3);
    t.lease("dev-A", at(1));
    t.complete(Some(serde_json::json!({"account": "abc"})), at(2));
    assert_eq!(t.status, TaskStatus::Completed);
    assert!(t.device_id.is_none());
    assert!(t.started_at.is_none());
    assert_eq!(t.completed_at, Some(at(2)));
    assert!(t.is_terminal());
}

#[test]
fn fail_with_attempts_left_returns_to_pending() {
    let mut t = task(1, 3);
    t.lease("dev-A", at(1));
    let status = t.fail("timeout".into(), at(2));
    assert_eq!(status, TaskStatus::Pending);
    assert_eq!(t.attempts, 1);
    assert_eq!(t.last_error.as_deref(), Some("timeout"));
    assert!(t.device_id.is_none());
}

#[test]
fn fail_on_last_attempt_is_terminal() {
    let mut t = task(1, 1);
    t.lease("dev-A", at(1));
    let status = t.fail("crash".into(), at(2));
    assert_eq!(status, TaskStatus::Failed);
    assert!(t.is_terminal());
    assert!(!t.is_leasable());
}

#[test]
fn reclaim_does_not_refund_attempt() {
    let mut t = task(1, 3);
    t.lease("dev-A", at(1));
    t.reclaim();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.attempts, 1);
    assert!(t.device_id.is_none());
    assert!(t.started_at.is_none());
}

#[test]
fn exhaust_keeps_existing_error() {
    let mut t = task(1, 1);
    t.lease("dev-A", at(1));
    t.fail("boom".into(), at(2));
    t.exhaust(at(3));
    assert_eq!(t.last_error.as_deref(), Some("boom"));

    let mut fresh = task(2, 1);
    fresh.lease("dev-A", at(1));
    fresh.reclaim();
    fresh.exhaust(at(3));
    assert_eq!(fresh.status, TaskStatus::Failed);
    assert_eq!(fresh.last_error.as_deref(), Some("attempts exhausted"));
}

#[test]
fn task_json_is_camel_case() {
    let mut t = task(7, 3);
    t.lease("dev-A", at(1));
    let value = serde_json::to_value(&t).expect("serialize");
    assert_eq!(value["type"], "create_account");
    assert_eq!(value["status"], "in_progress");
    assert_eq!(value["deviceId"], "dev-A");
    assert_eq!(value["maxAttempts"], 3);
    assert!(value.get("startedAt").is_some());
    assert!(value.get("completedAt").is_none());
}

#[test]
fn reserved_ids_start_at_one() {
    let mut queue = QueueState::default();
    assert_eq!(queue.reserve_ids(3), 1);
    assert_eq!(queue.next_id, 4);
    assert_eq!(queue.reserve_ids(1), 4);
}

#[test]
fn reserved_ids_resume_after_highest_task_without_mark() {
    let mut queue = QueueState::default();
    queue.tasks.push(task(4, 3));
    queue.tasks.push(task(2, 3));
    assert_eq!(queue.reserve_ids(2), 5);
    assert_eq!(queue.next_id, 7);
}

#[test]
fn reserved_ids_never_reuse_removed_tasks() {
    let mut queue = QueueState::default();
    let first = queue.reserve_ids(2);
    queue.tasks.push(task(first, 3));
    queue.tasks.push(task(first + 1, 3));
    queue.tasks.clear();
    assert_eq!(queue.reserve_ids(1), 3);
}

#[test]
fn queue_files_without_mark_still_load() {
    let queue: QueueState =
        serde_json::from_value(serde_json::json!({"tasks": [], "deviceAssignments": {}}))
            .expect("legacy shape");
    assert_eq!(queue.next_id, 0);
}

#[test]
fn assign_and_unassign_maintain_index() {
    let mut queue = QueueState::default();
    queue.assign("dev-A", 1);
    queue.assign("dev-A", 1);
    queue.assign("dev-A", 2);
    assert_eq!(queue.device_assignments["dev-A"], vec![1, 2]);

    queue.unassign("dev-A", 1);
    assert_eq!(queue.device_assignments["dev-A"], vec![2]);
    queue.unassign("dev-A", 2);
    assert!(!queue.device_assignments.contains_key("dev-A"));
}

#[test]
fn task_type_wire_names_round_trip() {
    for kind in [TaskType::CreateAccount, TaskType::Test, TaskType::Custom] {
        assert_eq!(TaskType::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(TaskType::parse("bogus"), None);
}
