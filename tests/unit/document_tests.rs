//! Namespace routing and section replacement on the state document.

use fleet_coordinator::models::task::{QueueState, Task, TaskConfig, TaskType};
use fleet_coordinator::store::document::{assign_path, DOCUMENT_VERSION};
use fleet_coordinator::store::{Namespace, StateDocument};
use fleet_coordinator::AppError;

#[test]
fn namespace_names_and_legacy_files() {
    let expected = [
        (Namespace::Queue, "queue", "task-queue.json"),
        (Namespace::Locations, "locations", "location-state.json"),
        (Namespace::Resources, "resources", "resources.json"),
        (Namespace::Ui, "ui", "ui-state.json"),
        (Namespace::Servers, "servers", "servers.json"),
    ];
    for (ns, name, file) in expected {
        assert_eq!(ns.as_str(), name);
        assert_eq!(ns.legacy_file_name(), file);
        assert_eq!(Namespace::parse(name), Some(ns));
        assert_eq!(ns.to_string(), name);
    }
    assert_eq!(Namespace::parse("settings"), None);
}

#[test]
fn new_document_has_current_version_and_empty_sections() {
    let doc = StateDocument::new();
    assert_eq!(doc.version, DOCUMENT_VERSION);
    assert!(doc.queue.tasks.is_empty());
    assert!(doc.locations.available.is_empty());
    assert!(doc.servers.sessions.is_empty());
}

#[test]
fn replace_section_leaves_siblings_untouched() {
    let mut doc = StateDocument::new();
    doc.ui.0.insert("theme".into(), serde_json::json!("dark"));

    let mut queue = QueueState::default();
    queue.tasks.push(Task::new(
        1,
        TaskType::Test,
        TaskConfig::new(),
        3,
        chrono::Utc::now(),
    ));
    doc.replace_section(Namespace::Queue, serde_json::to_value(&queue).unwrap())
        .unwrap();

    assert_eq!(doc.queue.tasks.len(), 1);
    assert_eq!(doc.ui.0["theme"], "dark");
}

#[test]
fn shape_mismatch_is_rejected_without_change() {
    let mut doc = StateDocument::new();
    doc.ui.0.insert("theme".into(), serde_json::json!("dark"));
    let before = doc.clone();

    let err = doc
        .replace_section(Namespace::Queue, serde_json::json!({"tasks": "not a list"}))
        .unwrap_err();
    assert!(matches!(err, AppError::Serialization(ref msg) if msg.contains("queue")));
    assert_eq!(doc, before);
}

#[test]
fn reset_section_restores_skeleton() {
    let mut doc = StateDocument::new();
    doc.ui.0.insert("theme".into(), serde_json::json!("dark"));
    doc.reset_section(Namespace::Ui);
    assert!(doc.ui.0.is_empty());
}

#[test]
fn unknown_fields_and_missing_sections_load() {
    let raw = serde_json::json!({
        "version": 1,
        "queue": {"tasks": [], "deviceAssignments": {}},
        "somethingElse": 42
    });
    let doc: StateDocument = serde_json::from_value(raw).unwrap();
    assert!(doc.locations.available.is_empty());
    assert!(doc.resources.emails.available.is_empty());
}

#[test]
fn assign_path_creates_intermediate_objects() {
    let mut value = serde_json::json!({});
    assign_path(&mut value, "layout.sidebar.width", serde_json::json!(240)).unwrap();
    assert_eq!(value["layout"]["sidebar"]["width"], 240);
}

#[test]
fn assign_path_through_scalar_fails() {
    let mut value = serde_json::json!({"layout": 3});
    let err = assign_path(&mut value, "layout.width", serde_json::json!(1)).unwrap_err();
    assert!(matches!(err, AppError::Serialization(_)));
}

#[test]
fn empty_path_replaces_root() {
    let mut value = serde_json::json!({"a": 1});
    assign_path(&mut value, "", serde_json::json!({"b": 2})).unwrap();
    assert_eq!(value, serde_json::json!({"b": 2}));
}
