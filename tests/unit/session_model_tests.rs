//! Worker session lifecycle transitions.

use fleet_coordinator::models::session::{ServersState, SessionStatus, WorkerSession};

#[test]
fn new_session_is_starting_and_live() {
    let session = WorkerSession::new("dev-A".into(), 4723);
    assert_eq!(session.status, SessionStatus::Starting);
    assert!(session.is_live());
    assert!(uuid::Uuid::parse_str(&session.id).is_ok());
}

#[test]
fn starting_to_running_allowed() {
    let mut session = WorkerSession::new("dev-A".into(), 4723);
    assert!(session.transition(SessionStatus::Running));
    assert_eq!(session.status, SessionStatus::Running);
}

#[test]
fn ended_sessions_cannot_restart() {
    for end in [
        SessionStatus::Exited,
        SessionStatus::Terminated,
        SessionStatus::Interrupted,
    ] {
        let mut session = WorkerSession::new("dev-A".into(), 4723);
        assert!(session.transition(end));
        assert!(!session.is_live());
        assert!(!session.transition(SessionStatus::Running));
        assert_eq!(session.status, end);
    }
}

#[test]
fn running_cannot_go_back_to_starting() {
    let mut session = WorkerSession::new("dev-A".into(), 4723);
    session.transition(SessionStatus::Running);
    assert!(!session.can_transition_to(SessionStatus::Starting));
}

#[test]
fn live_filters_ended_sessions() {
    let mut state = ServersState::default();
    let running = WorkerSession::new("dev-A".into(), 4723);
    let mut exited = WorkerSession::new("dev-B".into(), 4724);
    exited.transition(SessionStatus::Exited);
    state.sessions.insert("dev-A".into(), running);
    state.sessions.insert("dev-B".into(), exited);

    let live: Vec<_> = state.live().map(|s| s.device_id.as_str()).collect();
    assert_eq!(live, vec!["dev-A"]);
}
