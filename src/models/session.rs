//! Worker session model and lifecycle helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for a device-bound worker process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record created, process not yet spawned.
    Starting,
    /// Worker process running.
    Running,
    /// Process exited on its own.
    Exited,
    /// Process stopped by the coordinator.
    Terminated,
    /// Coordinator restarted while the session was live.
    Interrupted,
}

/// A worker process bound to one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerSession {
    /// Session (lease) identifier handed to the worker.
    pub id: String,
    /// Device the worker drives.
    pub device_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Automation endpoint port reserved for this session.
    pub appium_port: u16,
    /// OS process id once spawned.
    pub pid: Option<u32>,
    /// Exit code once the process ended, `None` if killed by signal.
    pub exit_code: Option<i32>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl WorkerSession {
    /// Construct a new session with a generated identifier.
    #[must_use]
    pub fn new(device_id: String, appium_port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            device_id,
            status: SessionStatus::Starting,
            appium_port,
            pid: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the session still owns its device.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.status, SessionStatus::Starting | SessionStatus::Running)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (SessionStatus::Starting, SessionStatus::Running)
                | (
                    SessionStatus::Starting | SessionStatus::Running,
                    SessionStatus::Exited
                        | SessionStatus::Terminated
                        | SessionStatus::Interrupted
                )
        )
    }

    /// Apply a transition if allowed; returns whether it was applied.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if !self.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// The `servers` namespace: latest worker session per device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServersState {
    /// Device id to its most recent session.
    #[serde(default)]
    pub sessions: BTreeMap<String, WorkerSession>,
}

impl ServersState {
    /// Sessions that still own their device.
    pub fn live(&self) -> impl Iterator<Item = &WorkerSession> {
        self.sessions.values().filter(|s| s.is_live())
    }
}
