//! Aggregated status views for observability.

use serde::{Deserialize, Serialize};

use super::resource::PoolStats;
use super::session::SessionStatus;

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    /// Waiting for a device.
    pub pending: usize,
    /// Currently leased.
    pub in_progress: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Failed, retryable or terminal.
    pub failed: usize,
    /// All tasks.
    pub total: usize,
}

/// One device as seen by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Device identifier.
    pub device_id: String,
    /// Most recent worker session, if any.
    pub session_id: Option<String>,
    /// Status of that session.
    pub session_status: Option<SessionStatus>,
    /// Tasks the device currently holds.
    pub leased_tasks: Vec<u64>,
}

/// Snapshot returned by `get_global_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalStatus {
    /// Task counts.
    pub queue: QueueCounts,
    /// Known devices, sorted by id.
    pub devices: Vec<DeviceStatus>,
    /// Worker processes currently tracked by the supervisor.
    pub running_processes: usize,
    /// Location pool counts.
    pub locations: PoolStats,
    /// Email pool counts.
    pub emails: PoolStats,
}
