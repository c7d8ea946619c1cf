//! Lifecycle events consumed by the orchestrator's dispatcher.

use serde::{Deserialize, Serialize};

/// Something happened to a worker process or a lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A supervised worker process ended.
    ProcessExited {
        /// Device the worker was bound to.
        device_id: String,
        /// Session that owned the process.
        session_id: String,
        /// Exit code, `None` when killed by a signal.
        exit_code: Option<i32>,
    },
    /// The lease reaper revoked an expired lease.
    LeaseReclaimed {
        /// Device that held the lease.
        device_id: String,
        /// Task returned to pending.
        task_id: u64,
    },
}
