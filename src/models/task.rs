//! Task model, lease transitions, and the persisted queue section.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque per-task configuration handed to the worker.
pub type TaskConfig = serde_json::Map<String, serde_json::Value>;

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Full account creation run.
    #[default]
    CreateAccount,
    /// Dry run that exercises the device without creating anything.
    Test,
    /// Worker-defined job described entirely by `config`.
    Custom,
}

impl TaskType {
    /// Wire name used in config files and IPC requests.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateAccount => "create_account",
            Self::Test => "test",
            Self::Custom => "custom",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create_account" => Some(Self::CreateAccount),
            "test" => Some(Self::Test),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task.
///
/// Transitions:
/// - `Pending -> InProgress` on lease
/// - `InProgress -> Completed` on success
/// - `InProgress -> Pending` on a retryable failure or reclamation
/// - `InProgress -> Failed` once the attempt budget is spent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a device.
    Pending,
    /// Leased to exactly one device.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Failed; terminal once `attempts >= max_attempts`.
    Failed,
}

/// A unit of work leased to one device at a time.
///
/// Field names are camelCase on disk so legacy readers of the queue file
/// keep working.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Monotonically assigned identifier.
    pub id: u64,
    /// Kind of work.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Opaque worker configuration.
    #[serde(default)]
    pub config: TaskConfig,
    /// Lease holder; set only while `InProgress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Leases handed out so far.
    #[serde(default)]
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Lease start; set only while `InProgress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Last reported error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Worker-reported result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Task {
    /// Construct a new pending task.
    #[must_use]
    pub fn new(
        id: u64,
        task_type: TaskType,
        config: TaskConfig,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            status: TaskStatus::Pending,
            config,
            device_id: None,
            attempts: 0,
            max_attempts,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            result: None,
        }
    }

    /// Whether the attempt budget still allows another lease.
    #[must_use]
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether `get_next_task` may hand this task out.
    #[must_use]
    pub fn is_leasable(&self) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Failed => self.has_attempts_left(),
            TaskStatus::InProgress | TaskStatus::Completed => false,
        }
    }

    /// Whether the task is currently leased to `device_id`.
    #[must_use]
    pub fn is_leased_to(&self, device_id: &str) -> bool {
        self.status == TaskStatus::InProgress && self.device_id.as_deref() == Some(device_id)
    }

    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Failed => !self.has_attempts_left(),
            TaskStatus::Pending | TaskStatus::InProgress => false,
        }
    }

    /// Start a lease for `device_id`.
    pub fn lease(&mut self, device_id: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.device_id = Some(device_id.to_owned());
        self.started_at = Some(now);
        self.attempts += 1;
    }

    /// Finish the lease successfully.
    pub fn complete(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.result = result;
        self.device_id = None;
        self.started_at = None;
    }

    /// Finish the lease with a failure. Returns the resulting status.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> TaskStatus {
        self.status = if self.has_attempts_left() {
            TaskStatus::Pending
        } else {
            TaskStatus::Failed
        };
        self.last_error = Some(error);
        self.failed_at = Some(now);
        self.device_id = None;
        self.started_at = None;
        self.status
    }

    /// End an abandoned lease without counting it as a reported failure.
    pub fn reclaim(&mut self) {
        self.status = TaskStatus::Pending;
        self.device_id = None;
        self.started_at = None;
    }

    /// Mark a pending task whose budget is already spent as terminally failed.
    pub fn exhaust(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.failed_at = Some(now);
        if self.last_error.is_none() {
            self.last_error = Some("attempts exhausted".into());
        }
    }
}

/// The `queue` namespace: every task plus the per-device lease index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    /// Tasks in insertion order.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Device id to the ids of tasks it currently holds.
    #[serde(default)]
    pub device_assignments: BTreeMap<String, Vec<u64>>,
    /// Lowest id never handed out. Zero in files that predate it.
    #[serde(default)]
    pub next_id: u64,
}

impl QueueState {
    /// Reserve `count` consecutive ids and return the first.
    ///
    /// Ids never move backwards, even after finished tasks are removed.
    /// Files without a stored mark resume after their highest task id.
    pub fn reserve_ids(&mut self, count: u64) -> u64 {
        let after_max = self.tasks.iter().map(|t| t.id).max().map_or(1, |max| max + 1);
        let first = self.next_id.max(after_max);
        self.next_id = first.saturating_add(count);
        first
    }

    /// Look up a task by id.
    #[must_use]
    pub fn task(&self, id: u64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up a task by id for mutation.
    pub fn task_mut(&mut self, id: u64) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Record that `device_id` now holds `task_id`.
    pub fn assign(&mut self, device_id: &str, task_id: u64) {
        let held = self
            .device_assignments
            .entry(device_id.to_owned())
            .or_default();
        if !held.contains(&task_id) {
            held.push(task_id);
        }
    }

    /// Drop `task_id` from `device_id`'s list, removing empty lists.
    pub fn unassign(&mut self, device_id: &str, task_id: u64) {
        if let Some(held) = self.device_assignments.get_mut(device_id) {
            held.retain(|id| *id != task_id);
            if held.is_empty() {
                self.device_assignments.remove(device_id);
            }
        }
    }
}
