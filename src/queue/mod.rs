//! Task queue with per-device leasing and timeout reclamation.
//!
//! Tasks live in the `queue` namespace of the state store. Every operation
//! runs as one critical section under the store's document lock, so
//! concurrent `get_next_task` calls from many devices never lease the same
//! task twice. Each mutation is saved before the call returns.

pub mod clock;
pub mod reaper;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

pub use clock::{Clock, ManualClock, SystemClock};
pub use reaper::spawn_lease_reaper;

use crate::config::QueueConfig;
use crate::models::status::QueueCounts;
use crate::models::task::{QueueState, Task, TaskConfig, TaskStatus, TaskType};
use crate::store::StateStore;
use crate::{AppError, Result};

/// Which leases a reclamation pass revokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// Every in-progress task; the previous holders are presumed dead.
    Startup,
    /// Only leases at least as old as the lease timeout.
    Runtime,
}

/// A lease revoked by reclamation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    /// Task returned to pending.
    pub task_id: u64,
    /// Device that held it.
    pub device_id: String,
}

/// Durable task queue shared by every device worker.
pub struct TaskQueue {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    lease_timeout: chrono::Duration,
    default_max_attempts: u32,
}

impl TaskQueue {
    /// Construct a queue over `store`.
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        lease_timeout: Duration,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            lease_timeout: chrono::Duration::from_std(lease_timeout)
                .unwrap_or(chrono::Duration::MAX),
            default_max_attempts: default_max_attempts.max(1),
        }
    }

    /// Construct a queue from the `[queue]` configuration section.
    #[must_use]
    pub fn from_config(store: Arc<StateStore>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        Self::new(store, clock, config.lease_timeout(), config.default_max_attempts)
    }

    /// Recover from a restart: return every in-progress task to pending and
    /// clear all device assignments.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the recovered state cannot be saved.
    pub async fn initialize(&self) -> Result<Vec<Reclaimed>> {
        let reclaimed = self.reclaim_abandoned(ReclaimMode::Startup).await?;
        info!(count = reclaimed.len(), "task queue initialized");
        Ok(reclaimed)
    }

    /// Append `count` pending tasks with fresh ids.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn add_batch(
        &self,
        count: usize,
        task_type: TaskType,
        config: TaskConfig,
    ) -> Result<Vec<Task>> {
        let span = info_span!("queue_add_batch", count, %task_type);
        async {
            let now = self.clock.now();
            let max_attempts = self.default_max_attempts;
            let added = self
                .store
                .try_update::<QueueState, _>(|queue| {
                    let first = queue.reserve_ids(u64::try_from(count).unwrap_or(u64::MAX));
                    let added: Vec<Task> = (first..)
                        .take(count)
                        .map(|id| Task::new(id, task_type, config.clone(), max_attempts, now))
                        .collect();
                    queue.tasks.extend(added.iter().cloned());
                    Ok(added)
                })
                .await?;
            self.store.save().await?;
            info!(
                first_id = added.first().map(|t| t.id),
                last_id = added.last().map(|t| t.id),
                "tasks enqueued"
            );
            Ok(added)
        }
        .instrument(span)
        .await
    }

    /// Lease the next eligible task to `device_id`.
    ///
    /// Expired leases are reclaimed first. Tasks are considered in insertion
    /// order. Returns `None` when nothing is eligible.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn get_next_task(&self, device_id: &str) -> Result<Option<Task>> {
        let span = info_span!("queue_get_next_task", device_id);
        async {
            let now = self.clock.now();
            let timeout = self.lease_timeout;
            let (reclaimed, leased) = self
                .store
                .try_update::<QueueState, _>(|queue| {
                    let reclaimed = reclaim(queue, ReclaimMode::Runtime, now, timeout);
                    let leased = lease_next(queue, device_id, now);
                    Ok((reclaimed, leased))
                })
                .await?;
            self.store.save().await?;

            for lease in &reclaimed {
                warn!(task_id = lease.task_id, holder = %lease.device_id, "expired lease reclaimed");
            }
            match &leased {
                Some(task) => info!(task_id = task.id, attempts = task.attempts, "task leased"),
                None => info!("no task available"),
            }
            Ok(leased)
        }
        .instrument(span)
        .await
    }

    /// Report success for a task leased to `device_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id, `AppError::NotAssigned`
    /// if the task is not leased to `device_id`, or `AppError::Persistence`.
    pub async fn mark_completed(
        &self,
        device_id: &str,
        task_id: u64,
        result: Option<serde_json::Value>,
    ) -> Result<Task> {
        let span = info_span!("queue_mark_completed", device_id, task_id);
        async {
            let now = self.clock.now();
            let task = self
                .store
                .try_update::<QueueState, _>(|queue| {
                    let task = owned_task(queue, device_id, task_id)?;
                    task.complete(result, now);
                    let task = task.clone();
                    queue.unassign(device_id, task_id);
                    Ok(task)
                })
                .await?;
            self.store.save().await?;
            info!("task completed");
            Ok(task)
        }
        .instrument(span)
        .await
    }

    /// Report failure for a task leased to `device_id`.
    ///
    /// The task returns to pending while attempts remain, otherwise it
    /// becomes terminally failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id, `AppError::NotAssigned`
    /// if the task is not leased to `device_id`, or `AppError::Persistence`.
    pub async fn mark_failed(&self, device_id: &str, task_id: u64, error: &str) -> Result<Task> {
        let span = info_span!("queue_mark_failed", device_id, task_id);
        async {
            let now = self.clock.now();
            let task = self
                .store
                .try_update::<QueueState, _>(|queue| {
                    let task = owned_task(queue, device_id, task_id)?;
                    task.fail(error.to_owned(), now);
                    let task = task.clone();
                    queue.unassign(device_id, task_id);
                    Ok(task)
                })
                .await?;
            self.store.save().await?;
            match task.status {
                TaskStatus::Failed => warn!(attempts = task.attempts, error, "task failed permanently"),
                _ => info!(attempts = task.attempts, error, "task failed, will retry"),
            }
            Ok(task)
        }
        .instrument(span)
        .await
    }

    /// Revoke abandoned leases and return those tasks to pending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn reclaim_abandoned(&self, mode: ReclaimMode) -> Result<Vec<Reclaimed>> {
        let now = self.clock.now();
        let timeout = self.lease_timeout;
        let reclaimed = self
            .store
            .try_update::<QueueState, _>(|queue| Ok(reclaim(queue, mode, now, timeout)))
            .await?;
        self.store.save().await?;
        for lease in &reclaimed {
            warn!(?mode, task_id = lease.task_id, device_id = %lease.device_id, "lease reclaimed");
        }
        Ok(reclaimed)
    }

    /// Look up one task.
    pub async fn get_task(&self, task_id: u64) -> Option<Task> {
        self.store
            .read(|doc| doc.queue.task(task_id).cloned())
            .await
    }

    /// Every task in insertion order.
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.store.read(|doc| doc.queue.tasks.clone()).await
    }

    /// Tasks currently leased to `device_id`.
    pub async fn tasks_for_device(&self, device_id: &str) -> Vec<Task> {
        self.store
            .read(|doc| {
                doc.queue
                    .tasks
                    .iter()
                    .filter(|t| t.is_leased_to(device_id))
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Task counts by status.
    pub async fn counts(&self) -> QueueCounts {
        self.store.read(|doc| count_tasks(&doc.queue)).await
    }

    /// Remove completed and terminally failed tasks. Returns how many went.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn clear_finished(&self) -> Result<usize> {
        let removed = self
            .store
            .try_update::<QueueState, _>(|queue| {
                let before = queue.tasks.len();
                queue.tasks.retain(|t| !t.is_terminal());
                Ok(before - queue.tasks.len())
            })
            .await?;
        self.store.save().await?;
        info!(removed, "finished tasks cleared");
        Ok(removed)
    }
}

fn owned_task<'a>(queue: &'a mut QueueState, device_id: &str, task_id: u64) -> Result<&'a mut Task> {
    let task = queue
        .task_mut(task_id)
        .ok_or_else(|| AppError::NotFound(format!("task {task_id} does not exist")))?;
    if !task.is_leased_to(device_id) {
        return Err(AppError::NotAssigned(format!(
            "task {task_id} is not assigned to {device_id}"
        )));
    }
    Ok(task)
}

fn lease_next(queue: &mut QueueState, device_id: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Task> {
    let mut leased = None;
    for task in &mut queue.tasks {
        if task.status == TaskStatus::Pending && !task.has_attempts_left() {
            task.exhaust(now);
            warn!(task_id = task.id, "pending task has no attempts left, marked failed");
            continue;
        }
        if task.is_leasable() {
            task.lease(device_id, now);
            leased = Some(task.clone());
            break;
        }
    }
    if let Some(task) = &leased {
        queue.assign(device_id, task.id);
    }
    leased
}

fn reclaim(
    queue: &mut QueueState,
    mode: ReclaimMode,
    now: chrono::DateTime<chrono::Utc>,
    timeout: chrono::Duration,
) -> Vec<Reclaimed> {
    let mut reclaimed = Vec::new();
    for task in &mut queue.tasks {
        if task.status != TaskStatus::InProgress {
            continue;
        }
        let expired = match mode {
            ReclaimMode::Startup => true,
            ReclaimMode::Runtime => task
                .started_at
                .is_none_or(|started| now.signed_duration_since(started) >= timeout),
        };
        if !expired {
            continue;
        }
        reclaimed.push(Reclaimed {
            task_id: task.id,
            device_id: task.device_id.clone().unwrap_or_default(),
        });
        task.reclaim();
    }

    match mode {
        ReclaimMode::Startup => queue.device_assignments.clear(),
        ReclaimMode::Runtime => {
            for lease in &reclaimed {
                queue.unassign(&lease.device_id, lease.task_id);
            }
        }
    }
    reclaimed
}

fn count_tasks(queue: &QueueState) -> QueueCounts {
    let mut counts = QueueCounts {
        total: queue.tasks.len(),
        ..QueueCounts::default()
    };
    for task in &queue.tasks {
        match task.status {
            TaskStatus::Pending => counts.pending += 1,
            TaskStatus::InProgress => counts.in_progress += 1,
            TaskStatus::Completed => counts.completed += 1,
            TaskStatus::Failed => counts.failed += 1,
        }
    }
    counts
}
