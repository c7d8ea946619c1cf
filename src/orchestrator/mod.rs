//! Fleet orchestration.
//!
//! Covers worker process spawning, session lifecycle management, lifecycle
//! event dispatch, and checkpoint creation/restore. The [`Orchestrator`]
//! composes the task queue, the resource pools, and the state store, and is
//! the only component that starts or stops worker processes.

pub mod checkpoint_manager;
pub mod child_monitor;
pub mod dispatcher;
pub mod session_manager;
pub mod spawner;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::checkpoint::Checkpoint;
use crate::models::event::LifecycleEvent;
use crate::models::session::{SessionStatus, WorkerSession};
use crate::models::status::{DeviceStatus, GlobalStatus};
use crate::models::task::{Task, TaskConfig, TaskType};
use crate::pool::{EmailPool, LocationPool};
use crate::queue::{spawn_lease_reaper, Reclaimed, TaskQueue};
use crate::store::{Namespace, StateStore};
use crate::{AppError, Result};

use self::checkpoint_manager::CheckpointSummary;

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A running worker process and the session it belongs to.
pub struct TrackedChild {
    /// Session that owns the process.
    pub session_id: String,
    /// The process handle.
    pub child: Child,
}

/// Live worker processes keyed by device id.
pub type ActiveChildren = Arc<Mutex<HashMap<String, TrackedChild>>>;

/// Result of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions from the previous run marked interrupted.
    pub interrupted_sessions: usize,
    /// Leases returned to pending.
    pub reclaimed: Vec<Reclaimed>,
}

/// Composes the queue, pools, store, and worker supervision.
pub struct Orchestrator {
    config: Arc<GlobalConfig>,
    store: Arc<StateStore>,
    queue: Arc<TaskQueue>,
    locations: LocationPool,
    emails: EmailPool,
    children: ActiveChildren,
    events: mpsc::Sender<LifecycleEvent>,
    launch_lock: Mutex<()>,
}

impl Orchestrator {
    /// Construct an orchestrator and the receiving end of its event channel.
    ///
    /// Hand the receiver to [`Self::spawn_background`] (or drain it in tests).
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        store: Arc<StateStore>,
        queue: Arc<TaskQueue>,
        locations: LocationPool,
        emails: EmailPool,
    ) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Self {
            config,
            store,
            queue,
            locations,
            emails,
            children: Arc::new(Mutex::new(HashMap::new())),
            events,
            launch_lock: Mutex::new(()),
        };
        (orchestrator, rx)
    }

    /// Task queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Location pool.
    #[must_use]
    pub fn locations(&self) -> &LocationPool {
        &self.locations
    }

    /// Email pool.
    #[must_use]
    pub fn emails(&self) -> &EmailPool {
        &self.emails
    }

    /// State store.
    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Registry of live worker processes.
    #[must_use]
    pub fn children(&self) -> &ActiveChildren {
        &self.children
    }

    /// Sender for lifecycle events.
    #[must_use]
    pub fn event_sender(&self) -> mpsc::Sender<LifecycleEvent> {
        self.events.clone()
    }

    /// Startup recovery: interrupt sessions from the previous run and
    /// return every in-progress task to pending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the recovered state cannot be saved.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let interrupted_sessions = session_manager::interrupt_stale_sessions(&self.store).await?;
        let reclaimed = self.queue.initialize().await?;
        info!(
            interrupted_sessions,
            reclaimed = reclaimed.len(),
            "startup recovery complete"
        );
        Ok(RecoveryReport {
            interrupted_sessions,
            reclaimed,
        })
    }

    /// Start the dispatcher, the child monitor, and the lease reaper.
    #[must_use]
    pub fn spawn_background(
        self: &Arc<Self>,
        rx: mpsc::Receiver<LifecycleEvent>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            dispatcher::spawn_lifecycle_dispatcher(Arc::clone(self), rx, cancel.child_token()),
            child_monitor::spawn_child_monitor(
                Arc::clone(&self.children),
                self.events.clone(),
                self.config.worker.exit_poll_interval(),
                cancel.child_token(),
            ),
            spawn_lease_reaper(
                Arc::clone(&self.queue),
                self.config.queue.cleanup_interval(),
                cancel.child_token(),
                Some(self.events.clone()),
            ),
        ]
    }

    /// Start one worker process per device.
    ///
    /// Each worker gets its own session record, automation port, and
    /// environment. When checkpoints are enabled, the document is
    /// snapshotted first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an empty device list,
    /// `AppError::Capacity` if a device is busy or the session limit would
    /// be exceeded, `AppError::Spawn` if a process fails to start, or
    /// `AppError::Persistence` if a session record cannot be saved.
    pub async fn launch_session(
        &self,
        device_ids: &[String],
        config: TaskConfig,
    ) -> Result<Vec<WorkerSession>> {
        let span = info_span!("launch_session", devices = device_ids.len());
        async {
            let _launch = self.launch_lock.lock().await;

            let devices: Vec<String> = device_ids
                .iter()
                .map(|d| d.trim().to_owned())
                .filter(|d| !d.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if devices.is_empty() {
                return Err(AppError::Config("no device ids given".into()));
            }

            {
                let children = self.children.lock().await;
                if let Some(busy) = devices.iter().find(|d| children.contains_key(*d)) {
                    return Err(AppError::Capacity(format!("device {busy} is busy")));
                }
                let limit = usize::try_from(self.config.max_concurrent_sessions).unwrap_or(usize::MAX);
                if children.len() + devices.len() > limit {
                    return Err(AppError::Capacity(format!(
                        "concurrent session limit reached ({}/{limit})",
                        children.len()
                    )));
                }
            }

            if self.config.checkpoints.enabled {
                self.create_checkpoint(Some("pre-launch")).await?;
            }

            let mut used_ports: BTreeSet<u16> = self
                .store
                .read(|doc| doc.servers.live().map(|s| s.appium_port).collect())
                .await;

            let mut launched = Vec::with_capacity(devices.len());
            for device_id in devices {
                let port = (self.config.worker.appium_base_port..=u16::MAX)
                    .find(|p| !used_ports.contains(p))
                    .ok_or_else(|| AppError::Capacity("no free automation port".into()))?;
                used_ports.insert(port);

                let session = WorkerSession::new(device_id.clone(), port);
                session_manager::record_session(&self.store, session.clone()).await?;

                let child = match spawner::spawn_worker(
                    &self.config.worker,
                    &self.config.ipc_name,
                    &session,
                    &config,
                ) {
                    Ok(child) => child,
                    Err(err) => {
                        session_manager::transition_session(
                            &self.store,
                            &device_id,
                            &session.id,
                            SessionStatus::Exited,
                            None,
                            None,
                        )
                        .await?;
                        return Err(err);
                    }
                };

                let running = session_manager::transition_session(
                    &self.store,
                    &device_id,
                    &session.id,
                    SessionStatus::Running,
                    child.id(),
                    None,
                )
                .await?;
                self.children.lock().await.insert(
                    device_id,
                    TrackedChild {
                        session_id: session.id,
                        child,
                    },
                );
                launched.push(running);
            }

            info!(launched = launched.len(), "sessions launched");
            Ok(launched)
        }
        .instrument(span)
        .await
    }

    /// Append tasks to the queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if saving fails.
    pub async fn enqueue(
        &self,
        count: usize,
        task_type: TaskType,
        config: TaskConfig,
    ) -> Result<Vec<Task>> {
        self.queue.add_batch(count, task_type, config).await
    }

    /// Aggregate counts across devices, tasks, processes, and pools.
    pub async fn get_global_status(&self) -> GlobalStatus {
        let devices = self
            .store
            .read(|doc| {
                let mut devices: BTreeMap<String, DeviceStatus> = BTreeMap::new();
                for (device_id, session) in &doc.servers.sessions {
                    devices.insert(
                        device_id.clone(),
                        DeviceStatus {
                            device_id: device_id.clone(),
                            session_id: Some(session.id.clone()),
                            session_status: Some(session.status),
                            leased_tasks: Vec::new(),
                        },
                    );
                }
                for (device_id, tasks) in &doc.queue.device_assignments {
                    devices
                        .entry(device_id.clone())
                        .or_insert_with(|| DeviceStatus {
                            device_id: device_id.clone(),
                            session_id: None,
                            session_status: None,
                            leased_tasks: Vec::new(),
                        })
                        .leased_tasks
                        .clone_from(tasks);
                }
                devices.into_values().collect::<Vec<_>>()
            })
            .await;

        GlobalStatus {
            queue: self.queue.counts().await,
            devices,
            running_processes: self.children.lock().await.len(),
            locations: self.locations.stats().await,
            emails: self.emails.stats().await,
        }
    }

    /// Apply one lifecycle event.
    ///
    /// A worker exit with code 0 completes the tasks still leased to its
    /// device; any other exit fails them. Exits of a session that has
    /// already been replaced by a live one on the same device leave the
    /// device's leases alone.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if updated state cannot be saved.
    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::ProcessExited {
                device_id,
                session_id,
                exit_code,
            } => {
                match session_manager::transition_session(
                    &self.store,
                    &device_id,
                    &session_id,
                    SessionStatus::Exited,
                    None,
                    exit_code,
                )
                .await
                {
                    Ok(_) | Err(AppError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }

                let replaced = self
                    .store
                    .read(|doc| {
                        doc.servers
                            .sessions
                            .get(&device_id)
                            .is_some_and(|s| s.is_live() && s.id != session_id)
                    })
                    .await;
                if replaced {
                    info!(device_id, session_id, "exit of a replaced session, leases kept");
                    return Ok(());
                }

                for task in self.queue.tasks_for_device(&device_id).await {
                    if exit_code == Some(0) {
                        self.queue.mark_completed(&device_id, task.id, None).await?;
                    } else {
                        let reason = exit_code.map_or_else(
                            || "worker killed by signal".to_owned(),
                            |code| format!("worker exited with code {code}"),
                        );
                        self.queue.mark_failed(&device_id, task.id, &reason).await?;
                    }
                }
                Ok(())
            }
            LifecycleEvent::LeaseReclaimed { device_id, task_id } => {
                let worker_alive = self.children.lock().await.contains_key(&device_id);
                warn!(device_id, task_id, worker_alive, "lease expired and was reclaimed");
                Ok(())
            }
        }
    }

    /// Stop the worker on `device_id` and fail the tasks it still holds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no worker runs on the device, or a
    /// persistence error.
    pub async fn terminate_session(&self, device_id: &str) -> Result<WorkerSession> {
        let session = self.stop_worker(device_id).await?;
        for task in self.queue.tasks_for_device(device_id).await {
            self.queue
                .mark_failed(device_id, task.id, "worker terminated")
                .await?;
        }
        Ok(session)
    }

    async fn stop_worker(&self, device_id: &str) -> Result<WorkerSession> {
        let tracked = self
            .children
            .lock()
            .await
            .remove(device_id)
            .ok_or_else(|| AppError::NotFound(format!("no running worker on {device_id}")))?;
        let TrackedChild {
            session_id,
            mut child,
        } = tracked;

        let exit_code = session_manager::stop_process(
            &session_id,
            &mut child,
            self.config.worker.shutdown_grace(),
        )
        .await;
        let session = session_manager::transition_session(
            &self.store,
            device_id,
            &session_id,
            SessionStatus::Terminated,
            None,
            exit_code,
        )
        .await?;
        info!(device_id, session_id, "session terminated");
        Ok(session)
    }

    /// Snapshot the state document.
    ///
    /// # Errors
    ///
    /// Returns a serialization or persistence error.
    pub async fn create_checkpoint(&self, label: Option<&str>) -> Result<Checkpoint> {
        checkpoint_manager::create_checkpoint(
            &self.store,
            &self.config.checkpoint_dir(),
            label,
            self.config.checkpoints.max_retained,
        )
        .await
    }

    /// Reinstate a checkpoint, then return every restored lease to pending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown checkpoint, or a
    /// serialization or persistence error.
    pub async fn restore_checkpoint(&self, id: &str) -> Result<(Checkpoint, Vec<Namespace>)> {
        let restored =
            checkpoint_manager::restore_checkpoint(&self.store, &self.config.checkpoint_dir(), id)
                .await?;
        self.queue.initialize().await?;
        Ok(restored)
    }

    /// Stored checkpoints, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the checkpoint directory cannot be listed.
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>> {
        checkpoint_manager::list_checkpoints(&self.config.checkpoint_dir()).await
    }

    /// Stop every worker. Leases stay in place for startup reclamation.
    pub async fn shutdown(&self) {
        let devices: Vec<String> = self.children.lock().await.keys().cloned().collect();
        for device_id in devices {
            if let Err(err) = self.stop_worker(&device_id).await {
                warn!(device_id, %err, "failed to stop worker during shutdown");
            }
        }
        info!("orchestrator shut down");
    }
}
