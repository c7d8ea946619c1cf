//! Local IPC server for device workers and `fleet-ctl`.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands and
//! routes them to the queue, the pools, or the orchestrator.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "next_task", "device_id": "dev-A"}
//! {"command": "complete", "device_id": "dev-A", "task_id": 1, "result": {"account": "x"}}
//! {"command": "fail", "device_id": "dev-A", "task_id": 1, "error": "timeout"}
//! {"command": "allocate", "pool": "emails", "requester_id": "dev-A"}
//! {"command": "release", "pool": "emails", "requester_id": "dev-A", "key": "a@x.io"}
//! {"command": "status"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": true, "data": null}
//! {"ok": false, "error": "not assigned: task 1 is not assigned to dev-B"}
//! ```
//!
//! Exhaustion (no task, empty pool) answers `ok: true` with `data: null`.

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::task::{TaskConfig, TaskType};
use crate::orchestrator::checkpoint_manager::CheckpointSummary;
use crate::orchestrator::Orchestrator;
use crate::{AppError, Result};

/// Which resource pool a request targets.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Location pool.
    Locations,
    /// Email pool.
    Emails,
}

/// Inbound IPC request.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Lease the next task to a device.
    NextTask {
        /// Requesting device.
        device_id: String,
    },
    /// Report task success.
    Complete {
        /// Lease holder.
        device_id: String,
        /// Task id.
        task_id: u64,
        /// Optional worker result.
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    /// Report task failure.
    Fail {
        /// Lease holder.
        device_id: String,
        /// Task id.
        task_id: u64,
        /// Error text.
        error: String,
    },
    /// Allocate a pool item.
    Allocate {
        /// Target pool.
        pool: PoolKind,
        /// Requesting worker.
        requester_id: String,
    },
    /// Return a pool item after a failed run.
    Release {
        /// Target pool.
        pool: PoolKind,
        /// Holder.
        requester_id: String,
        /// Item key.
        key: String,
    },
    /// Consume a pool item after a successful run.
    MarkUsed {
        /// Target pool.
        pool: PoolKind,
        /// Holder.
        requester_id: String,
        /// Item key.
        key: String,
    },
    /// Append tasks.
    Enqueue {
        /// Number of tasks.
        count: usize,
        /// Task kind, `create_account` when omitted.
        #[serde(default)]
        task_type: Option<TaskType>,
        /// Worker configuration shared by the batch.
        #[serde(default)]
        config: Option<TaskConfig>,
    },
    /// Global status snapshot.
    Status,
    /// Start workers.
    Launch {
        /// Devices to start workers on.
        device_ids: Vec<String>,
        /// Session configuration passed to workers.
        #[serde(default)]
        config: Option<TaskConfig>,
    },
    /// Snapshot the state document.
    Checkpoint {
        /// Optional label.
        #[serde(default)]
        label: Option<String>,
    },
}

impl IpcRequest {
    fn name(&self) -> &'static str {
        match self {
            Self::NextTask { .. } => "next_task",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::Allocate { .. } => "allocate",
            Self::Release { .. } => "release",
            Self::MarkUsed { .. } => "mark_used",
            Self::Enqueue { .. } => "enqueue",
            Self::Status => "status",
            Self::Launch { .. } => "launch",
            Self::Checkpoint { .. } => "checkpoint",
        }
    }
}

/// Outbound IPC response.
#[derive(Debug, Serialize)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success; `null` signals exhaustion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(AppError::from)) {
            Ok(value) => Self::success(value),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    orchestrator: Arc<Orchestrator>,
    name: String,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let orchestrator = Arc::clone(&orchestrator);
                                tokio::spawn(handle_connection(stream, orchestrator));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    orchestrator: Arc<Orchestrator>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = handle_line(trimmed, &orchestrator).await;
                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Decode and execute one request line.
pub async fn handle_line(line: &str, orchestrator: &Orchestrator) -> IpcResponse {
    match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => dispatch_command(request, orchestrator).await,
        Err(err) => IpcResponse::error(format!("invalid request: {err}")),
    }
}

/// Route an IPC command to the appropriate component.
pub async fn dispatch_command(request: IpcRequest, orchestrator: &Orchestrator) -> IpcResponse {
    let span = info_span!("ipc_command", command = request.name());
    async move {
        let response = match request {
            IpcRequest::NextTask { device_id } => {
                IpcResponse::from_result(orchestrator.queue().get_next_task(&device_id).await)
            }
            IpcRequest::Complete {
                device_id,
                task_id,
                result,
            } => IpcResponse::from_result(
                orchestrator
                    .queue()
                    .mark_completed(&device_id, task_id, result)
                    .await,
            ),
            IpcRequest::Fail {
                device_id,
                task_id,
                error,
            } => IpcResponse::from_result(
                orchestrator
                    .queue()
                    .mark_failed(&device_id, task_id, &error)
                    .await,
            ),
            IpcRequest::Allocate { pool, requester_id } => match pool {
                PoolKind::Locations => IpcResponse::from_result(
                    orchestrator.locations().allocate(&requester_id).await,
                ),
                PoolKind::Emails => {
                    IpcResponse::from_result(orchestrator.emails().allocate(&requester_id).await)
                }
            },
            IpcRequest::Release {
                pool,
                requester_id,
                key,
            } => IpcResponse::from_result(match pool {
                PoolKind::Locations => orchestrator.locations().release(&requester_id, &key).await,
                PoolKind::Emails => orchestrator.emails().release(&requester_id, &key).await,
            }),
            IpcRequest::MarkUsed {
                pool,
                requester_id,
                key,
            } => IpcResponse::from_result(match pool {
                PoolKind::Locations => {
                    orchestrator.locations().mark_used(&requester_id, &key).await
                }
                PoolKind::Emails => orchestrator.emails().mark_used(&requester_id, &key).await,
            }),
            IpcRequest::Enqueue {
                count,
                task_type,
                config,
            } => IpcResponse::from_result(
                orchestrator
                    .enqueue(count, task_type.unwrap_or_default(), config.unwrap_or_default())
                    .await,
            ),
            IpcRequest::Status => {
                IpcResponse::from_result(Ok(orchestrator.get_global_status().await))
            }
            IpcRequest::Launch { device_ids, config } => IpcResponse::from_result(
                orchestrator
                    .launch_session(&device_ids, config.unwrap_or_default())
                    .await,
            ),
            IpcRequest::Checkpoint { label } => IpcResponse::from_result(
                orchestrator
                    .create_checkpoint(label.as_deref())
                    .await
                    .map(|cp| CheckpointSummary {
                        id: cp.id,
                        label: cp.label,
                        created_at: cp.created_at,
                    }),
            ),
        };

        if let Some(error) = &response.error {
            warn!(%error, "ipc command failed");
        }
        response
    }
    .instrument(span)
    .await
}
