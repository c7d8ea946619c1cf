//! Child process monitor, detects worker process exits.
//!
//! Periodically polls all live workers in the [`ActiveChildren`] registry.
//! When a process has exited it is removed from the registry and a
//! [`LifecycleEvent::ProcessExited`] is sent to the dispatcher.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ActiveChildren;
use crate::models::event::LifecycleEvent;

/// Spawn a background task that watches worker processes for exits.
///
/// The task polls every `interval` until the `CancellationToken` fires.
#[must_use]
pub fn spawn_child_monitor(
    children: ActiveChildren,
    events: mpsc::Sender<LifecycleEvent>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("child process monitor shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            for event in poll_children(&children).await {
                if events.send(event).await.is_err() {
                    warn!("lifecycle dispatcher gone, stopping child monitor");
                    return;
                }
            }
        }
    })
}

/// Check every tracked worker once. Exited workers are removed from the
/// registry and reported.
pub async fn poll_children(children: &ActiveChildren) -> Vec<LifecycleEvent> {
    let mut guard = children.lock().await;
    let mut exited = Vec::new();

    for (device_id, worker) in guard.iter_mut() {
        match worker.child.try_wait() {
            Ok(Some(status)) => exited.push((device_id.clone(), status.code())),
            Ok(None) => {}
            Err(err) => {
                warn!(device_id, %err, "failed to poll worker process status");
                exited.push((device_id.clone(), None));
            }
        }
    }

    let mut events = Vec::with_capacity(exited.len());
    for (device_id, exit_code) in exited {
        if let Some(worker) = guard.remove(&device_id) {
            info!(device_id, session_id = %worker.session_id, ?exit_code, "worker process exited");
            events.push(LifecycleEvent::ProcessExited {
                device_id,
                session_id: worker.session_id,
                exit_code,
            });
        }
    }
    events
}
