//! Lifecycle event dispatcher.
//!
//! Reads events from the shared `mpsc::Receiver<LifecycleEvent>` channel
//! and applies them one at a time through [`Orchestrator::handle_event`],
//! so events from the child monitor and the lease reaper are handled in
//! arrival order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::Orchestrator;
use crate::models::event::LifecycleEvent;

/// Spawn the single consumer of lifecycle events.
///
/// The task runs until the `CancellationToken` fires or every sender is
/// dropped.
#[must_use]
pub fn spawn_lifecycle_dispatcher(
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::Receiver<LifecycleEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    info!("lifecycle dispatcher shutting down");
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(e) = maybe_event { e } else {
                        info!("lifecycle event channel closed");
                        break;
                    }
                }
            };

            if let Err(err) = orchestrator.handle_event(event.clone()).await {
                error!(%err, ?event, "failed to handle lifecycle event");
            }
        }
    })
}
