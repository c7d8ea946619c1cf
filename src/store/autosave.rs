//! Periodic flush of the dirty state document.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::StateStore;

/// Spawn the auto-save background task.
///
/// On each tick the document is written if it is dirty. A failed save is
/// logged and retried on the next tick.
#[must_use]
pub fn spawn_auto_save_task(
    store: Arc<StateStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("auto-save task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if !store.is_dirty() {
                        continue;
                    }
                    if let Err(err) = store.save().await {
                        error!(%err, "auto-save failed");
                    }
                }
            }
        }
    })
}
