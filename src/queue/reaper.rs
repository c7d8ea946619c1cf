//! Background reclamation of expired leases.
//!
//! Runs on a fixed interval and returns every task whose lease is older
//! than the lease timeout to pending. This is the only component that
//! revokes a lease without the holder's cooperation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ReclaimMode, TaskQueue};
use crate::models::event::LifecycleEvent;

/// Spawn the lease reaper background task.
///
/// Each revoked lease is forwarded to `events` as
/// [`LifecycleEvent::LeaseReclaimed`] when a sender is supplied.
#[must_use]
pub fn spawn_lease_reaper(
    queue: Arc<TaskQueue>,
    interval: Duration,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<LifecycleEvent>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("lease reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let reclaimed = match queue.reclaim_abandoned(ReclaimMode::Runtime).await {
                        Ok(reclaimed) => reclaimed,
                        Err(err) => {
                            error!(%err, "lease reclamation failed");
                            continue;
                        }
                    };
                    let Some(tx) = &events else { continue };
                    for lease in reclaimed {
                        let event = LifecycleEvent::LeaseReclaimed {
                            device_id: lease.device_id,
                            task_id: lease.task_id,
                        };
                        if tx.send(event).await.is_err() {
                            warn!("lifecycle dispatcher gone, dropping reclaim events");
                            break;
                        }
                    }
                }
            }
        }
    })
}
