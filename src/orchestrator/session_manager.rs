//! Worker session records and process termination.
//!
//! Session records live in the `servers` namespace, one per device. Each
//! helper here updates that namespace through the state store and saves
//! before returning.

use std::time::Duration;

use tokio::process::Child;
use tracing::{info, info_span, warn, Instrument};

use crate::models::session::{ServersState, SessionStatus, WorkerSession};
use crate::store::StateStore;
use crate::{AppError, Result};

/// Store `session` as the current session of its device.
///
/// # Errors
///
/// Returns `AppError::Persistence` if saving fails.
pub async fn record_session(store: &StateStore, session: WorkerSession) -> Result<()> {
    store
        .update::<ServersState, _>(|servers| {
            servers.sessions.insert(session.device_id.clone(), session);
        })
        .await;
    store.save().await
}

/// Move the session of `device_id` to `next`, recording `pid` or
/// `exit_code` when given.
///
/// The update only applies when the stored session still has `session_id`
/// and the transition is allowed.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the device has no such session, or
/// `AppError::Persistence` if saving fails.
pub async fn transition_session(
    store: &StateStore,
    device_id: &str,
    session_id: &str,
    next: SessionStatus,
    pid: Option<u32>,
    exit_code: Option<i32>,
) -> Result<WorkerSession> {
    let session = store
        .try_update::<ServersState, _>(|servers| {
            let session = servers
                .sessions
                .get_mut(device_id)
                .filter(|s| s.id == session_id)
                .ok_or_else(|| {
                    AppError::NotFound(format!("session {session_id} for {device_id}"))
                })?;
            if session.transition(next) {
                if pid.is_some() {
                    session.pid = pid;
                }
                if exit_code.is_some() {
                    session.exit_code = exit_code;
                }
            } else {
                warn!(
                    device_id,
                    session_id,
                    from = ?session.status,
                    to = ?next,
                    "session transition ignored"
                );
            }
            Ok(session.clone())
        })
        .await?;
    store.save().await?;
    Ok(session)
}

/// Mark every live session as interrupted. Used at startup, when no worker
/// from a previous run can still be attached.
///
/// # Errors
///
/// Returns `AppError::Persistence` if saving fails.
pub async fn interrupt_stale_sessions(store: &StateStore) -> Result<usize> {
    let interrupted = store
        .update::<ServersState, _>(|servers| {
            servers
                .sessions
                .values_mut()
                .filter(|s| s.is_live())
                .map(|s| s.transition(SessionStatus::Interrupted))
                .filter(|applied| *applied)
                .count()
        })
        .await;
    store.save().await?;
    if interrupted > 0 {
        warn!(interrupted, "sessions from previous run marked interrupted");
    }
    Ok(interrupted)
}

/// Stop a worker process: SIGTERM, wait up to `grace`, then kill.
///
/// Returns the exit code if the process reported one.
pub async fn stop_process(session_id: &str, child: &mut Child, grace: Duration) -> Option<i32> {
    let span = info_span!("stop_process", session_id);
    async {
        send_terminate(child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "worker exited gracefully");
                status.code()
            }
            Ok(Err(err)) => {
                warn!(%err, "error waiting for worker process");
                None
            }
            Err(_) => {
                warn!("worker did not exit within grace period, forcing kill");
                if let Err(err) = child.kill().await {
                    warn!(%err, "failed to force-kill worker");
                }
                None
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}
