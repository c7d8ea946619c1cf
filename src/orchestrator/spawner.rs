//! Worker process spawner.
//!
//! Spawns one worker process per device. Each worker gets
//! `kill_on_drop(true)` and an environment that tells it which device it
//! drives, which lease it holds, where the coordinator's IPC socket is, and
//! which automation endpoint to use.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, info_span};

use crate::config::WorkerConfig;
use crate::models::session::WorkerSession;
use crate::models::task::TaskConfig;
use crate::{AppError, Result};

/// Environment variable carrying the device identifier.
pub const ENV_DEVICE_ID: &str = "FLEET_DEVICE_ID";
/// Environment variable carrying the session (lease) identifier.
pub const ENV_LEASE_ID: &str = "FLEET_LEASE_ID";
/// Environment variable carrying the coordinator's IPC socket name.
pub const ENV_IPC_NAME: &str = "FLEET_IPC_NAME";
/// Environment variable carrying the automation endpoint host.
pub const ENV_APPIUM_HOST: &str = "FLEET_APPIUM_HOST";
/// Environment variable carrying the automation endpoint port.
pub const ENV_APPIUM_PORT: &str = "FLEET_APPIUM_PORT";
/// Prefix for session configuration entries.
pub const ENV_CONFIG_PREFIX: &str = "FLEET_CFG_";

/// Build the environment handed to a worker.
///
/// Session config keys become `FLEET_CFG_<KEY>` with the key upper-cased
/// and every non-alphanumeric character replaced by `_`. String values are
/// passed verbatim, everything else as JSON text.
#[must_use]
pub fn worker_env(
    worker: &WorkerConfig,
    ipc_name: &str,
    session: &WorkerSession,
    config: &TaskConfig,
) -> Vec<(String, String)> {
    let mut env = vec![
        (ENV_DEVICE_ID.to_owned(), session.device_id.clone()),
        (ENV_LEASE_ID.to_owned(), session.id.clone()),
        (ENV_IPC_NAME.to_owned(), ipc_name.to_owned()),
        (ENV_APPIUM_HOST.to_owned(), worker.appium_host.clone()),
        (ENV_APPIUM_PORT.to_owned(), session.appium_port.to_string()),
    ];

    for (key, value) in config {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        env.push((format!("{ENV_CONFIG_PREFIX}{name}"), text));
    }
    env
}

/// Spawn the worker process for `session`.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the process fails to start.
pub fn spawn_worker(
    worker: &WorkerConfig,
    ipc_name: &str,
    session: &WorkerSession,
    config: &TaskConfig,
) -> Result<Child> {
    let span = info_span!(
        "spawn_worker",
        device_id = %session.device_id,
        session_id = %session.id
    );
    let _guard = span.enter();

    let mut cmd = Command::new(&worker.program);
    cmd.args(&worker.args)
        .envs(worker_env(worker, ipc_name, session, config))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn worker '{}' for {}: {err}",
            worker.program, session.device_id
        ))
    })?;

    info!(
        pid = child.id().unwrap_or(0),
        program = %worker.program,
        appium_port = session.appium_port,
        "worker process spawned"
    );
    Ok(child)
}
