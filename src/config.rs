//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// State store persistence settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StoreConfig {
    /// File name of the consolidated state document inside `data_dir`.
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Number of numbered backup generations kept next to the state file.
    #[serde(default = "default_max_backups")]
    pub max_backups: u32,
    /// Interval of the auto-save timer.
    #[serde(default = "default_auto_save_seconds")]
    pub auto_save_seconds: u64,
    /// Debounce window used by `schedule_save` to coalesce bursts.
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
    /// Mirror each namespace back to its legacy single-purpose file.
    #[serde(default = "default_true")]
    pub enable_legacy_sync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            max_backups: default_max_backups(),
            auto_save_seconds: default_auto_save_seconds(),
            save_debounce_ms: default_save_debounce_ms(),
            enable_legacy_sync: true,
        }
    }
}

/// Task queue leasing settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Age after which an in-progress lease is considered abandoned.
    #[serde(default = "default_lease_timeout_seconds")]
    pub lease_timeout_seconds: u64,
    /// Period of the runtime reclamation timer.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Attempt budget for tasks created without an explicit one.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_seconds: default_lease_timeout_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            default_max_attempts: default_max_attempts(),
        }
    }
}

impl QueueConfig {
    /// Lease timeout as a [`Duration`].
    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_seconds)
    }

    /// Reclamation timer period as a [`Duration`].
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Resource pool settings shared by the location and email pools.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Failed releases after which an item is blacklisted.
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: u32,
    /// Recombine every set into `available` once when allocation finds it empty.
    #[serde(default = "default_true")]
    pub auto_reset_on_exhaustion: bool,
    /// CSV seed file for the location pool.
    #[serde(default)]
    pub locations_csv: Option<PathBuf>,
    /// Newline-delimited seed file for the email pool.
    #[serde(default)]
    pub emails_file: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            blacklist_threshold: default_blacklist_threshold(),
            auto_reset_on_exhaustion: true,
            locations_csv: None,
            emails_file: None,
        }
    }
}

/// Worker process launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Worker executable spawned once per device.
    pub program: String,
    /// Fixed arguments passed to every worker.
    #[serde(default)]
    pub args: Vec<String>,
    /// Host of the external automation endpoint.
    #[serde(default = "default_appium_host")]
    pub appium_host: String,
    /// First automation port; each concurrent session takes the next free one.
    #[serde(default = "default_appium_base_port")]
    pub appium_base_port: u16,
    /// Interval between child exit polls.
    #[serde(default = "default_exit_poll_seconds")]
    pub exit_poll_seconds: u64,
    /// Grace period before a terminating worker is force-killed.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl WorkerConfig {
    /// Child exit poll period as a [`Duration`].
    #[must_use]
    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_secs(self.exit_poll_seconds.max(1))
    }

    /// Termination grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Checkpoint settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Snapshot the state document before each session launch.
    #[serde(default)]
    pub enabled: bool,
    /// Newest checkpoints kept on disk.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retained: default_max_retained(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_state_file() -> String {
    "state.json".into()
}

fn default_max_backups() -> u32 {
    5
}

fn default_auto_save_seconds() -> u64 {
    30
}

fn default_save_debounce_ms() -> u64 {
    250
}

fn default_lease_timeout_seconds() -> u64 {
    30
}

fn default_cleanup_interval_seconds() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_blacklist_threshold() -> u32 {
    3
}

fn default_appium_host() -> String {
    "127.0.0.1".into()
}

fn default_appium_base_port() -> u16 {
    4723
}

fn default_exit_poll_seconds() -> u64 {
    5
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_max_retained() -> usize {
    20
}

fn default_max_concurrent_sessions() -> u32 {
    10
}

fn default_ipc_name() -> String {
    "fleet-coordinator".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the state document, backups, legacy files, and checkpoints.
    pub data_dir: PathBuf,
    /// Named pipe / Unix socket identifier for the worker protocol.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Maximum concurrently running worker sessions.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: u32,
    /// State store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Task queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Resource pool settings.
    #[serde(default)]
    pub pools: PoolConfig,
    /// Worker process settings.
    pub worker: WorkerConfig,
    /// Checkpoint settings.
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace `data_dir` and re-run validation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the new directory cannot be created.
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Result<Self> {
        self.data_dir = data_dir;
        self.validate()?;
        Ok(self)
    }

    /// Absolute path of the consolidated state document.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.store.state_file)
    }

    /// Directory holding checkpoint snapshots.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }

        if self.queue.default_max_attempts == 0 {
            return Err(AppError::Config(
                "queue.default_max_attempts must be greater than zero".into(),
            ));
        }

        if self.pools.blacklist_threshold == 0 {
            return Err(AppError::Config(
                "pools.blacklist_threshold must be greater than zero".into(),
            ));
        }

        if self.worker.program.trim().is_empty() {
            return Err(AppError::Config("worker.program must not be empty".into()));
        }

        fs::create_dir_all(&self.data_dir)
            .map_err(|err| AppError::Config(format!("cannot create data_dir: {err}")))?;
        self.data_dir = self
            .data_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("data_dir invalid: {err}")))?;

        Ok(())
    }
}
