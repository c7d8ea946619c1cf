//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Exhaustion (no pending task, empty pool) is not an error; those
/// operations return `None`.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Durable write, rename, or backup rotation failed.
    Persistence(String),
    /// JSON encoding, decoding, or shape mismatch.
    Serialization(String),
    /// Caller does not hold the task or resource it is operating on.
    NotAssigned(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Concurrent worker session limit reached, or device already busy.
    Capacity(String),
    /// Worker process could not be spawned or signalled.
    Spawn(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Persistence(msg) => write!(f, "persistence: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::NotAssigned(msg) => write!(f, "not assigned: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Capacity(msg) => write!(f, "capacity: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
