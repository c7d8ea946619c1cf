//! Local IPC layer for device workers and `fleet-ctl`.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands.

pub mod server;
