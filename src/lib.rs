#![forbid(unsafe_code)]

//! Task leasing, resource pools, and crash-tolerant state for fleets of
//! device-bound automation workers.

pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod store;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
