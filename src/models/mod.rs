//! Domain model module declarations.

pub mod checkpoint;
pub mod event;
pub mod resource;
pub mod session;
pub mod status;
pub mod task;
