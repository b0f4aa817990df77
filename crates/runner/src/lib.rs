#![forbid(unsafe_code)]

pub mod admission;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod logging;
pub mod negotiator;
pub mod pool;
pub mod resource_guard;

pub use error::{OrchestratorError, Result};
