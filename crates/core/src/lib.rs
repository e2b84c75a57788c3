//! Shared foundation for the task system: configuration, error types and
//! logging setup.

pub mod config;
pub mod errors;
pub mod logging;

pub use config::AppConfig;
pub use errors::{OmniqError, OmniqResult};
