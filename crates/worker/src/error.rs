//! Pool errors

use gearcheck_exec::ExecError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that end the worker pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A job hit a condition the process cannot recover from
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
