// ABOUTME: Error types for the task pool
// ABOUTME: Covers rejected submissions, failed tasks, and a closed pool

use runbox_config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("pool shutting down")]
    ShuttingDown,

    /// The task ran (or was dropped) and reported an error string
    #[error("{0}")]
    TaskFailed(String),

    #[error("Task pool is no longer running")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PoolError>;
