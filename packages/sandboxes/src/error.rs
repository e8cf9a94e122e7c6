// ABOUTME: Error types for sandboxed execution
// ABOUTME: Validation, lookup, container, storage, and in-isolate failures

use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Parameters or limits failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Execution record not found
    #[error("Execution not found: {0}")]
    NotFound(String),

    /// Execution belongs to another user
    #[error("Access to execution {0} is forbidden")]
    Forbidden(String),

    /// Operation not legal in the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No language profile or interpreter for the requested language
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Container tier requested while the feature flag is off
    #[error("Container sandbox is disabled")]
    SandboxDisabled,

    /// Wall-clock limit exceeded
    #[error("Execution timed out after {millis} ms")]
    Timeout { millis: u64 },

    /// Container could not be created
    #[error("Container creation failed: {0}")]
    ContainerCreateFailed(String),

    /// Container failed to start
    #[error("Container failed to start: {0}")]
    ContainerStartFailed(String),

    /// Program output could not be interpreted as a structured result
    #[error("Result could not be parsed: {0}")]
    ResultUnparsable(String),

    /// Error thrown by the snippet inside the in-process sandbox
    #[error("{0}")]
    Script(String),

    /// Isolated unit died unexpectedly
    #[error("Execution crashed: {0}")]
    Crash(String),

    /// Docker/container-related errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown or unhandled error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SandboxError {
    /// Errors caused by the caller rather than the engine
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SandboxError::Validation(_)
                | SandboxError::NotFound(_)
                | SandboxError::Forbidden(_)
                | SandboxError::InvalidState(_)
                | SandboxError::UnsupportedLanguage(_)
                | SandboxError::SandboxDisabled
        )
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
