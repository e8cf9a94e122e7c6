// ABOUTME: Sandboxed code execution engine for Runbox
// ABOUTME: In-process V8 and Docker container isolation tiers behind one orchestrator

pub mod backend;
pub mod container;
pub mod container_sandbox;
pub mod error;
pub mod execution;
pub mod inprocess;
pub mod profiles;
pub mod storage;
pub mod types;
pub mod validation;
pub mod workspace;

// Re-export commonly used types
pub use backend::{
    BackendOutcome, CancelSignal, EventSink, IsolationBackend, SandboxJob, StartSignal,
};
pub use container::{ContainerManager, ContainerRuntime, ContainerSpec};
pub use container_sandbox::ContainerSandbox;
pub use error::{Result, SandboxError};
pub use execution::ExecutionOrchestrator;
pub use inprocess::InProcessSandbox;
pub use profiles::{LanguageProfile, LanguageProfiles};
pub use storage::{ExecutionStore, InMemoryExecutionStore, SqliteExecutionStore};
pub use types::{
    Artifact, ExecutionEvent, ExecutionOutput, ExecutionRecord, ExecutionStatus, ExecutionTicket,
    IsolationTier, LogStream, ResourceLimits, ResourceUsage, Tool, ToolParameter, ToolType,
};
pub use validation::CodeSubmission;
