// ABOUTME: Core type definitions for sandboxed execution
// ABOUTME: Tools, resource limits, execution records, results, and streamed events

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Category of a tool in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolType {
    Execution,
    Analysis,
    VersionControl,
    LanguageServer,
}

/// Isolation tier a tool runs under. Chosen statically per tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationTier {
    /// Embedded interpreter inside the host process
    #[default]
    InProcess,
    /// Fresh, auto-removed container per execution
    Container,
}

/// Declared type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

/// A single declared parameter of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Upper bound on a time limit (one day)
pub const MAX_EXECUTION_TIME_MS: u64 = 86_400_000;
/// Upper bound on a memory limit (1 TiB)
pub const MAX_MEMORY_MB: u64 = 1_048_576;

/// Resource envelope enforced by both isolation tiers.
///
/// Omitted time and memory limits are filled from the engine settings when
/// an execution is accepted, see [`ResourceLimits::with_defaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Wall-clock limit in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    /// Memory ceiling in megabytes (swap is capped to the same value)
    #[serde(rename = "maxMemoryMB", default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    /// CPU share in percent of one core (1-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<u8>,
    #[serde(default)]
    pub network_access: bool,
    /// Host path prefixes visible to the execution, read-only.
    /// Empty means nothing beyond the isolated workspace.
    #[serde(default)]
    pub file_system_access: Vec<String>,
}

impl ResourceLimits {
    /// Fill omitted time and memory limits
    pub fn with_defaults(mut self, execution_time_ms: u64, memory_mb: u64) -> Self {
        self.max_execution_time_ms.get_or_insert(execution_time_ms);
        self.max_memory_mb.get_or_insert(memory_mb);
        self
    }

    /// Check the descriptor invariants
    pub fn validate(&self) -> Result<(), SandboxError> {
        match self.max_execution_time_ms {
            Some(0) => {
                return Err(SandboxError::Validation(
                    "maxExecutionTimeMs must be greater than 0".to_string(),
                ))
            }
            Some(ms) if ms > MAX_EXECUTION_TIME_MS => {
                return Err(SandboxError::Validation(format!(
                    "maxExecutionTimeMs must be at most {}, got {}",
                    MAX_EXECUTION_TIME_MS, ms
                )))
            }
            _ => {}
        }

        match self.max_memory_mb {
            Some(0) => {
                return Err(SandboxError::Validation(
                    "maxMemoryMB must be greater than 0".to_string(),
                ))
            }
            Some(mb) if mb > MAX_MEMORY_MB => {
                return Err(SandboxError::Validation(format!(
                    "maxMemoryMB must be at most {}, got {}",
                    MAX_MEMORY_MB, mb
                )))
            }
            _ => {}
        }

        if let Some(cpu) = self.max_cpu_percent {
            if !(1..=100).contains(&cpu) {
                return Err(SandboxError::Validation(format!(
                    "maxCpuPercent must be between 1 and 100, got {}",
                    cpu
                )));
            }
        }

        for path in &self.file_system_access {
            if !path.starts_with('/') {
                return Err(SandboxError::Validation(format!(
                    "fileSystemAccess entries must be absolute paths, got {}",
                    path
                )));
            }
        }

        Ok(())
    }

    /// Time limit, or the built-in default when unset
    pub fn execution_time_ms(&self) -> u64 {
        self.max_execution_time_ms
            .unwrap_or(runbox_config::settings::DEFAULT_MAX_EXECUTION_MS)
    }

    /// Memory limit, or the built-in default when unset
    pub fn memory_mb(&self) -> u64 {
        self.max_memory_mb
            .unwrap_or(runbox_config::settings::DEFAULT_MAX_MEMORY_MB)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.execution_time_ms())
    }
}

/// Static tool descriptor owned by the tool catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    /// Default language for execution tools
    pub command: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub isolation: IsolationTier,
}

/// Overall execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Accepted, not yet dispatched
    Pending,
    /// Dispatched to an isolation backend
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error, a timeout, or a cancellation
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(SandboxError::Unknown(format!(
                "unknown execution status: {}",
                other
            ))),
        }
    }
}

/// Resource usage snapshot recorded on an execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub execution_time_ms: u64,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    pub cpu_percent: f64,
}

/// File produced by an execution beyond its known inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the workspace root
    pub name: String,
    pub size_bytes: u64,
    /// Base64 encoded content; absent when the file exceeded the size cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_base64: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

/// Result payload of a finished execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Final value: the snippet's last expression or the program's parsed output
    pub value: serde_json::Value,
    /// Captured output lines, in emission order
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// Set when the artifact count or size cap dropped files
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub artifacts_truncated: bool,
}

/// Tracked lifecycle state of one execution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub tool_id: String,
    pub user_id: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl ExecutionRecord {
    /// Create a record in `pending` state
    pub fn pending(
        tool_id: impl Into<String>,
        user_id: impl Into<String>,
        parameters: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_id: tool_id.into(),
            user_id: user_id.into(),
            parameters,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            resource_usage: None,
        }
    }
}

/// Terminal write applied to a record exactly once
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub result: Option<ExecutionOutput>,
    pub error: Option<String>,
    pub end_time: DateTime<Utc>,
    pub resource_usage: Option<ResourceUsage>,
}

impl Completion {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(error.into()),
            end_time: Utc::now(),
            resource_usage: None,
        }
    }
}

/// Response returned when an execution is accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTicket {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

/// Output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Side-channel events emitted while executions run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Status {
        execution_id: String,
        status: ExecutionStatus,
        error: Option<String>,
    },
    Log {
        execution_id: String,
        stream: LogStream,
        message: String,
    },
    Stats {
        execution_id: String,
        memory_usage_mb: u64,
        cpu_percent: f64,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Status { execution_id, .. }
            | ExecutionEvent::Log { execution_id, .. }
            | ExecutionEvent::Stats { execution_id, .. } => execution_id,
        }
    }
}
