// ABOUTME: Task pool data types
// ABOUTME: Tasks, results, worker snapshots, pool statistics, and progress updates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    /// Higher runs first
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Value, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one task. Exactly one of `result` and `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, value: Value, execution_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            result: Some(value),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            result: None,
            error: Some(error.into()),
            execution_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
    Terminated,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub task_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub(crate) fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: WorkerStatus::Idle,
            current_task: None,
            task_count: 0,
            error_count: 0,
            created_at: now,
            last_active_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub worker_count: usize,
    pub idle_count: usize,
    pub busy_count: usize,
    pub queue_length: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub avg_execution_time_ms: f64,
}

/// Progress reported by a running handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub worker_id: String,
    /// 0.0 to 1.0 when the handler knows how far along it is
    pub fraction: Option<f32>,
    pub message: Option<String>,
}
