// ABOUTME: Execution record storage behind an injectable trait
// ABOUTME: In-memory map for tests and the CLI, SQLite via sqlx for production

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::types::{Completion, ExecutionRecord, ExecutionStatus};

/// Persistence for execution records.
///
/// State transitions are compare-and-set: `mark_running` only moves a
/// `pending` record, and `finish` only moves a non-terminal record, so the
/// terminal write happens at most once per record.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Prepare the backing store (migrations etc.)
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>>;

    /// `pending -> running`. Returns false if the record was not pending.
    async fn mark_running(&self, id: &str) -> Result<bool>;

    /// Apply a terminal transition. Returns the updated record, or `None`
    /// if the record was already terminal (or missing).
    async fn finish(&self, id: &str, completion: Completion) -> Result<Option<ExecutionRecord>>;

    /// Records owned by a user, newest first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExecutionRecord>>;
}

/// Process-local store backed by a mutex-guarded map
#[derive(Default)]
pub struct InMemoryExecutionStore {
    records: Mutex<HashMap<String, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ExecutionRecord>>> {
        self.records
            .lock()
            .map_err(|_| SandboxError::Unknown("execution store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<()> {
        let mut records = self.lock()?;
        if records.contains_key(&record.id) {
            return Err(SandboxError::InvalidState(format!(
                "execution {} already exists",
                record.id
            )));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        let mut records = self.lock()?;
        match records.get_mut(id) {
            Some(record) if record.status == ExecutionStatus::Pending => {
                record.status = ExecutionStatus::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: &str, completion: Completion) -> Result<Option<ExecutionRecord>> {
        let mut records = self.lock()?;
        match records.get_mut(id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = completion.status;
                record.result = completion.result;
                record.error = completion.error;
                record.end_time = Some(completion.end_time);
                record.resource_usage = completion.resource_usage;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<_> = self
            .lock()?
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(records)
    }
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL, creating the file if needed
    pub async fn connect(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self::new(pool))
    }

    fn row_to_record(row: &SqliteRow) -> Result<ExecutionRecord> {
        let parameters: String = row.try_get("parameters")?;
        let status: String = row.try_get("status")?;
        let result: Option<String> = row.try_get("result")?;
        let start_time: String = row.try_get("start_time")?;
        let end_time: Option<String> = row.try_get("end_time")?;
        let resource_usage: Option<String> = row.try_get("resource_usage")?;

        Ok(ExecutionRecord {
            id: row.try_get("id")?,
            tool_id: row.try_get("tool_id")?,
            user_id: row.try_get("user_id")?,
            parameters: serde_json::from_str(&parameters)?,
            status: status.parse()?,
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            error: row.try_get("error")?,
            start_time: parse_timestamp(&start_time)?,
            end_time: end_time.as_deref().map(parse_timestamp).transpose()?,
            resource_usage: resource_usage
                .map(|u| serde_json::from_str(&u))
                .transpose()?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SandboxError::Unknown(format!("invalid timestamp '{}': {}", value, e)))
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn initialize(&self) -> Result<()> {
        info!("Initializing execution store with migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, record: &ExecutionRecord) -> Result<()> {
        let parameters = serde_json::to_string(&record.parameters)?;
        let result = record.result.as_ref().map(serde_json::to_string).transpose()?;
        let resource_usage = record
            .resource_usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO executions (
                id, tool_id, user_id, parameters, status,
                result, error, start_time, end_time, resource_usage
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.tool_id)
        .bind(&record.user_id)
        .bind(parameters)
        .bind(record.status.as_str())
        .bind(result)
        .bind(&record.error)
        .bind(record.start_time.to_rfc3339())
        .bind(record.end_time.map(|t| t.to_rfc3339()))
        .bind(resource_usage)
        .execute(&self.pool)
        .await?;

        debug!("Inserted execution record {}", record.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn mark_running(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'running' WHERE id = ? AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish(&self, id: &str, completion: Completion) -> Result<Option<ExecutionRecord>> {
        let result = completion
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let resource_usage = completion
            .resource_usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, result = ?, error = ?, end_time = ?, resource_usage = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(completion.status.as_str())
        .bind(result)
        .bind(&completion.error)
        .bind(completion.end_time.to_rfc3339())
        .bind(resource_usage)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(id).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExecutionRecord>> {
        let rows =
            sqlx::query("SELECT * FROM executions WHERE user_id = ? ORDER BY start_time DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
