// ABOUTME: Typed task handlers and the registry that dispatches tasks to them
// ABOUTME: Payloads are checked against the handler's Payload type before a task is queued

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{PoolError, Result};
use crate::message::{PoolEvent, WorkerToPool};
use crate::types::{Task, TaskProgress};

/// Background work for one task type.
///
/// Each worker runs on its own thread with a single-threaded runtime, so a
/// handler that blocks only stalls its own worker. A handler that panics takes
/// its worker down with it; the pool fails the task with the panic message and
/// replaces the worker.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// Name tasks are submitted under
    fn task_type(&self) -> &str;

    async fn handle(
        &self,
        payload: Self::Payload,
        progress: ProgressReporter,
    ) -> anyhow::Result<Self::Output>;
}

/// Lets a running handler publish progress for its task
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    worker_id: String,
    task_id: String,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
}

impl ProgressReporter {
    pub(crate) fn new(
        worker_id: String,
        task_id: String,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        Self {
            worker_id,
            task_id,
            events: Some(events),
        }
    }

    /// A reporter that drops everything, for invoking handlers outside a pool
    pub fn detached(task_id: impl Into<String>) -> Self {
        Self {
            worker_id: String::new(),
            task_id: task_id.into(),
            events: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Report completion as a fraction in 0.0..=1.0
    pub fn fraction(&self, fraction: f32, message: impl Into<String>) {
        self.send(Some(fraction.clamp(0.0, 1.0)), Some(message.into()));
    }

    pub fn message(&self, message: impl Into<String>) {
        self.send(None, Some(message.into()));
    }

    fn send(&self, fraction: Option<f32>, message: Option<String>) {
        let Some(events) = &self.events else {
            return;
        };
        let progress = TaskProgress {
            task_id: self.task_id.clone(),
            worker_id: self.worker_id.clone(),
            fraction,
            message,
        };
        if events.send(WorkerToPool::Progress(progress).into()).is_err() {
            trace!("Pool gone, dropping progress for task {}", self.task_id);
        }
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    fn check(&self, payload: &Value) -> std::result::Result<(), String>;

    async fn call(
        &self,
        payload: Value,
        progress: ProgressReporter,
    ) -> std::result::Result<Value, String>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: TaskHandler> ErasedHandler for Typed<H> {
    fn check(&self, payload: &Value) -> std::result::Result<(), String> {
        <H::Payload as Deserialize>::deserialize(payload)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn call(
        &self,
        payload: Value,
        progress: ProgressReporter,
    ) -> std::result::Result<Value, String> {
        let payload: H::Payload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        let output = self
            .0
            .handle(payload, progress)
            .await
            .map_err(|e| format!("{:#}", e))?;
        serde_json::to_value(output).map_err(|e| format!("Failed to serialize task output: {}", e))
    }
}

/// Task type name to handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register<H: TaskHandler>(&mut self, handler: H) -> &mut Self {
        let task_type = handler.task_type().to_string();
        if self
            .handlers
            .insert(task_type.clone(), Arc::new(Typed(handler)))
            .is_some()
        {
            warn!("Replacing handler for task type '{}'", task_type);
        }
        self
    }

    pub fn with<H: TaskHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Reject unknown task types and payloads the handler cannot decode
    pub fn validate(&self, task_type: &str, payload: &Value) -> Result<()> {
        let handler = self
            .handlers
            .get(task_type)
            .ok_or_else(|| PoolError::Validation(format!("unknown task type '{}'", task_type)))?;

        handler.check(payload).map_err(|e| {
            PoolError::Validation(format!("invalid payload for '{}': {}", task_type, e))
        })
    }

    pub(crate) async fn run(
        &self,
        task: Task,
        progress: ProgressReporter,
    ) -> std::result::Result<Value, String> {
        match self.handlers.get(&task.task_type) {
            Some(handler) => handler.call(task.payload, progress).await,
            None => Err(format!("unknown task type '{}'", task.task_type)),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddPayload {
        a: i64,
        b: i64,
    }

    struct Add;

    #[async_trait]
    impl TaskHandler for Add {
        type Payload = AddPayload;
        type Output = i64;

        fn task_type(&self) -> &str {
            "add"
        }

        async fn handle(&self, payload: AddPayload, _progress: ProgressReporter) -> anyhow::Result<i64> {
            if payload.b == 0 && payload.a == 0 {
                anyhow::bail!("nothing to add");
            }
            Ok(payload.a + payload.b)
        }
    }

    #[test]
    fn test_validate_unknown_type() {
        let registry = HandlerRegistry::new().with(Add);
        let err = registry.validate("multiply", &json!({})).unwrap_err();
        assert_eq!(err, PoolError::Validation("unknown task type 'multiply'".to_string()));
    }

    #[test]
    fn test_validate_bad_payload() {
        let registry = HandlerRegistry::new().with(Add);
        let err = registry.validate("add", &json!({"a": "one"})).unwrap_err();
        match err {
            PoolError::Validation(msg) => assert!(msg.starts_with("invalid payload for 'add'")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.validate("add", &json!({"a": 1, "b": 2})).is_ok());
    }

    #[tokio::test]
    async fn test_run_serializes_output_and_errors() {
        let registry = HandlerRegistry::new().with(Add);

        let task = Task::new("add", json!({"a": 2, "b": 40}), 0);
        let value = registry.run(task, ProgressReporter::detached("t")).await.unwrap();
        assert_eq!(value, json!(42));

        let task = Task::new("add", json!({"a": 0, "b": 0}), 0);
        let err = registry.run(task, ProgressReporter::detached("t")).await.unwrap_err();
        assert_eq!(err, "nothing to add");
    }

    #[test]
    fn test_task_types_sorted() {
        struct Named(&'static str);

        #[async_trait]
        impl TaskHandler for Named {
            type Payload = Value;
            type Output = Value;

            fn task_type(&self) -> &str {
                self.0
            }

            async fn handle(&self, payload: Value, _progress: ProgressReporter) -> anyhow::Result<Value> {
                Ok(payload)
            }
        }

        let registry = HandlerRegistry::new().with(Named("zeta")).with(Named("alpha"));
        assert_eq!(registry.task_types(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_progress_reaches_pool_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new("w1".into(), "t1".into(), tx);
        reporter.fraction(1.5, "done");

        match rx.recv().await.unwrap() {
            PoolEvent::Worker(WorkerToPool::Progress(progress)) => {
                assert_eq!(progress.fraction, Some(1.0));
                assert_eq!(progress.worker_id, "w1");
                assert_eq!(progress.message.as_deref(), Some("done"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
