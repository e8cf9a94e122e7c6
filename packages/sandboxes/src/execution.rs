// ABOUTME: Execution orchestration across isolation tiers
// ABOUTME: Validates requests, tracks the record lifecycle, dispatches to a backend, handles cancellation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use runbox_config::EngineSettings;

use crate::backend::{
    BackendOutcome, CancelSignal, EventSink, IsolationBackend, SandboxJob, StartSignal,
};
use crate::container::ContainerRuntime;
use crate::container_sandbox::ContainerSandbox;
use crate::error::{Result, SandboxError};
use crate::inprocess::{InProcessSandbox, TIMED_OUT};
use crate::profiles::LanguageProfiles;
use crate::storage::ExecutionStore;
use crate::types::{
    Completion, ExecutionEvent, ExecutionRecord, ExecutionStatus, ExecutionTicket,
    IsolationTier, ResourceUsage, Tool,
};
use crate::validation::{validate_parameters, CodeSubmission};

/// Error recorded when a user cancels an execution
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Orchestrates the execution lifecycle from validation to terminal state
#[derive(Clone)]
pub struct ExecutionOrchestrator {
    store: Arc<dyn ExecutionStore>,
    in_process: Arc<dyn IsolationBackend>,
    container: Option<Arc<dyn IsolationBackend>>,
    settings: Arc<EngineSettings>,
    /// Broadcast channel for real-time events
    event_tx: broadcast::Sender<ExecutionEvent>,
    cancellations: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl ExecutionOrchestrator {
    /// Create an orchestrator with the in-process tier only
    pub fn new(store: Arc<dyn ExecutionStore>, settings: EngineSettings) -> Self {
        let (event_tx, _) = broadcast::channel(settings.event_channel_size);

        Self {
            store,
            in_process: Arc::new(InProcessSandbox::new()),
            container: None,
            settings: Arc::new(settings),
            event_tx,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enable the container tier over the given runtime
    pub fn with_container_runtime(
        self,
        runtime: Arc<dyn ContainerRuntime>,
        profiles: Arc<LanguageProfiles>,
    ) -> Self {
        let interval = self.settings.stats_interval;
        self.with_container_backend(Arc::new(ContainerSandbox::new(runtime, profiles, interval)))
    }

    pub fn with_container_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.container = Some(backend);
        self
    }

    pub fn with_in_process_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.in_process = backend;
        self
    }

    /// Subscribe to execution events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    /// Accept an execution request.
    ///
    /// Validation and setup errors are returned before any record exists.
    /// Otherwise the record is created `pending` and the run continues in the
    /// background.
    pub async fn execute(
        &self,
        tool: &Tool,
        parameters: HashMap<String, Value>,
        user_id: &str,
    ) -> Result<ExecutionTicket> {
        let limits = tool.resource_limits.clone().with_defaults(
            self.settings.default_max_execution_ms,
            self.settings.default_max_memory_mb,
        );
        limits.validate()?;
        let parameters = validate_parameters(tool, parameters)?;
        let submission = CodeSubmission::from_parameters(tool, &parameters)?;
        let backend = self.select_backend(tool, &submission.language)?;

        let record = ExecutionRecord::pending(&tool.id, user_id, parameters);
        self.store.insert(&record).await?;

        let (cancel_tx, cancel) = CancelSignal::new();
        self.lock_cancellations()?
            .insert(record.id.clone(), cancel_tx);

        info!(
            "Accepted execution {} of tool {} on the {} tier",
            record.id,
            tool.id,
            backend.name()
        );
        self.emit_status(&record.id, ExecutionStatus::Pending, None);

        let job = SandboxJob {
            execution_id: record.id.clone(),
            submission,
            limits,
            events: EventSink::new(self.event_tx.clone()),
            started: StartSignal::new(),
        };

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let id = job.execution_id.clone();
            let runner = orchestrator.clone();
            let run = tokio::spawn(async move { runner.run_execution(backend, job, cancel).await });

            let failure = match run.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    error!("Execution {} failed to record its outcome: {}", id, e);
                    Some(failure_message(&e))
                }
                Err(e) => {
                    error!("Execution {} crashed: {}", id, e);
                    Some(format!("execution crashed: {}", panic_message(e)))
                }
            };
            if let Some(message) = failure {
                orchestrator.fail_abandoned(&id, message).await;
            }
            orchestrator.forget_cancellation(&id);
        });

        Ok(ExecutionTicket {
            execution_id: record.id,
            status: ExecutionStatus::Pending,
        })
    }

    /// Fetch a record owned by `user_id`
    pub async fn get_status(&self, execution_id: &str, user_id: &str) -> Result<ExecutionRecord> {
        let record = self
            .store
            .get(execution_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound(execution_id.to_string()))?;

        if record.user_id != user_id {
            return Err(SandboxError::Forbidden(execution_id.to_string()));
        }

        Ok(record)
    }

    /// Cancel a pending or running execution
    pub async fn cancel(&self, execution_id: &str, user_id: &str) -> Result<ExecutionRecord> {
        let record = self.get_status(execution_id, user_id).await?;

        if record.status.is_terminal() {
            return Err(SandboxError::InvalidState(format!(
                "execution {} is already {}",
                execution_id, record.status
            )));
        }

        let Some(cancelled) = self
            .store
            .finish(execution_id, Completion::failed(CANCELLED_BY_USER))
            .await?
        else {
            return Err(SandboxError::InvalidState(format!(
                "execution {} finished before it could be cancelled",
                execution_id
            )));
        };

        self.signal_cancel(execution_id);

        info!("Cancelled execution {}", execution_id);
        self.emit_status(execution_id, cancelled.status, cancelled.error.clone());
        Ok(cancelled)
    }

    /// All executions owned by a user, newest first
    pub async fn list_executions(&self, user_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.store.list_for_user(user_id).await
    }

    fn select_backend(&self, tool: &Tool, language: &str) -> Result<Arc<dyn IsolationBackend>> {
        let backend = match tool.isolation {
            IsolationTier::InProcess => self.in_process.clone(),
            IsolationTier::Container => {
                if !self.settings.container_sandbox_enabled {
                    return Err(SandboxError::SandboxDisabled);
                }
                self.container.clone().ok_or(SandboxError::SandboxDisabled)?
            }
        };

        if !backend.supports(language) {
            return Err(SandboxError::UnsupportedLanguage(language.to_string()));
        }

        Ok(backend)
    }

    async fn run_execution(
        &self,
        backend: Arc<dyn IsolationBackend>,
        job: SandboxJob,
        cancel: CancelSignal,
    ) -> Result<()> {
        let id = job.execution_id.clone();

        if cancel.is_cancelled() || !self.store.mark_running(&id).await? {
            debug!("Execution {} left pending before dispatch; skipping", id);
            return Ok(());
        }
        self.emit_status(&id, ExecutionStatus::Running, None);

        let limit_ms = job.limits.execution_time_ms();
        let backstop = job.limits.timeout() + self.settings.backstop_grace;
        let started_signal = job.started.clone();
        let started = Instant::now();

        // The deadline starts once the backend is past preparation
        let deadline = async {
            let prepare = self.settings.prepare_timeout;
            if tokio::time::timeout(prepare, started_signal.started()).await.is_err() {
                warn!("Execution {} still preparing after {:?}", id, prepare);
            }
            tokio::time::sleep(backstop).await;
        };

        let run = backend.run(job, cancel);
        tokio::pin!(run);

        let finished = tokio::select! {
            result = &mut run => Some(result),
            _ = deadline => None,
        };

        let result = match finished {
            Some(result) => result,
            None => {
                warn!("Execution {} hit the orchestrator backstop, cancelling it", id);
                self.signal_cancel(&id);
                if tokio::time::timeout(self.settings.backstop_grace, &mut run)
                    .await
                    .is_err()
                {
                    warn!("Execution {} ignored cancellation, abandoning it", id);
                }
                Err(SandboxError::Timeout { millis: limit_ms })
            }
        };

        let completion = match result {
            Ok(outcome) => completion_from(outcome),
            Err(e) => {
                debug!("Execution {} failed: {}", id, e);
                Completion {
                    resource_usage: Some(ResourceUsage {
                        execution_time_ms: started.elapsed().as_millis() as u64,
                        ..Default::default()
                    }),
                    ..Completion::failed(failure_message(&e))
                }
            }
        };

        match self.store.finish(&id, completion).await? {
            Some(record) => {
                info!("Execution {} finished as {}", id, record.status);
                self.emit_status(&id, record.status, record.error);
            }
            None => debug!("Execution {} was already terminal", id),
        }

        Ok(())
    }

    /// Last-resort terminal write for a run that never recorded one
    async fn fail_abandoned(&self, execution_id: &str, message: String) {
        match self
            .store
            .finish(execution_id, Completion::failed(message))
            .await
        {
            Ok(Some(record)) => {
                warn!("Execution {} marked failed after an internal error", execution_id);
                self.emit_status(execution_id, record.status, record.error);
            }
            Ok(None) => debug!("Execution {} was already terminal", execution_id),
            Err(e) => error!(
                "Execution {} could not be marked failed: {}",
                execution_id, e
            ),
        }
    }

    fn signal_cancel(&self, execution_id: &str) {
        match self.lock_cancellations() {
            Ok(map) => {
                if let Some(tx) = map.get(execution_id) {
                    let _ = tx.send(true);
                }
            }
            Err(e) => warn!("Could not signal cancellation of {}: {}", execution_id, e),
        }
    }

    fn emit_status(&self, execution_id: &str, status: ExecutionStatus, error: Option<String>) {
        EventSink::new(self.event_tx.clone()).emit(ExecutionEvent::Status {
            execution_id: execution_id.to_string(),
            status,
            error,
        });
    }

    fn lock_cancellations(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, watch::Sender<bool>>>> {
        self.cancellations
            .lock()
            .map_err(|_| SandboxError::Unknown("cancellation map lock poisoned".to_string()))
    }

    fn forget_cancellation(&self, execution_id: &str) {
        if let Ok(mut map) = self.cancellations.lock() {
            map.remove(execution_id);
        }
    }
}

fn completion_from(outcome: BackendOutcome) -> Completion {
    let status = if outcome.success {
        ExecutionStatus::Completed
    } else {
        ExecutionStatus::Failed
    };
    let error = if outcome.success {
        None
    } else {
        Some(
            outcome
                .error
                .unwrap_or_else(|| "execution failed".to_string()),
        )
    };

    Completion {
        status,
        result: Some(outcome.output),
        error,
        end_time: Utc::now(),
        resource_usage: Some(outcome.usage),
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Human-readable failure string stored on the record
fn failure_message(err: &SandboxError) -> String {
    match err {
        SandboxError::Timeout { .. } => TIMED_OUT.to_string(),
        SandboxError::Script(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerSpec, LogLine, StatsSample};
    use crate::storage::InMemoryExecutionStore;
    use crate::types::{ParamType, ResourceLimits, ToolParameter, ToolType};
    use async_trait::async_trait;
    use futures_util::stream::{BoxStream, StreamExt};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn tool(isolation: IsolationTier, limits: ResourceLimits) -> Tool {
        Tool {
            id: "js".to_string(),
            name: "JavaScript".to_string(),
            tool_type: ToolType::Execution,
            command: "javascript".to_string(),
            parameters: vec![ToolParameter {
                name: "code".to_string(),
                param_type: ParamType::String,
                required: true,
                default: None,
            }],
            resource_limits: limits,
            isolation,
        }
    }

    fn code(code: &str) -> HashMap<String, Value> {
        HashMap::from([("code".to_string(), json!(code))])
    }

    fn orchestrator() -> ExecutionOrchestrator {
        ExecutionOrchestrator::new(
            Arc::new(InMemoryExecutionStore::new()),
            EngineSettings::default(),
        )
    }

    async fn wait_terminal(
        orch: &ExecutionOrchestrator,
        id: &str,
        user: &str,
    ) -> ExecutionRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = orch.get_status(id, user).await.unwrap();
                if record.status.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("execution should reach a terminal state")
    }

    /// Backend that never finishes unless cancelled
    struct Hanging {
        honour_cancel: bool,
    }

    #[async_trait]
    impl IsolationBackend for Hanging {
        fn name(&self) -> &'static str {
            "hanging"
        }

        fn supports(&self, _language: &str) -> bool {
            true
        }

        async fn run(&self, _job: SandboxJob, mut cancel: CancelSignal) -> Result<BackendOutcome> {
            if self.honour_cancel {
                cancel.cancelled().await;
                Err(SandboxError::InvalidState(CANCELLED_BY_USER.to_string()))
            } else {
                std::future::pending().await
            }
        }
    }

    #[tokio::test]
    async fn test_execute_returns_pending_ticket_and_completes() {
        let orch = orchestrator();
        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("console.log('one'); console.log('two'); console.log('three'); 42"),
                "alice",
            )
            .await
            .unwrap();

        assert_eq!(ticket.status, ExecutionStatus::Pending);

        let record = wait_terminal(&orch, &ticket.execution_id, "alice").await;
        assert_eq!(record.status, ExecutionStatus::Completed);
        let result = record.result.unwrap();
        assert_eq!(result.output, vec!["one", "two", "three"]);
        assert_eq!(result.value, json!(42));
        assert!(record.end_time.is_some());
        assert!(record.resource_usage.is_some());
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let orch = orchestrator();
        let limits = ResourceLimits {
            max_execution_time_ms: Some(100),
            ..Default::default()
        };
        let started = Instant::now();
        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, limits),
                code("while (true) {}"),
                "alice",
            )
            .await
            .unwrap();

        let record = wait_terminal(&orch, &ticket.execution_id, "alice").await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timed out"));
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_thrown_error_fails_with_message() {
        let orch = orchestrator();
        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("throw new Error('kaput')"),
                "alice",
            )
            .await
            .unwrap();

        let record = wait_terminal(&orch, &ticket.execution_id, "alice").await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.unwrap().contains("kaput"));
    }

    #[tokio::test]
    async fn test_missing_parameter_creates_no_record() {
        let orch = orchestrator();
        let err = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                HashMap::new(),
                "alice",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Validation(_)));
        assert!(orch.list_executions("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_container_tier_disabled() {
        let orch = orchestrator();
        let err = orch
            .execute(
                &tool(IsolationTier::Container, ResourceLimits::default()),
                code("1"),
                "alice",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::SandboxDisabled));
    }

    #[tokio::test]
    async fn test_unsupported_language_in_process() {
        let orch = orchestrator();
        let mut params = code("print(1)");
        params.insert("language".to_string(), json!("python"));

        let err = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                params,
                "alice",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::UnsupportedLanguage(lang) if lang == "python"));
    }

    #[tokio::test]
    async fn test_ownership_is_enforced() {
        let orch = orchestrator();
        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("1"),
                "alice",
            )
            .await
            .unwrap();

        assert!(matches!(
            orch.get_status(&ticket.execution_id, "mallory").await,
            Err(SandboxError::Forbidden(_))
        ));
        assert!(matches!(
            orch.get_status("missing", "alice").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            orch.cancel(&ticket.execution_id, "mallory").await,
            Err(SandboxError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let orch = orchestrator()
            .with_in_process_backend(Arc::new(Hanging { honour_cancel: true }));
        let mut events = orch.subscribe();

        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("1"),
                "alice",
            )
            .await
            .unwrap();

        // Wait until dispatched
        loop {
            if let ExecutionEvent::Status { status, .. } = events.recv().await.unwrap() {
                if status == ExecutionStatus::Running {
                    break;
                }
            }
        }

        let cancelled = orch.cancel(&ticket.execution_id, "alice").await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some(CANCELLED_BY_USER));

        // The backend's own failure must not overwrite the cancellation
        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = orch.get_status(&ticket.execution_id, "alice").await.unwrap();
        assert_eq!(record.error.as_deref(), Some(CANCELLED_BY_USER));

        assert!(matches!(
            orch.cancel(&ticket.execution_id, "alice").await,
            Err(SandboxError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_completed_is_invalid_state() {
        let orch = orchestrator();
        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("1"),
                "alice",
            )
            .await
            .unwrap();
        wait_terminal(&orch, &ticket.execution_id, "alice").await;

        assert!(matches!(
            orch.cancel(&ticket.execution_id, "alice").await,
            Err(SandboxError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_backstop_fails_hung_backend() {
        let settings = EngineSettings {
            backstop_grace: Duration::from_millis(20),
            ..Default::default()
        };
        let orch = ExecutionOrchestrator::new(Arc::new(InMemoryExecutionStore::new()), settings)
            .with_in_process_backend(Arc::new(Hanging {
                honour_cancel: false,
            }));
        let limits = ResourceLimits {
            max_execution_time_ms: Some(30),
            ..Default::default()
        };

        let ticket = orch
            .execute(&tool(IsolationTier::InProcess, limits), code("1"), "alice")
            .await
            .unwrap();

        let record = wait_terminal(&orch, &ticket.execution_id, "alice").await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_concurrent_users_are_independent() {
        let orch = orchestrator();
        let t = tool(IsolationTier::InProcess, ResourceLimits::default());

        let a = orch.execute(&t, code("'a'"), "alice").await.unwrap();
        let b = orch.execute(&t, code("'b'"), "bob").await.unwrap();

        let (ra, rb) = tokio::join!(
            wait_terminal(&orch, &a.execution_id, "alice"),
            wait_terminal(&orch, &b.execution_id, "bob")
        );

        assert_eq!(ra.result.unwrap().value, json!("a"));
        assert_eq!(rb.result.unwrap().value, json!("b"));
        assert_eq!(orch.list_executions("alice").await.unwrap().len(), 1);
        assert_eq!(orch.list_executions("bob").await.unwrap().len(), 1);
    }

    /// Records the job it was handed and succeeds at once
    #[derive(Default)]
    struct Recording {
        limits: Mutex<Option<ResourceLimits>>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl IsolationBackend for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn supports(&self, _language: &str) -> bool {
            true
        }

        async fn run(&self, job: SandboxJob, _cancel: CancelSignal) -> Result<BackendOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.limits.lock().unwrap() = Some(job.limits);
            Ok(BackendOutcome {
                success: true,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_omitted_limits_come_from_settings() {
        let settings = EngineSettings {
            default_max_execution_ms: 1_500,
            default_max_memory_mb: 64,
            ..Default::default()
        };
        let backend = Arc::new(Recording::default());
        let orch = ExecutionOrchestrator::new(Arc::new(InMemoryExecutionStore::new()), settings)
            .with_in_process_backend(backend.clone());

        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("1"),
                "alice",
            )
            .await
            .unwrap();
        wait_terminal(&orch, &ticket.execution_id, "alice").await;

        let applied = backend.limits.lock().unwrap().clone().unwrap();
        assert_eq!(applied.max_execution_time_ms, Some(1_500));
        assert_eq!(applied.max_memory_mb, Some(64));
        assert_eq!(applied.timeout(), Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn test_explicit_limits_beat_settings() {
        let settings = EngineSettings {
            default_max_execution_ms: 1_500,
            ..Default::default()
        };
        let backend = Arc::new(Recording::default());
        let orch = ExecutionOrchestrator::new(Arc::new(InMemoryExecutionStore::new()), settings)
            .with_in_process_backend(backend.clone());
        let limits = ResourceLimits {
            max_execution_time_ms: Some(200),
            ..Default::default()
        };

        let ticket = orch
            .execute(&tool(IsolationTier::InProcess, limits), code("1"), "alice")
            .await
            .unwrap();
        wait_terminal(&orch, &ticket.execution_id, "alice").await;

        let applied = backend.limits.lock().unwrap().clone().unwrap();
        assert_eq!(applied.max_execution_time_ms, Some(200));
    }

    #[tokio::test]
    async fn test_oversized_memory_limit_is_rejected() {
        let orch = orchestrator();
        let limits = ResourceLimits {
            max_memory_mb: Some(u64::MAX),
            ..Default::default()
        };

        let err = orch
            .execute(&tool(IsolationTier::InProcess, limits), code("1"), "alice")
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Validation(_)));
        assert!(orch.list_executions("alice").await.unwrap().is_empty());
    }

    /// In-memory store whose `mark_running` waits for a go-ahead
    struct GatedStore {
        inner: InMemoryExecutionStore,
        gate: Notify,
    }

    #[async_trait]
    impl ExecutionStore for GatedStore {
        async fn insert(&self, record: &ExecutionRecord) -> Result<()> {
            self.inner.insert(record).await
        }
        async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
            self.inner.get(id).await
        }
        async fn mark_running(&self, id: &str) -> Result<bool> {
            self.gate.notified().await;
            self.inner.mark_running(id).await
        }
        async fn finish(&self, id: &str, completion: Completion) -> Result<Option<ExecutionRecord>> {
            self.inner.finish(id, completion).await
        }
        async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExecutionRecord>> {
            self.inner.list_for_user(user_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_execution_never_runs() {
        let store = Arc::new(GatedStore {
            inner: InMemoryExecutionStore::new(),
            gate: Notify::new(),
        });
        let backend = Arc::new(Recording::default());
        let orch = ExecutionOrchestrator::new(store.clone(), EngineSettings::default())
            .with_in_process_backend(backend.clone());
        let mut events = orch.subscribe();

        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("1"),
                "alice",
            )
            .await
            .unwrap();

        let cancelled = orch.cancel(&ticket.execution_id, "alice").await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some(CANCELLED_BY_USER));

        store.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = orch.get_status(&ticket.execution_id, "alice").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some(CANCELLED_BY_USER));
        assert_eq!(backend.runs.load(Ordering::SeqCst), 0);

        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::Status { status, .. } = event {
                assert_ne!(status, ExecutionStatus::Running);
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl IsolationBackend for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn supports(&self, _language: &str) -> bool {
            true
        }

        async fn run(&self, _job: SandboxJob, _cancel: CancelSignal) -> Result<BackendOutcome> {
            panic!("backend blew up")
        }
    }

    #[tokio::test]
    async fn test_backend_panic_marks_record_failed() {
        let orch = orchestrator().with_in_process_backend(Arc::new(Panicking));
        let ticket = orch
            .execute(
                &tool(IsolationTier::InProcess, ResourceLimits::default()),
                code("1"),
                "alice",
            )
            .await
            .unwrap();

        let record = wait_terminal(&orch, &ticket.execution_id, "alice").await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("execution crashed: backend blew up")
        );
    }

    /// Waits for cancellation and remembers that it saw it
    #[derive(Default)]
    struct CancelAware {
        saw_cancel: AtomicBool,
    }

    #[async_trait]
    impl IsolationBackend for CancelAware {
        fn name(&self) -> &'static str {
            "cancel-aware"
        }

        fn supports(&self, _language: &str) -> bool {
            true
        }

        async fn run(&self, job: SandboxJob, mut cancel: CancelSignal) -> Result<BackendOutcome> {
            job.started.mark_started();
            cancel.cancelled().await;
            self.saw_cancel.store(true, Ordering::SeqCst);
            Err(SandboxError::InvalidState(CANCELLED_BY_USER.to_string()))
        }
    }

    #[tokio::test]
    async fn test_backstop_cancels_backend_and_records_timeout() {
        let settings = EngineSettings {
            backstop_grace: Duration::from_millis(20),
            ..Default::default()
        };
        let backend = Arc::new(CancelAware::default());
        let orch = ExecutionOrchestrator::new(Arc::new(InMemoryExecutionStore::new()), settings)
            .with_in_process_backend(backend.clone());
        let limits = ResourceLimits {
            max_execution_time_ms: Some(30),
            ..Default::default()
        };

        let ticket = orch
            .execute(&tool(IsolationTier::InProcess, limits), code("1"), "alice")
            .await
            .unwrap();

        let record = wait_terminal(&orch, &ticket.execution_id, "alice").await;
        assert_eq!(record.error.as_deref(), Some("timed out"));
        assert!(backend.saw_cancel.load(Ordering::SeqCst));
    }

    /// Runtime whose `start` hangs well past any deadline
    struct SlowStartRuntime {
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerRuntime for SlowStartRuntime {
        async fn create(&self, _spec: &ContainerSpec) -> Result<String> {
            Ok("c-1".to_string())
        }
        async fn start(&self, _id: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }
        async fn wait(&self, _id: &str) -> Result<Option<i64>> {
            std::future::pending().await
        }
        async fn stop(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, id: &str) -> Result<()> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn stats(&self, _id: &str) -> Result<Option<StatsSample>> {
            Ok(None)
        }
        fn logs(&self, _id: &str) -> BoxStream<'static, Result<LogLine>> {
            futures_util::stream::empty().boxed()
        }
    }

    #[tokio::test]
    async fn test_backstop_still_removes_container() {
        let settings = EngineSettings {
            container_sandbox_enabled: true,
            backstop_grace: Duration::from_millis(20),
            ..Default::default()
        };
        let runtime = Arc::new(SlowStartRuntime {
            removed: Mutex::new(Vec::new()),
        });
        let orch = ExecutionOrchestrator::new(Arc::new(InMemoryExecutionStore::new()), settings)
            .with_container_runtime(
                runtime.clone(),
                Arc::new(LanguageProfiles::builtin().unwrap()),
            );
        let limits = ResourceLimits {
            max_execution_time_ms: Some(50),
            ..Default::default()
        };

        let ticket = orch
            .execute(&tool(IsolationTier::Container, limits), code("1"), "alice")
            .await
            .unwrap();

        let record = wait_terminal(&orch, &ticket.execution_id, "alice").await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timed out"));

        for _ in 0..100 {
            if !runtime.removed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*runtime.removed.lock().unwrap(), vec!["c-1".to_string()]);
    }
}
