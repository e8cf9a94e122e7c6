// ABOUTME: Isolation backend trait shared by the in-process and container tiers
// ABOUTME: Defines the job handed to a backend, its outcome, cancellation, and the event sink

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Notify};
use tracing::trace;

use crate::error::Result;
use crate::types::{
    ExecutionEvent, ExecutionOutput, LogStream, ResourceLimits, ResourceUsage,
};
use crate::validation::CodeSubmission;

/// Everything a backend needs to run one execution
#[derive(Debug, Clone)]
pub struct SandboxJob {
    pub execution_id: String,
    pub submission: CodeSubmission,
    pub limits: ResourceLimits,
    pub events: EventSink,
    /// Marked by the backend once preparation is over and the run clock starts
    pub started: StartSignal,
}

/// What a backend reports when the isolated unit finished on its own.
///
/// `success == false` with an `error` means the user code failed (threw,
/// exited non-zero). Engine failures and timeouts are returned as `Err`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOutcome {
    pub success: bool,
    pub output: ExecutionOutput,
    pub error: Option<String>,
    pub usage: ResourceUsage,
}

/// A single isolation tier
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Tier name for logs
    fn name(&self) -> &'static str;

    /// Whether this tier can run the given (lower-cased) language
    fn supports(&self, language: &str) -> bool;

    /// Run a job to completion, timeout, or cancellation
    async fn run(&self, job: SandboxJob, cancel: CancelSignal) -> Result<BackendOutcome>;
}

/// Receiving side of a per-execution cancellation flag
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a signal and the sender that trips it
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation was requested. Pends forever if the sender
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One-shot marker for "the isolated unit is about to run".
///
/// Image pulls and container creation happen before it, so the orchestrator
/// only starts its deadline once the backend marks it.
#[derive(Debug, Clone, Default)]
pub struct StartSignal {
    notify: Arc<Notify>,
}

impl StartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        self.notify.notify_one();
    }

    /// Resolves once `mark_started` was called, including before the wait began
    pub async fn started(&self) {
        self.notify.notified().await;
    }
}

/// Broadcast sender wrapper for execution events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventSink {
    pub fn new(tx: broadcast::Sender<ExecutionEvent>) -> Self {
        Self { tx }
    }

    /// Sink with its own channel, for backends driven without an orchestrator
    pub fn detached(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ExecutionEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn log(&self, execution_id: &str, stream: LogStream, message: impl Into<String>) {
        self.emit(ExecutionEvent::Log {
            execution_id: execution_id.to_string(),
            stream,
            message: message.into(),
        });
    }

    pub fn stats(&self, execution_id: &str, memory_usage_mb: u64, cpu_percent: f64) {
        self.emit(ExecutionEvent::Stats {
            execution_id: execution_id.to_string(),
            memory_usage_mb,
            cpu_percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_signal_fires() {
        let (tx, mut signal) = CancelSignal::new();
        assert!(!signal.is_cancelled());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });

        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("signal should fire");
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_signal_pends() {
        let mut signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_signal_marked_before_wait() {
        let signal = StartSignal::new();
        signal.clone().mark_started();

        tokio::time::timeout(Duration::from_millis(100), signal.started())
            .await
            .expect("an earlier mark should be remembered");

        let unmarked = StartSignal::new();
        let result = tokio::time::timeout(Duration::from_millis(20), unmarked.started()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_event_sink_without_subscribers() {
        let sink = EventSink::detached(4);
        sink.log("exec", LogStream::Stdout, "hello");

        let mut rx = sink.subscribe();
        sink.stats("exec", 10, 1.5);
        match rx.recv().await.unwrap() {
            ExecutionEvent::Stats { memory_usage_mb, .. } => assert_eq!(memory_usage_mb, 10),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
