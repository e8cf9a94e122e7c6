// ABOUTME: Worker threads and the loop each one runs
// ABOUTME: One OS thread and runtime per worker; panics and aborts are reported back to the pool

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};

use crate::handler::{HandlerRegistry, ProgressReporter};
use crate::message::{PoolEvent, PoolToWorker, WorkerToPool};
use crate::types::TaskResult;

/// Pool-side handle to a running worker
pub(crate) struct WorkerHandle {
    pub inbox: mpsc::UnboundedSender<PoolToWorker>,
    pub abort: WorkerAbort,
}

/// Stops a worker at its next await point.
///
/// A handler that never yields keeps its thread until it returns, but the
/// pool has moved on by then and the late result is dropped.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerAbort {
    aborted: Arc<AtomicBool>,
    signal: Arc<Notify>,
}

impl WorkerAbort {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.signal.notify_one();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while !self.is_aborted() {
            self.signal.notified().await;
        }
    }
}

/// Start a worker on its own thread. Its exit is always reported as
/// `PoolEvent::Exited`, with a reason when it panicked or failed to start.
pub(crate) fn spawn_worker(
    worker_id: String,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<PoolEvent>,
) -> WorkerHandle {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let abort = WorkerAbort::default();

    let thread_id = worker_id.clone();
    let thread_events = events.clone();
    let thread_abort = abort.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("runbox-{}", worker_id))
        .spawn(move || {
            let reason = run_thread(
                &thread_id,
                registry,
                inbox_rx,
                thread_events.clone(),
                &thread_abort,
            );
            let _ = thread_events.send(PoolEvent::Exited {
                worker_id: thread_id,
                reason,
            });
        });

    if let Err(e) = spawned {
        error!("Failed to spawn a thread for {}: {}", worker_id, e);
        let _ = events.send(PoolEvent::Exited {
            worker_id,
            reason: Some(format!("worker failed to start: {}", e)),
        });
    }

    WorkerHandle {
        inbox: inbox_tx,
        abort,
    }
}

/// Body of a worker thread. Returns the crash reason, if any.
fn run_thread(
    worker_id: &str,
    registry: Arc<HandlerRegistry>,
    inbox: mpsc::UnboundedReceiver<PoolToWorker>,
    events: mpsc::UnboundedSender<PoolEvent>,
    abort: &WorkerAbort,
) -> Option<String> {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return Some(format!("worker failed to start: {}", e)),
    };

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async {
            tokio::select! {
                _ = run_worker(worker_id, registry, inbox, events, abort) => {}
                _ = abort.wait() => debug!("Worker {} aborted", worker_id),
            }
        })
    }));

    outcome.err().map(panic_message)
}

async fn run_worker(
    worker_id: &str,
    registry: Arc<HandlerRegistry>,
    mut inbox: mpsc::UnboundedReceiver<PoolToWorker>,
    events: mpsc::UnboundedSender<PoolEvent>,
    abort: &WorkerAbort,
) {
    debug!("Worker {} started", worker_id);
    if events
        .send(WorkerToPool::Ready { worker_id: worker_id.to_string() }.into())
        .is_err()
    {
        return;
    }

    while let Some(message) = inbox.recv().await {
        match message {
            PoolToWorker::Execute(task) => {
                let task_id = task.id.clone();
                let progress = ProgressReporter::new(worker_id.to_string(), task_id.clone(), events.clone());
                let started = Instant::now();

                let outcome = registry.run(task, progress).await;
                if abort.is_aborted() {
                    debug!("Worker {} dropping late result for task {}", worker_id, task_id);
                    break;
                }

                let elapsed = started.elapsed().as_millis() as u64;
                let result = match outcome {
                    Ok(value) => TaskResult::success(task_id, value, elapsed),
                    Err(e) => TaskResult::failure(task_id, e, elapsed),
                };

                let message = WorkerToPool::Result {
                    worker_id: worker_id.to_string(),
                    result,
                };
                if events.send(message.into()).is_err() {
                    error!("Worker {} lost its pool", worker_id);
                    break;
                }
            }
            PoolToWorker::Shutdown => break,
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker crashed: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker crashed: {}", s)
    } else {
        "worker crashed".to_string()
    }
}
