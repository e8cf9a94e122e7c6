// ABOUTME: Messages exchanged between the pool and its workers
// ABOUTME: Closed enums so every message kind is handled by an exhaustive match

use crate::types::{Task, TaskProgress, TaskResult};

/// Pool to worker
#[derive(Debug, Clone)]
pub enum PoolToWorker {
    Execute(Task),
    /// Finish the current task, then exit
    Shutdown,
}

/// Worker to pool
#[derive(Debug, Clone)]
pub enum WorkerToPool {
    Ready { worker_id: String },
    Progress(TaskProgress),
    Result { worker_id: String, result: TaskResult },
}

/// Everything the pool actor can receive besides caller commands
#[derive(Debug)]
pub(crate) enum PoolEvent {
    Worker(WorkerToPool),
    /// A worker task ended. `reason` is set when it panicked.
    Exited {
        worker_id: String,
        reason: Option<String>,
    },
    TaskTimedOut {
        worker_id: String,
        task_id: String,
    },
}

impl From<WorkerToPool> for PoolEvent {
    fn from(message: WorkerToPool) -> Self {
        PoolEvent::Worker(message)
    }
}
