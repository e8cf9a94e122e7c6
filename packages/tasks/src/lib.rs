// ABOUTME: Background task pool for Runbox
// ABOUTME: Elastic workers running typed handlers, fed from a priority queue by a single actor

pub mod error;
pub mod handler;
pub mod message;
pub mod pool;
pub mod queue;
pub mod types;
mod worker;

/// Pool sizing and timing, loaded from the `RUNBOX_POOL_*` environment
pub use runbox_config::PoolSettings as PoolConfig;

pub use error::{PoolError, Result};
pub use handler::{HandlerRegistry, ProgressReporter, TaskHandler};
pub use message::{PoolToWorker, WorkerToPool};
pub use pool::{PendingTask, TaskPool, SHUTTING_DOWN};
pub use queue::TaskQueue;
pub use types::{PoolStats, Task, TaskProgress, TaskResult, WorkerInfo, WorkerStatus};
