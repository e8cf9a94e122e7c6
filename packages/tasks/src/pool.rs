// ABOUTME: Elastic task pool built as a single actor task plus a cloneable handle
// ABOUTME: Owns the worker map, queue, and counters; scales, times out, and replaces workers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, Result};
use crate::handler::HandlerRegistry;
use crate::message::{PoolEvent, PoolToWorker, WorkerToPool};
use crate::queue::TaskQueue;
use crate::types::{PoolStats, Task, TaskProgress, TaskResult, WorkerInfo, WorkerStatus};
use crate::worker::{spawn_worker, WorkerHandle};
use crate::PoolConfig;

/// Error string given to tasks dropped by a shutdown
pub const SHUTTING_DOWN: &str = "pool shutting down";

const COMMAND_CHANNEL_SIZE: usize = 256;
const PROGRESS_CHANNEL_SIZE: usize = 256;

#[derive(Debug)]
enum Command {
    Submit {
        task: Task,
        respond_to: oneshot::Sender<TaskResult>,
    },
    Stats {
        respond_to: oneshot::Sender<PoolStats>,
    },
    Workers {
        respond_to: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running pool. Cloning is cheap; the pool shuts down once
/// every handle is dropped.
#[derive(Debug, Clone)]
pub struct TaskPool {
    commands: mpsc::Sender<Command>,
    registry: Arc<HandlerRegistry>,
    progress: broadcast::Sender<TaskProgress>,
}

impl TaskPool {
    /// Start the pool actor with `min_workers` workers. Must be called from
    /// within a tokio runtime.
    pub fn start(config: PoolConfig, registry: HandlerRegistry) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(registry);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_SIZE);

        info!(
            "Starting task pool ({}..={} workers) for task types {:?}",
            config.min_workers,
            config.max_workers,
            registry.task_types()
        );

        let actor = PoolActor {
            config,
            registry: registry.clone(),
            commands: commands_rx,
            commands_closed: false,
            events: events_rx,
            events_tx,
            progress: progress_tx.clone(),
            workers: HashMap::new(),
            queue: TaskQueue::new(),
            pending: HashMap::new(),
            completed_count: 0,
            failed_count: 0,
            total_execution_ms: 0,
            shutting_down: false,
            shutdown_deadline: None,
            shutdown_waiters: Vec::new(),
            next_worker: 0,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            registry,
            progress: progress_tx,
        })
    }

    /// Validate and queue a task, returning as soon as it is accepted
    pub async fn submit(
        &self,
        task_type: &str,
        payload: Value,
        priority: i32,
    ) -> Result<PendingTask> {
        self.registry.validate(task_type, &payload)?;

        let task = Task::new(task_type, payload, priority);
        let task_id = task.id.clone();
        let (respond_to, rx) = oneshot::channel();

        self.commands
            .send(Command::Submit { task, respond_to })
            .await
            .map_err(|_| PoolError::ShuttingDown)?;

        Ok(PendingTask { task_id, rx })
    }

    /// Queue a task and wait for its value
    pub async fn enqueue(&self, task_type: &str, payload: Value, priority: i32) -> Result<Value> {
        self.submit(task_type, payload, priority).await?.value().await
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        self.call(|respond_to| Command::Stats { respond_to }).await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        self.call(|respond_to| Command::Workers { respond_to }).await
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<TaskProgress> {
        self.progress.subscribe()
    }

    /// Stop accepting work, fail queued tasks, and wait for workers to finish
    /// within the grace period. Calling it on a stopped pool is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        match self.call(|respond_to| Command::Shutdown { respond_to }).await {
            Ok(()) | Err(PoolError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(make(respond_to))
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }
}

/// A queued task whose result has not been collected yet
#[derive(Debug)]
pub struct PendingTask {
    task_id: String,
    rx: oneshot::Receiver<TaskResult>,
}

impl PendingTask {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn wait(self) -> Result<TaskResult> {
        self.rx.await.map_err(|_| PoolError::Closed)
    }

    /// Wait and turn a failed result into an error
    pub async fn value(self) -> Result<Value> {
        let result = self.wait().await?;
        match result.error {
            Some(e) if e == SHUTTING_DOWN => Err(PoolError::ShuttingDown),
            Some(e) => Err(PoolError::TaskFailed(e)),
            None => Ok(result.result.unwrap_or(Value::Null)),
        }
    }
}

struct WorkerSlot {
    seq: u64,
    info: WorkerInfo,
    handle: WorkerHandle,
    ready: bool,
    last_active: Instant,
    task_started: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    fn is_idle(&self) -> bool {
        self.info.status == WorkerStatus::Idle
    }

    fn clear_task(&mut self) -> Option<(String, u64)> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let elapsed = self
            .task_started
            .take()
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.info.current_task.take().map(|id| (id, elapsed))
    }
}

struct PoolActor {
    config: PoolConfig,
    registry: Arc<HandlerRegistry>,
    commands: mpsc::Receiver<Command>,
    commands_closed: bool,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    progress: broadcast::Sender<TaskProgress>,
    workers: HashMap<String, WorkerSlot>,
    queue: TaskQueue,
    pending: HashMap<String, oneshot::Sender<TaskResult>>,
    completed_count: u64,
    failed_count: u64,
    total_execution_ms: u64,
    shutting_down: bool,
    shutdown_deadline: Option<Instant>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    next_worker: u64,
}

impl PoolActor {
    async fn run(mut self) {
        for _ in 0..self.config.min_workers {
            self.spawn_worker();
        }

        let period = self.config.monitor_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let deadline = self.shutdown_deadline;
            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All pool handles dropped");
                        self.commands_closed = true;
                        self.begin_shutdown();
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = ticker.tick(), if !self.shutting_down => self.monitor(),
                _ = sleep_until(deadline) => self.force_stop(),
            }

            if self.shutting_down && self.workers.is_empty() {
                break;
            }
        }

        // Refuse new commands, then answer whatever was already buffered
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Submit { task, respond_to } => {
                    let _ = respond_to.send(TaskResult::failure(task.id, SHUTTING_DOWN, 0));
                }
                Command::Shutdown { respond_to } => self.shutdown_waiters.push(respond_to),
                Command::Stats { .. } | Command::Workers { .. } => {}
            }
        }
        for (task_id, respond_to) in self.pending.drain() {
            let _ = respond_to.send(TaskResult::failure(task_id, SHUTTING_DOWN, 0));
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!(
            "Task pool stopped ({} completed, {} failed)",
            self.completed_count, self.failed_count
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { task, respond_to } => {
                if self.shutting_down {
                    let _ = respond_to.send(TaskResult::failure(task.id, SHUTTING_DOWN, 0));
                    return;
                }
                debug!(
                    "Queued task {} ({}, priority {})",
                    task.id, task.task_type, task.priority
                );
                self.pending.insert(task.id.clone(), respond_to);
                self.queue.push(task);
                self.scale_up();
                self.dispatch();
            }
            Command::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            Command::Workers { respond_to } => {
                let mut slots: Vec<&WorkerSlot> = self.workers.values().collect();
                slots.sort_by_key(|slot| slot.seq);
                let _ = respond_to.send(slots.into_iter().map(|slot| slot.info.clone()).collect());
            }
            Command::Shutdown { respond_to } => {
                self.shutdown_waiters.push(respond_to);
                self.begin_shutdown();
            }
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Worker(WorkerToPool::Ready { worker_id }) => {
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.ready = true;
                }
                self.dispatch();
            }
            PoolEvent::Worker(WorkerToPool::Progress(progress)) => {
                let _ = self.progress.send(progress);
            }
            PoolEvent::Worker(WorkerToPool::Result { worker_id, result }) => {
                self.on_result(&worker_id, result);
            }
            PoolEvent::Exited { worker_id, reason } => self.on_exit(&worker_id, reason),
            PoolEvent::TaskTimedOut { worker_id, task_id } => self.on_timeout(&worker_id, &task_id),
        }
    }

    fn on_result(&mut self, worker_id: &str, result: TaskResult) {
        let Some(slot) = self.workers.get_mut(worker_id) else {
            debug!("Ignoring result from removed worker {}", worker_id);
            return;
        };
        if slot.info.current_task.as_deref() != Some(result.task_id.as_str()) {
            debug!("Ignoring stale result for task {}", result.task_id);
            return;
        }

        slot.clear_task();
        slot.info.status = WorkerStatus::Idle;
        slot.info.task_count += 1;
        if !result.is_success() {
            slot.info.error_count += 1;
        }
        slot.info.last_active_at = Utc::now();
        slot.last_active = Instant::now();

        self.complete(result);
        self.dispatch();
    }

    fn on_timeout(&mut self, worker_id: &str, task_id: &str) {
        let holds_task = self
            .workers
            .get(worker_id)
            .is_some_and(|slot| slot.info.current_task.as_deref() == Some(task_id));
        if !holds_task {
            return;
        }

        let millis = self.config.task_timeout.as_millis();
        warn!(
            "Task {} timed out after {}ms on worker {}",
            task_id, millis, worker_id
        );
        self.crash_worker(worker_id, format!("task timed out after {}ms", millis));
    }

    fn on_exit(&mut self, worker_id: &str, reason: Option<String>) {
        if !self.workers.contains_key(worker_id) {
            return;
        }

        match reason {
            None if self.shutting_down => {
                debug!("Worker {} finished", worker_id);
                if let Some(mut slot) = self.workers.remove(worker_id) {
                    if let Some((task_id, elapsed)) = slot.clear_task() {
                        self.complete(TaskResult::failure(task_id, SHUTTING_DOWN, elapsed));
                    }
                }
            }
            reason => {
                let reason = reason.unwrap_or_else(|| "worker exited unexpectedly".to_string());
                error!("Worker {} died: {}", worker_id, reason);
                self.crash_worker(worker_id, reason);
            }
        }
    }

    /// Fail the worker's task, terminate it, and replace it unless shutting down
    fn crash_worker(&mut self, worker_id: &str, reason: String) {
        let Some(mut slot) = self.workers.remove(worker_id) else {
            return;
        };

        slot.info.status = WorkerStatus::Error;
        slot.handle.abort.abort();
        if let Some((task_id, elapsed)) = slot.clear_task() {
            self.complete(TaskResult::failure(task_id, reason, elapsed));
        }
        slot.info.status = WorkerStatus::Terminated;
        debug!("Worker {} terminated after {} tasks", worker_id, slot.info.task_count);

        if !self.shutting_down {
            self.spawn_worker();
        }
        self.dispatch();
    }

    fn complete(&mut self, result: TaskResult) {
        if result.is_success() {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.total_execution_ms += result.execution_time_ms;

        match self.pending.remove(&result.task_id) {
            Some(respond_to) => {
                if respond_to.send(result).is_err() {
                    debug!("Task submitter went away before the result arrived");
                }
            }
            None => warn!("No submitter waiting for task {}", result.task_id),
        }
    }

    fn spawn_worker(&mut self) {
        self.next_worker += 1;
        let seq = self.next_worker;
        let id = format!("worker-{}", seq);
        let handle = spawn_worker(id.clone(), self.registry.clone(), self.events_tx.clone());

        debug!("Spawned {}", id);
        self.workers.insert(
            id.clone(),
            WorkerSlot {
                seq,
                info: WorkerInfo::new(id),
                handle,
                ready: false,
                last_active: Instant::now(),
                task_started: None,
                timer: None,
            },
        );
    }

    /// Ask an idle worker to exit. Its exit event is ignored once removed.
    fn stop_worker(&mut self, worker_id: &str) {
        if let Some(mut slot) = self.workers.remove(worker_id) {
            slot.info.status = WorkerStatus::Terminated;
            let _ = slot.handle.inbox.send(PoolToWorker::Shutdown);
        }
    }

    /// Grow when queued work outnumbers idle workers
    fn scale_up(&mut self) {
        let idle = self.workers.values().filter(|slot| slot.is_idle()).count();
        let queued = self.queue.len();
        let current = self.workers.len();
        if idle >= queued || current >= self.config.max_workers {
            return;
        }

        let extra = queued
            .div_ceil(2)
            .max(1)
            .min(self.config.max_workers - current);
        debug!("Scaling up by {} workers ({} queued)", extra, queued);
        for _ in 0..extra {
            self.spawn_worker();
        }
    }

    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let next = self
                .workers
                .values()
                .filter(|slot| slot.ready && slot.is_idle())
                .min_by_key(|slot| slot.seq)
                .map(|slot| slot.info.id.clone());
            let Some(worker_id) = next else {
                break;
            };
            let Some(task) = self.queue.pop() else {
                break;
            };
            self.assign(&worker_id, task);
        }
    }

    fn assign(&mut self, worker_id: &str, task: Task) {
        let Some(slot) = self.workers.get_mut(worker_id) else {
            self.queue.requeue(task);
            return;
        };

        let task_id = task.id.clone();
        if let Err(mpsc::error::SendError(message)) = slot.handle.inbox.send(PoolToWorker::Execute(task)) {
            // Inbox closed: the worker is gone and its exit event will follow
            slot.ready = false;
            slot.info.status = WorkerStatus::Error;
            if let PoolToWorker::Execute(task) = message {
                self.queue.requeue(task);
            }
            return;
        }

        debug!("Dispatching task {} to {}", task_id, worker_id);
        slot.info.status = WorkerStatus::Busy;
        slot.info.current_task = Some(task_id.clone());
        slot.info.last_active_at = Utc::now();
        slot.last_active = Instant::now();
        slot.task_started = Some(Instant::now());

        let timeout = self.config.task_timeout;
        let events = self.events_tx.clone();
        let worker_id = worker_id.to_string();
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(PoolEvent::TaskTimedOut { worker_id, task_id });
        }));
    }

    /// Retire worn-out workers, reap idle ones above the minimum, and top up
    fn monitor(&mut self) {
        let retiring: Vec<String> = self
            .workers
            .values()
            .filter(|slot| slot.is_idle() && slot.info.task_count >= self.config.max_tasks_per_worker)
            .map(|slot| slot.info.id.clone())
            .collect();
        for worker_id in retiring {
            info!("Retiring {} after {} tasks", worker_id, self.config.max_tasks_per_worker);
            self.stop_worker(&worker_id);
            self.spawn_worker();
        }

        let now = Instant::now();
        let mut stale: Vec<(Instant, String)> = self
            .workers
            .values()
            .filter(|slot| slot.is_idle() && now.duration_since(slot.last_active) >= self.config.idle_timeout)
            .map(|slot| (slot.last_active, slot.info.id.clone()))
            .collect();
        stale.sort();
        for (_, worker_id) in stale {
            if self.workers.len() <= self.config.min_workers {
                break;
            }
            debug!("Reaping idle {}", worker_id);
            self.stop_worker(&worker_id);
        }

        while self.workers.len() < self.config.min_workers {
            self.spawn_worker();
        }
        self.dispatch();
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(
            "Shutting down task pool ({} queued, {} workers)",
            self.queue.len(),
            self.workers.len()
        );
        self.shutting_down = true;
        self.shutdown_deadline = Some(Instant::now() + self.config.shutdown_grace);

        let dropped: Vec<Task> = self.queue.drain().collect();
        for task in dropped {
            if let Some(respond_to) = self.pending.remove(&task.id) {
                let _ = respond_to.send(TaskResult::failure(task.id, SHUTTING_DOWN, 0));
            }
        }

        for slot in self.workers.values() {
            let _ = slot.handle.inbox.send(PoolToWorker::Shutdown);
        }
    }

    fn force_stop(&mut self) {
        self.shutdown_deadline = None;
        if self.workers.is_empty() {
            return;
        }
        warn!(
            "Shutdown grace period elapsed, terminating {} workers",
            self.workers.len()
        );

        let remaining: Vec<WorkerSlot> = self.workers.drain().map(|(_, slot)| slot).collect();
        for mut slot in remaining {
            slot.handle.abort.abort();
            if let Some((task_id, elapsed)) = slot.clear_task() {
                self.complete(TaskResult::failure(task_id, SHUTTING_DOWN, elapsed));
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let finished = self.completed_count + self.failed_count;
        PoolStats {
            worker_count: self.workers.len(),
            idle_count: self.workers.values().filter(|slot| slot.is_idle()).count(),
            busy_count: self
                .workers
                .values()
                .filter(|slot| slot.info.status == WorkerStatus::Busy)
                .count(),
            queue_length: self.queue.len(),
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            avg_execution_time_ms: if finished == 0 {
                0.0
            } else {
                self.total_execution_ms as f64 / finished as f64
            },
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
