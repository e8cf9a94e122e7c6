// ABOUTME: Container isolation tier driving one execution through a ContainerRuntime
// ABOUTME: Stages the workspace, streams logs and stats, races exit against the deadline, always cleans up

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendOutcome, CancelSignal, EventSink, IsolationBackend, SandboxJob};
use crate::container::{cpu_percent, ContainerRuntime, ContainerSpec, StatsSample};
use crate::error::{Result, SandboxError};
use crate::profiles::LanguageProfiles;
use crate::types::{ExecutionOutput, ResourceUsage};
use crate::workspace::{compose_script, parse_result, Workspace};

/// How long buffered log lines get to arrive after the container stops
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Peak memory and last CPU reading gathered by the stats poller
#[derive(Debug, Default, Clone, Copy)]
struct UsageSummary {
    peak_memory_mb: u64,
    last_cpu_percent: f64,
}

enum RunEnd {
    Exited(Option<i64>),
    TimedOut,
    Cancelled,
}

/// Container and helper tasks owned by one run.
///
/// `release` tears them down in order. If the run future is dropped first,
/// `Drop` aborts the helpers and removes the container from a detached task.
struct RunResources {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: Option<String>,
    log_task: Option<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
}

impl RunResources {
    fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            container_id: None,
            log_task: None,
            stats_task: None,
        }
    }

    async fn release(mut self) {
        if let Some(stats) = self.stats_task.take() {
            stats.abort();
        }

        if let Some(mut logs) = self.log_task.take() {
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut logs).await.is_err() {
                debug!("Log stream still open after {:?}, dropping it", LOG_DRAIN_TIMEOUT);
                logs.abort();
            }
        }

        if let Some(id) = self.container_id.take() {
            if let Err(e) = self.runtime.remove(&id).await {
                warn!("Failed to remove container {}: {}", id, e);
            }
        }
    }
}

impl Drop for RunResources {
    fn drop(&mut self) {
        for task in [self.stats_task.take(), self.log_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        let Some(id) = self.container_id.take() else {
            return;
        };
        warn!("Container {} was abandoned mid-run, removing it in the background", id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.runtime.clone();
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&id).await {
                        warn!("Failed to remove abandoned container {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("No async runtime left to remove container {}", id),
        }
    }
}

/// Container-based isolation tier
pub struct ContainerSandbox {
    runtime: Arc<dyn ContainerRuntime>,
    profiles: Arc<LanguageProfiles>,
    stats_interval: Duration,
}

impl ContainerSandbox {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        profiles: Arc<LanguageProfiles>,
        stats_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            profiles,
            stats_interval,
        }
    }

    pub fn profiles(&self) -> &LanguageProfiles {
        &self.profiles
    }

    async fn drive(
        &self,
        job: &SandboxJob,
        workspace: &Workspace,
        cancel: &mut CancelSignal,
        resources: &mut RunResources,
        usage: &Arc<std::sync::Mutex<UsageSummary>>,
    ) -> Result<BackendOutcome> {
        let profile = self.profiles.resolve(&job.submission.language)?;
        let script = compose_script(&job.submission, profile)?;

        let spec = ContainerSpec {
            execution_id: job.execution_id.clone(),
            image: profile.image.clone(),
            command: vec!["sh".to_string(), "-c".to_string(), script],
            workspace: workspace.path().to_path_buf(),
            limits: job.limits.clone(),
        };

        let id = self.runtime.create(&spec).await?;
        resources.container_id = Some(id.clone());
        job.started.mark_started();

        if cancel.is_cancelled() {
            return Err(SandboxError::InvalidState("cancelled by user".to_string()));
        }

        let started = Instant::now();
        tokio::select! {
            result = self.runtime.start(&id) => result?,
            _ = cancel.cancelled() => {
                info!("Execution {} cancelled while container {} was starting", job.execution_id, id);
                return Err(SandboxError::InvalidState("cancelled by user".to_string()));
            }
        }

        resources.log_task = Some(spawn_log_forwarder(
            self.runtime.clone(),
            id.clone(),
            job.execution_id.clone(),
            job.events.clone(),
        ));
        resources.stats_task = Some(spawn_stats_poller(
            self.runtime.clone(),
            id.clone(),
            job.execution_id.clone(),
            job.events.clone(),
            self.stats_interval,
            usage.clone(),
        ));

        let end = tokio::select! {
            exit = self.runtime.wait(&id) => RunEnd::Exited(exit?),
            _ = tokio::time::sleep(job.limits.timeout()) => RunEnd::TimedOut,
            _ = cancel.cancelled() => RunEnd::Cancelled,
        };

        let exit_code = match end {
            RunEnd::Exited(code) => code,
            RunEnd::TimedOut => {
                warn!(
                    "Container {} for execution {} timed out",
                    id, job.execution_id
                );
                self.runtime.stop(&id).await.ok();
                return Err(SandboxError::Timeout {
                    millis: job.limits.execution_time_ms(),
                });
            }
            RunEnd::Cancelled => {
                info!("Stopping container {} on cancellation", id);
                self.runtime.stop(&id).await.ok();
                return Err(SandboxError::InvalidState("cancelled by user".to_string()));
            }
        };

        let elapsed = started.elapsed();
        let raw_output = workspace.read_output();
        let parsed = parse_result(&raw_output, workspace.read_failure(), exit_code);
        let output_lines: Vec<String> = raw_output.lines().map(String::from).collect();
        let collected = workspace.collect_artifacts();

        let summary = usage.lock().map(|u| *u).unwrap_or_default();

        Ok(BackendOutcome {
            success: parsed.success,
            output: ExecutionOutput {
                value: parsed.value,
                output: output_lines,
                exit_code,
                artifacts: collected.artifacts,
                artifacts_truncated: collected.truncated,
            },
            error: parsed.error,
            usage: ResourceUsage {
                execution_time_ms: elapsed.as_millis() as u64,
                max_memory_mb: summary.peak_memory_mb,
                cpu_percent: summary.last_cpu_percent,
            },
        })
    }
}

#[async_trait]
impl IsolationBackend for ContainerSandbox {
    fn name(&self) -> &'static str {
        "container"
    }

    fn supports(&self, language: &str) -> bool {
        self.profiles.contains(language)
    }

    async fn run(&self, job: SandboxJob, mut cancel: CancelSignal) -> Result<BackendOutcome> {
        let profile = self.profiles.resolve(&job.submission.language)?;
        let workspace = Workspace::stage(&job.submission, profile)?;

        let mut resources = RunResources::new(self.runtime.clone());
        let usage = Arc::new(std::sync::Mutex::new(UsageSummary::default()));

        let result = self
            .drive(&job, &workspace, &mut cancel, &mut resources, &usage)
            .await;

        resources.release().await;
        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.remove() {
            warn!("Failed to remove workspace {}: {}", path.display(), e);
        }
        debug!("Container execution {} cleaned up", job.execution_id);

        result
    }
}

fn spawn_log_forwarder(
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    execution_id: String,
    events: EventSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut logs = runtime.logs(&container_id);
        while let Some(line) = logs.next().await {
            match line {
                Ok(line) => events.log(&execution_id, line.stream, line.message),
                Err(e) => {
                    debug!("Log stream for {} ended: {}", container_id, e);
                    break;
                }
            }
        }
    })
}

fn spawn_stats_poller(
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    execution_id: String,
    events: EventSink,
    interval: Duration,
    usage: Arc<std::sync::Mutex<UsageSummary>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut previous: Option<StatsSample> = None;

        loop {
            ticker.tick().await;
            let sample = match runtime.stats(&container_id).await {
                Ok(Some(sample)) => sample,
                Ok(None) => break,
                Err(e) => {
                    debug!("Stats for {} unavailable: {}", container_id, e);
                    break;
                }
            };

            let cpu = previous
                .as_ref()
                .map(|prev| cpu_percent(prev, &sample))
                .unwrap_or(0.0);
            previous = Some(sample);

            if let Ok(mut summary) = usage.lock() {
                summary.peak_memory_mb = summary.peak_memory_mb.max(sample.memory_mb());
                summary.last_cpu_percent = cpu;
            }
            events.stats(&execution_id, sample.memory_mb(), cpu);
        }
    })
}
