// ABOUTME: Container runtime control plane behind the ContainerRuntime trait
// ABOUTME: Docker implementation via bollard with resource limits, labels, stats, logs, and orphan cleanup

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures_util::stream::{BoxStream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SandboxError};
use crate::types::{LogStream, ResourceLimits};

/// Labels applied to all runbox containers for tracking
pub const RUNBOX_LABEL: &str = "runbox.managed";
pub const RUNBOX_EXECUTION_LABEL: &str = "runbox.execution_id";

/// Mount point of the execution workspace inside the container
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// CFS period used for CPU quotas (100ms)
const CPU_PERIOD: i64 = 100_000;

/// CPU share applied when a tool does not set one
pub const DEFAULT_CPU_PERCENT: u8 = 50;

const PIDS_LIMIT: i64 = 256;

/// Grace period for `docker stop` before SIGKILL
const STOP_TIMEOUT_SECS: i64 = 2;

/// Everything needed to create one execution container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub execution_id: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory bind-mounted read-write at `/workspace`
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
}

/// Raw counters from one stats sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSample {
    pub memory_bytes: u64,
    pub cpu_total: u64,
    pub system_total: u64,
    pub online_cpus: u64,
}

impl StatsSample {
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / 1024 / 1024
    }
}

/// CPU percent between two consecutive samples, scaled by online CPUs
pub fn cpu_percent(previous: &StatsSample, current: &StatsSample) -> f64 {
    let cpu_delta = current.cpu_total.saturating_sub(previous.cpu_total) as f64;
    let system_delta = current.system_total.saturating_sub(previous.system_total) as f64;

    if system_delta <= 0.0 || cpu_delta <= 0.0 {
        return 0.0;
    }

    (cpu_delta / system_delta) * current.online_cpus.max(1) as f64 * 100.0
}

/// One line of container output
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub stream: LogStream,
    pub message: String,
}

/// Container lifecycle operations used by the container tier
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container. Pulls the image if missing.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Wait for exit. `None` means the exit code is unknown (container already gone).
    async fn wait(&self, container_id: &str) -> Result<Option<i64>>;

    /// Stop a running container. Already stopped or removed is not an error.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Force-remove a container. Already removed is not an error.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// One stats sample, `None` once the container is gone
    async fn stats(&self, container_id: &str) -> Result<Option<StatsSample>>;

    /// Follow stdout/stderr until the container exits
    fn logs(&self, container_id: &str) -> BoxStream<'static, Result<LogLine>>;
}

/// Docker implementation of [`ContainerRuntime`]
#[derive(Clone)]
pub struct ContainerManager {
    docker: Docker,
}

impl ContainerManager {
    /// Connect to the local Docker daemon
    pub async fn new() -> Result<Self> {
        let docker = Self::connect_docker().await?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to Docker daemon
    ///
    /// On Unix: /var/run/docker.sock
    /// On Windows: npipe:////./pipe/docker_engine
    async fn connect_docker() -> Result<Docker> {
        #[cfg(unix)]
        let docker = Docker::connect_with_socket_defaults()?;

        #[cfg(windows)]
        let docker = Docker::connect_with_named_pipe_defaults()?;

        docker.ping().await.map_err(|e| {
            error!("Failed to connect to Docker daemon: {}", e);
            SandboxError::Docker(e)
        })?;

        info!("Successfully connected to Docker daemon");
        Ok(docker)
    }

    /// Build the host configuration enforcing the resource envelope
    pub fn host_config(spec: &ContainerSpec) -> HostConfig {
        let limits = &spec.limits;
        let memory = limits
            .memory_mb()
            .checked_mul(1024 * 1024)
            .and_then(|bytes| i64::try_from(bytes).ok())
            .unwrap_or(i64::MAX);
        let cpu_percent = limits.max_cpu_percent.unwrap_or(DEFAULT_CPU_PERCENT) as i64;

        let mut binds = vec![format!("{}:{}:rw", spec.workspace.display(), WORKSPACE_MOUNT)];
        binds.extend(
            limits
                .file_system_access
                .iter()
                .map(|path| format!("{}:{}:ro", path, path)),
        );

        HostConfig {
            memory: Some(memory),
            // Equal to memory: no swap beyond the memory ceiling
            memory_swap: Some(memory),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some(CPU_PERIOD * cpu_percent / 100),
            network_mode: Some(if limits.network_access { "bridge" } else { "none" }.to_string()),
            auto_remove: Some(true),
            binds: Some(binds),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            pids_limit: Some(PIDS_LIMIT),
            ..Default::default()
        }
    }

    fn create_labels(execution_id: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(RUNBOX_LABEL.to_string(), "true".to_string());
        labels.insert(RUNBOX_EXECUTION_LABEL.to_string(), execution_id.to_string());
        labels
    }

    /// Ensure the image exists locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(|e| {
                SandboxError::ContainerCreateFailed(format!("failed to pull {}: {}", image, e))
            })?;
            if let Some(status) = progress.status {
                debug!("Pull {}: {}", image, status);
            }
        }

        info!("Pulled image {}", image);
        Ok(())
    }

    /// IDs of runbox containers, optionally narrowed to one execution
    pub async fn list_containers(&self, execution_id: Option<&str>) -> Result<Vec<String>> {
        let label = match execution_id {
            Some(id) => format!("{}={}", RUNBOX_EXECUTION_LABEL, id),
            None => format!("{}=true", RUNBOX_LABEL),
        };
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    /// Force-remove every container carrying the runbox label.
    ///
    /// Used at startup to clean up after a host process that died mid-execution.
    pub async fn remove_orphaned_containers(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();

        for id in self.list_containers(None).await? {
            match self.remove(&id).await {
                Ok(()) => removed.push(id),
                Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
            }
        }

        info!("Removed {} orphaned containers", removed.len());
        Ok(removed)
    }

    fn parse_stats(stats: &Stats) -> StatsSample {
        let cpu = &stats.cpu_stats;
        let online_cpus = cpu.online_cpus.unwrap_or_else(|| {
            cpu.cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u64)
                .unwrap_or(1)
        });

        StatsSample {
            memory_bytes: stats.memory_stats.usage.unwrap_or(0),
            cpu_total: cpu.cpu_usage.total_usage,
            system_total: cpu.system_cpu_usage.unwrap_or(0),
            online_cpus,
        }
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl ContainerRuntime for ContainerManager {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        debug!(
            "Creating container for execution {} with image {}",
            spec.execution_id, spec.image
        );

        self.ensure_image(&spec.image).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            host_config: Some(Self::host_config(spec)),
            labels: Some(Self::create_labels(&spec.execution_id)),
            network_disabled: Some(!spec.limits.network_access),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("runbox-{}", spec.execution_id),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                error!("Failed to create container: {}", e);
                SandboxError::ContainerCreateFailed(e.to_string())
            })?;

        info!(
            "Created container {} for execution {}",
            response.id, spec.execution_id
        );
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                error!("Failed to start container {}: {}", container_id, e);
                SandboxError::ContainerStartFailed(e.to_string())
            })?;

        debug!("Started container {}", container_id);
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> Result<Option<i64>> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) if is_status(&e, 404) => {
                debug!("Container {} gone before wait returned", container_id);
                Ok(None)
            }
            Some(Err(e)) => Err(SandboxError::Docker(e)),
            None => Ok(None),
        }
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };

        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => {
                debug!("Stopped container {}", container_id);
                Ok(())
            }
            Err(e) if is_status(&e, 304) || is_status(&e, 404) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to stop container {}: {}", container_id, e);
                Err(SandboxError::Docker(e))
            }
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => {
                debug!("Removed container {}", container_id);
                Ok(())
            }
            // 409: removal already in progress via auto-remove
            Err(e) if is_status(&e, 404) || is_status(&e, 409) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to remove container {}: {}", container_id, e);
                Err(SandboxError::Docker(e))
            }
        }
    }

    async fn stats(&self, container_id: &str) -> Result<Option<StatsSample>> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.docker.stats(container_id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(Some(Self::parse_stats(&stats))),
            Some(Err(e)) if is_status(&e, 404) => Ok(None),
            Some(Err(e)) => Err(SandboxError::Docker(e)),
            None => Ok(None),
        }
    }

    fn logs(&self, container_id: &str) -> BoxStream<'static, Result<LogLine>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(container_id, Some(options))
            .map(|chunk| {
                let chunk = chunk?;
                let (stream, bytes) = match chunk {
                    LogOutput::StdErr { message } => (LogStream::Stderr, message),
                    LogOutput::StdOut { message }
                    | LogOutput::Console { message }
                    | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                };
                Ok(LogLine {
                    stream,
                    message: String::from_utf8_lossy(&bytes).trim_end().to_string(),
                })
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(limits: ResourceLimits) -> ContainerSpec {
        ContainerSpec {
            execution_id: "exec-1".to_string(),
            image: "alpine:3.20".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
            workspace: PathBuf::from("/tmp/ws"),
            limits,
        }
    }

    #[test]
    fn test_host_config_defaults() {
        let config = ContainerManager::host_config(&spec(ResourceLimits {
            max_memory_mb: Some(128),
            ..Default::default()
        }));

        assert_eq!(config.memory, Some(128 * 1024 * 1024));
        assert_eq!(config.memory_swap, config.memory);
        assert_eq!(config.cpu_quota, Some(50_000));
        assert_eq!(config.cpu_period, Some(100_000));
        assert_eq!(config.network_mode.as_deref(), Some("none"));
        assert_eq!(config.auto_remove, Some(true));
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(config.binds, Some(vec!["/tmp/ws:/workspace:rw".to_string()]));
    }

    #[test]
    fn test_host_config_network_cpu_and_allowlist() {
        let config = ContainerManager::host_config(&spec(ResourceLimits {
            max_cpu_percent: Some(25),
            network_access: true,
            file_system_access: vec!["/data/shared".to_string()],
            ..Default::default()
        }));

        assert_eq!(config.cpu_quota, Some(25_000));
        assert_eq!(config.network_mode.as_deref(), Some("bridge"));
        assert_eq!(
            config.binds,
            Some(vec![
                "/tmp/ws:/workspace:rw".to_string(),
                "/data/shared:/data/shared:ro".to_string(),
            ])
        );
    }

    #[test]
    fn test_host_config_memory_does_not_overflow() {
        let config = ContainerManager::host_config(&spec(ResourceLimits {
            max_memory_mb: Some(u64::MAX),
            ..Default::default()
        }));
        assert_eq!(config.memory, Some(i64::MAX));

        let config = ContainerManager::host_config(&spec(ResourceLimits {
            max_memory_mb: Some(crate::types::MAX_MEMORY_MB),
            ..Default::default()
        }));
        assert_eq!(config.memory, Some(1 << 40));
    }

    #[test]
    fn test_cpu_percent_from_consecutive_samples() {
        let previous = StatsSample {
            memory_bytes: 0,
            cpu_total: 1_000,
            system_total: 10_000,
            online_cpus: 2,
        };
        let current = StatsSample {
            memory_bytes: 64 * 1024 * 1024,
            cpu_total: 1_500,
            system_total: 20_000,
            online_cpus: 2,
        };

        assert!((cpu_percent(&previous, &current) - 10.0).abs() < f64::EPSILON);
        assert_eq!(current.memory_mb(), 64);
        assert_eq!(cpu_percent(&current, &current), 0.0);
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_connect_docker() {
        let result = ContainerManager::connect_docker().await;
        assert!(result.is_ok(), "Failed to connect to Docker: {:?}", result);
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_remove_missing_container_is_ok() {
        let manager = ContainerManager::new().await.unwrap();
        manager.remove("runbox-does-not-exist").await.unwrap();
        manager.stop("runbox-does-not-exist").await.unwrap();
    }
}
