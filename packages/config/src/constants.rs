// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Runbox

// Resource Limit Defaults
pub const RUNBOX_DEFAULT_MAX_EXECUTION_MS: &str = "RUNBOX_DEFAULT_MAX_EXECUTION_MS";
pub const RUNBOX_DEFAULT_MAX_MEMORY_MB: &str = "RUNBOX_DEFAULT_MAX_MEMORY_MB";

// Container Isolation Tier
pub const RUNBOX_CONTAINER_SANDBOX_ENABLED: &str = "RUNBOX_CONTAINER_SANDBOX_ENABLED";
pub const RUNBOX_LANGUAGE_PROFILES: &str = "RUNBOX_LANGUAGE_PROFILES";
pub const RUNBOX_STATS_INTERVAL_MS: &str = "RUNBOX_STATS_INTERVAL_MS";

// Orchestrator
pub const RUNBOX_EVENT_CHANNEL_SIZE: &str = "RUNBOX_EVENT_CHANNEL_SIZE";
pub const RUNBOX_BACKSTOP_GRACE_MS: &str = "RUNBOX_BACKSTOP_GRACE_MS";
pub const RUNBOX_PREPARE_TIMEOUT_MS: &str = "RUNBOX_PREPARE_TIMEOUT_MS";

// Storage
pub const RUNBOX_DATABASE_URL: &str = "RUNBOX_DATABASE_URL";

// Task Pool
pub const RUNBOX_POOL_MIN_WORKERS: &str = "RUNBOX_POOL_MIN_WORKERS";
pub const RUNBOX_POOL_MAX_WORKERS: &str = "RUNBOX_POOL_MAX_WORKERS";
pub const RUNBOX_POOL_IDLE_TIMEOUT_MS: &str = "RUNBOX_POOL_IDLE_TIMEOUT_MS";
pub const RUNBOX_POOL_TASK_TIMEOUT_MS: &str = "RUNBOX_POOL_TASK_TIMEOUT_MS";
pub const RUNBOX_POOL_MAX_TASKS_PER_WORKER: &str = "RUNBOX_POOL_MAX_TASKS_PER_WORKER";
pub const RUNBOX_POOL_MONITOR_INTERVAL_MS: &str = "RUNBOX_POOL_MONITOR_INTERVAL_MS";
pub const RUNBOX_POOL_SHUTDOWN_GRACE_MS: &str = "RUNBOX_POOL_SHUTDOWN_GRACE_MS";

