// ABOUTME: Typed settings for the execution engine and the task pool
// ABOUTME: Parses environment overrides with range validation and logged fallbacks

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::constants::*;

pub const DEFAULT_MAX_EXECUTION_MS: u64 = 30_000;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 256;
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;
pub const DEFAULT_BACKSTOP_GRACE_MS: u64 = 5_000;
pub const DEFAULT_PREPARE_TIMEOUT_MS: u64 = 300_000;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Pool minimum ({min}) exceeds maximum ({max})")]
    PoolBounds { min: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings for the execution orchestrator and its isolation tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Used whenever a tool omits an explicit time limit
    pub default_max_execution_ms: u64,
    /// Used whenever a tool omits an explicit memory limit
    pub default_max_memory_mb: u64,
    /// Feature flag for the container isolation tier
    pub container_sandbox_enabled: bool,
    /// Optional JSON file extending the bundled language profiles
    pub language_profiles_path: Option<PathBuf>,
    pub stats_interval: Duration,
    pub event_channel_size: usize,
    /// Extra time granted past a tool's limit before the orchestrator gives up on a backend
    pub backstop_grace: Duration,
    /// Longest a backend may spend preparing (image pull, container create)
    /// before its run deadline starts anyway
    pub prepare_timeout: Duration,
    pub database_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_max_execution_ms: DEFAULT_MAX_EXECUTION_MS,
            default_max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            container_sandbox_enabled: false,
            language_profiles_path: None,
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
            backstop_grace: Duration::from_millis(DEFAULT_BACKSTOP_GRACE_MS),
            prepare_timeout: Duration::from_millis(DEFAULT_PREPARE_TIMEOUT_MS),
            database_url: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            default_max_execution_ms: parse_in_range(
                &lookup,
                RUNBOX_DEFAULT_MAX_EXECUTION_MS,
                1..=86_400_000,
                defaults.default_max_execution_ms,
            ),
            default_max_memory_mb: parse_in_range(
                &lookup,
                RUNBOX_DEFAULT_MAX_MEMORY_MB,
                1..=1_048_576,
                defaults.default_max_memory_mb,
            ),
            container_sandbox_enabled: parse_flag(&lookup, RUNBOX_CONTAINER_SANDBOX_ENABLED)?
                .unwrap_or(defaults.container_sandbox_enabled),
            language_profiles_path: lookup(RUNBOX_LANGUAGE_PROFILES)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            stats_interval: Duration::from_millis(parse_in_range(
                &lookup,
                RUNBOX_STATS_INTERVAL_MS,
                100..=60_000,
                DEFAULT_STATS_INTERVAL_MS,
            )),
            event_channel_size: parse_in_range(
                &lookup,
                RUNBOX_EVENT_CHANNEL_SIZE,
                10..=10_000,
                DEFAULT_EVENT_CHANNEL_SIZE,
            ),
            backstop_grace: Duration::from_millis(parse_in_range(
                &lookup,
                RUNBOX_BACKSTOP_GRACE_MS,
                0..=600_000,
                DEFAULT_BACKSTOP_GRACE_MS,
            )),
            prepare_timeout: Duration::from_millis(parse_in_range(
                &lookup,
                RUNBOX_PREPARE_TIMEOUT_MS,
                0..=3_600_000,
                DEFAULT_PREPARE_TIMEOUT_MS,
            )),
            database_url: lookup(RUNBOX_DATABASE_URL).filter(|v| !v.trim().is_empty()),
        })
    }
}

/// Settings for the background task pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub task_timeout: Duration,
    pub max_tasks_per_worker: u64,
    pub monitor_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            idle_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(60),
            max_tasks_per_worker: 100,
            monitor_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let ms = |name: &'static str, range: RangeInclusive<u64>, default: Duration| {
            Duration::from_millis(parse_in_range(&lookup, name, range, default.as_millis() as u64))
        };

        let settings = Self {
            min_workers: parse_in_range(&lookup, RUNBOX_POOL_MIN_WORKERS, 0..=256, defaults.min_workers),
            max_workers: parse_in_range(&lookup, RUNBOX_POOL_MAX_WORKERS, 1..=256, defaults.max_workers),
            idle_timeout: ms(RUNBOX_POOL_IDLE_TIMEOUT_MS, 10..=86_400_000, defaults.idle_timeout),
            task_timeout: ms(RUNBOX_POOL_TASK_TIMEOUT_MS, 10..=86_400_000, defaults.task_timeout),
            max_tasks_per_worker: parse_in_range(
                &lookup,
                RUNBOX_POOL_MAX_TASKS_PER_WORKER,
                1..=u64::MAX,
                defaults.max_tasks_per_worker,
            ),
            monitor_interval: ms(RUNBOX_POOL_MONITOR_INTERVAL_MS, 10..=3_600_000, defaults.monitor_interval),
            shutdown_grace: ms(RUNBOX_POOL_SHUTDOWN_GRACE_MS, 0..=600_000, defaults.shutdown_grace),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_workers > self.max_workers {
            return Err(ConfigError::PoolBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        Ok(())
    }
}

/// Parse a numeric variable, falling back to `default` when it is absent,
/// malformed, or outside `range`
fn parse_in_range<F, T>(lookup: &F, name: &'static str, range: RangeInclusive<T>, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if range.contains(&value) => value,
        Ok(value) => {
            warn!(
                "{} = {} is outside {}..={}, using default {}",
                name,
                value,
                range.start(),
                range.end(),
                default
            );
            default
        }
        Err(_) => {
            warn!("{} = {:?} is not a valid number, using default {}", name, raw, default);
            default
        }
    }
}

/// Parse a boolean flag. Malformed flags are rejected rather than defaulted.
fn parse_flag<F>(lookup: &F, name: &'static str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { name, value: raw }),
        },
    }
}
