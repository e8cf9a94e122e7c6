// ABOUTME: Configuration for Runbox
// ABOUTME: Environment variable names plus typed engine and pool settings

pub mod constants;
pub mod settings;

pub use settings::{ConfigError, EngineSettings, PoolSettings};
