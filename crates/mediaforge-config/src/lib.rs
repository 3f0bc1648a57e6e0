//! # Mediaforge Config
//!
//! Unified single-file configuration for the orchestration core. A single
//! `mediaforge.yaml` configures the engine, resource pool, store paths,
//! checkpointing and observability.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use mediaforge_core::workspace::ReconcileMode;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Per-project worker cap.
    #[serde(default = "default_max_concurrent_stages")]
    pub max_concurrent_stages: usize,
    #[serde(default = "default_stage_timeout")]
    pub default_stage_timeout_seconds: u64,
    /// Exponential-backoff base between retry attempts.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_seconds: f64,
    #[serde(default = "default_true")]
    pub retry_exponential_backoff: bool,
    /// Initial capacity per resource name.
    #[serde(default)]
    pub resource_pool: BTreeMap<String, u32>,
    /// 0 disables the periodic checkpoint timer.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_seconds: u64,
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention_count: usize,
    #[serde(default)]
    pub project_byte_quota: Option<u64>,
    #[serde(default)]
    pub reconcile_mode: ReconcileMode,
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: default_max_concurrent_stages(),
            default_stage_timeout_seconds: default_stage_timeout(),
            retry_base_delay_seconds: default_retry_base_delay(),
            retry_exponential_backoff: true,
            resource_pool: BTreeMap::new(),
            checkpoint_interval_seconds: default_checkpoint_interval(),
            checkpoint_retention_count: default_checkpoint_retention(),
            project_byte_quota: None,
            reconcile_mode: ReconcileMode::default(),
            projects_root: default_projects_root(),
            store_path: default_store_path(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn default_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stage_timeout_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_seconds)
    }

    /// None when the periodic checkpoint timer is disabled.
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_seconds > 0)
            .then(|| Duration::from_secs(self.checkpoint_interval_seconds))
    }
}

fn default_max_concurrent_stages() -> usize {
    4
}

fn default_stage_timeout() -> u64 {
    300
}

fn default_retry_base_delay() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_interval() -> u64 {
    60
}

fn default_checkpoint_retention() -> usize {
    10
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("projects")
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/mediaforge.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load pipeline configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: PipelineConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_stages == 0 {
        return Err(ConfigError::Invalid(
            "max_concurrent_stages must be > 0".to_string(),
        ));
    }
    if config.default_stage_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "default_stage_timeout_seconds must be > 0".to_string(),
        ));
    }
    if config.retry_base_delay_seconds < 0.0 {
        return Err(ConfigError::Invalid(
            "retry_base_delay_seconds must not be negative".to_string(),
        ));
    }
    if config.checkpoint_retention_count == 0 {
        return Err(ConfigError::Invalid(
            "checkpoint_retention_count must be > 0".to_string(),
        ));
    }
    for (name, capacity) in &config.resource_pool {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "resource_pool contains an empty resource name".to_string(),
            ));
        }
        if *capacity == 0 {
            return Err(ConfigError::Invalid(format!(
                "resource_pool capacity for '{name}' must be > 0"
            )));
        }
    }
    Ok(())
}
