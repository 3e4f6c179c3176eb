use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Snapshot format; bump only together with a migration story
pub const SNAPSHOT_VERSION: u32 = 0;
pub const DEFAULT_WRITE_THRESHOLD: usize = 1; // rewrite after every persistent mutation
pub const DEFAULT_POOL_SIZE: usize = 16;
pub const BIND_TIMEOUT_MS: u64 = 18_000;
pub const OP_TIMEOUT_MS: u64 = 8_000; // start/stop acknowledgement
pub const EXECUTING_TIMESLICE_MS: u64 = 10 * 60 * 1000;
pub const MIN_PERIOD_MS: u64 = 15 * 60 * 1000;
pub const MIN_FLEX_MS: u64 = 5 * 60 * 1000;
pub const MAX_BACKOFF_MS: u64 = 5 * 60 * 60 * 1000;

/// Top-level config (jobhost.toml + JOBHOST_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobHostConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Snapshot file. Its directory is created on first write.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Persistent mutations accumulated before a snapshot rewrite is queued.
    #[serde(default = "default_write_threshold")]
    pub write_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            write_threshold: DEFAULT_WRITE_THRESHOLD,
        }
    }
}

/// Execution context pool sizing and per-phase deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_bind_timeout")]
    pub bind_timeout_ms: u64,
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_timeslice")]
    pub timeslice_ms: u64,
}

impl ExecutionConfig {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            bind_timeout_ms: BIND_TIMEOUT_MS,
            op_timeout_ms: OP_TIMEOUT_MS,
            timeslice_ms: EXECUTING_TIMESLICE_MS,
        }
    }
}

/// Bounds applied to submitted timing and retry parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_min_period")]
    pub min_period_ms: u64,
    #[serde(default = "default_min_flex")]
    pub min_flex_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_period_ms: MIN_PERIOD_MS,
            min_flex_ms: MIN_FLEX_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

fn default_store_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobhost/jobs.json", home)
}
fn default_write_threshold() -> usize {
    DEFAULT_WRITE_THRESHOLD
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_bind_timeout() -> u64 {
    BIND_TIMEOUT_MS
}
fn default_op_timeout() -> u64 {
    OP_TIMEOUT_MS
}
fn default_timeslice() -> u64 {
    EXECUTING_TIMESLICE_MS
}
fn default_min_period() -> u64 {
    MIN_PERIOD_MS
}
fn default_min_flex() -> u64 {
    MIN_FLEX_MS
}
fn default_max_backoff() -> u64 {
    MAX_BACKOFF_MS
}

impl JobHostConfig {
    /// Load config from a TOML file with JOBHOST_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.jobhost/jobhost.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobHostConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBHOST_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        if config.execution.pool_size == 0 {
            return Err(crate::error::CoreError::Config(
                "execution.pool_size must be at least 1".to_string(),
            ));
        }
        tracing::debug!(path = %path, "config loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobhost/jobhost.toml", home)
}
