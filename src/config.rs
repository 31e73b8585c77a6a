//! Orchestrator configuration: defaults, TOML files and environment overrides.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::failure::DEFAULT_FAILURE_LIMIT;

/// Environment variable naming a configuration file.
pub const CONFIG_PATH_ENV: &str = "INDEX_ORCHESTRATOR_CONFIG";

/// Largest accepted lane capacity.
pub const MAX_QUEUE_SIZE: usize = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of bounded lanes; a queuing key always maps to the same lane.
    pub queue_count: usize,

    /// Capacity of each lane.
    pub queue_size: usize,

    /// Maximum number of items applied between two commit decisions.
    pub batch_size: usize,

    /// Minimum time between two deferred commits (0 = commit after every batch).
    pub commit_interval_ms: u64,

    /// Minimum time between two deferred refreshes (0 = refresh after every batch).
    pub refresh_interval_ms: u64,

    /// Failures retained in detail by the orchestrator's failure collector.
    pub failure_limit: usize,

    /// How long `stop` waits for queued work (0 = no limit).
    pub drain_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_count: 1,
            queue_size: 1000,
            batch_size: 100,
            commit_interval_ms: 0,
            refresh_interval_ms: 0,
            failure_limit: DEFAULT_FAILURE_LIMIT,
            drain_timeout_ms: 0,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `INDEX_ORCHESTRATOR_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overwrites each field whose `INDEX_ORCHESTRATOR_*` variable is set,
    /// including to its default value.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = parse_env::<usize>("INDEX_ORCHESTRATOR_QUEUE_COUNT")? {
            self.queue_count = value;
        }
        if let Some(value) = parse_env::<usize>("INDEX_ORCHESTRATOR_QUEUE_SIZE")? {
            self.queue_size = value;
        }
        if let Some(value) = parse_env::<usize>("INDEX_ORCHESTRATOR_BATCH_SIZE")? {
            self.batch_size = value;
        }
        if let Some(value) = parse_env::<u64>("INDEX_ORCHESTRATOR_COMMIT_INTERVAL_MS")? {
            self.commit_interval_ms = value;
        }
        if let Some(value) = parse_env::<u64>("INDEX_ORCHESTRATOR_REFRESH_INTERVAL_MS")? {
            self.refresh_interval_ms = value;
        }
        if let Some(value) = parse_env::<usize>("INDEX_ORCHESTRATOR_FAILURE_LIMIT")? {
            self.failure_limit = value;
        }
        if let Some(value) = parse_env::<u64>("INDEX_ORCHESTRATOR_DRAIN_TIMEOUT_MS")? {
            self.drain_timeout_ms = value;
        }

        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Self =
            toml::from_str(&content).context("Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with priority: file -> env -> defaults
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        let config_paths = [
            std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from),
            dirs::config_dir().map(|d| d.join("index-orchestrator").join("orchestrator.toml")),
        ];

        for config_path in config_paths.into_iter().flatten() {
            if config_path.exists() {
                info!("Loading orchestrator configuration from {:?}", config_path);
                config = Self::from_file(&config_path)
                    .with_context(|| format!("Failed to load config from {config_path:?}"))?;
                break;
            }
        }

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Takes every field of `other` that differs from the default.
    ///
    /// A field of `other` left at its default value never overrides `self`.
    /// `load` applies environment variables directly so they can restore one.
    pub fn merge_with(&mut self, other: Self) {
        macro_rules! merge_field {
            ($field:ident) => {
                if other.$field != Self::default().$field {
                    self.$field = other.$field;
                }
            };
        }

        merge_field!(queue_count);
        merge_field!(queue_size);
        merge_field!(batch_size);
        merge_field!(commit_interval_ms);
        merge_field!(refresh_interval_ms);
        merge_field!(failure_limit);
        merge_field!(drain_timeout_ms);
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_count == 0 {
            return Err(anyhow!("queue_count must be greater than 0"));
        }
        if self.queue_count > 1024 {
            return Err(anyhow!("queue_count should not exceed 1024, got {}", self.queue_count));
        }
        if self.queue_size == 0 {
            return Err(anyhow!("queue_size must be greater than 0"));
        }
        if self.queue_size > MAX_QUEUE_SIZE {
            return Err(anyhow!(
                "queue_size should not exceed {MAX_QUEUE_SIZE}, got {}",
                self.queue_size
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be greater than 0"));
        }
        if self.failure_limit == 0 {
            return Err(anyhow!("failure_limit must be greater than 0"));
        }
        let capacity = self.queue_size.saturating_mul(self.queue_count);
        if self.batch_size > capacity {
            warn!(
                "batch_size ({}) exceeds total queue capacity ({}), batches will never fill",
                self.batch_size, capacity
            );
        }

        debug!("Orchestrator configuration validation passed");
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn parse_env<T>(var_name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {var_name}: {value}")),
        Err(_) => Ok(None),
    }
}
