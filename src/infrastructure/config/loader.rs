use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;
use crate::domain::models::TaskType;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid pool_size: {size}. Must be between {min} and {max}")]
    InvalidPoolSize { size: usize, min: usize, max: usize },

    #[error("Invalid pool bounds: min_pool_size ({0}) must be at least 1 and at most max_pool_size ({1})")]
    InvalidPoolBounds(usize, usize),

    #[error("Queue max_size cannot be 0")]
    ZeroQueueSize,

    #[error("Lease duration cannot be 0")]
    ZeroLeaseDuration,

    #[error("Invalid max attempts for {0}: cannot be 0")]
    InvalidMaxAttempts(String),

    #[error("Invalid k_factor: {0}. Must be positive and finite")]
    InvalidKFactor(f64),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Checkpoint path cannot be empty")]
    EmptyCheckpointPath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid sampling weight for {0}: {1}")]
    InvalidSamplingWeight(String, f64),

    #[error("Sampling weights must not all be zero")]
    ZeroSamplingWeights,

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .cosci/config.yaml (project config)
    /// 3. .cosci/local.yaml (local overrides, optional)
    /// 4. Environment variables (COSCI_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".cosci/config.yaml"))
            .merge(Yaml::file(".cosci/local.yaml"))
            .merge(Env::prefixed("COSCI_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let workers = &config.workers;
        if workers.min_pool_size == 0 || workers.min_pool_size > workers.max_pool_size {
            return Err(ConfigError::InvalidPoolBounds(
                workers.min_pool_size,
                workers.max_pool_size,
            ));
        }
        if workers.pool_size == 0
            || !(workers.min_pool_size..=workers.max_pool_size).contains(&workers.pool_size)
        {
            return Err(ConfigError::InvalidPoolSize {
                size: workers.pool_size,
                min: workers.min_pool_size,
                max: workers.max_pool_size,
            });
        }

        if config.queue.max_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if config.queue.lease_duration_secs == 0 {
            return Err(ConfigError::ZeroLeaseDuration);
        }
        if !config.queue.aging_per_minute.is_finite() || config.queue.aging_per_minute < 0.0 {
            return Err(ConfigError::ValidationFailed(format!(
                "aging_per_minute must be a non-negative number, got {}",
                config.queue.aging_per_minute
            )));
        }

        let retry = &config.retry;
        if retry.default_max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts("default".to_string()));
        }
        if let Some((task_type, _)) = retry.max_attempts.iter().find(|(_, n)| **n == 0) {
            return Err(ConfigError::InvalidMaxAttempts(task_type.to_string()));
        }
        if retry.storage_initial_backoff_ms >= retry.storage_max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                retry.storage_initial_backoff_ms,
                retry.storage_max_backoff_ms,
            ));
        }

        let k = config.tournament.k_factor;
        if !k.is_finite() || k <= 0.0 {
            return Err(ConfigError::InvalidKFactor(k));
        }
        if config.tournament.match_priority > 10 {
            return Err(ConfigError::ValidationFailed(format!(
                "match_priority {} is outside 0-10",
                config.tournament.match_priority
            )));
        }

        Self::validate_supervisor(config)?;

        if config.storage.database_path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.storage.checkpoint_path.is_empty() {
            return Err(ConfigError::EmptyCheckpointPath);
        }
        if config.storage.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.storage.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }

    fn validate_supervisor(config: &Config) -> Result<(), ConfigError> {
        let supervisor = &config.supervisor;
        if supervisor.statistics_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "statistics_interval_secs cannot be 0".to_string(),
            ));
        }
        if supervisor.convergence.window == 0 {
            return Err(ConfigError::ValidationFailed(
                "convergence window cannot be 0".to_string(),
            ));
        }
        if supervisor.convergence.top_n == 0 {
            return Err(ConfigError::ValidationFailed(
                "convergence top_n cannot be 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&supervisor.converging_batch_fraction) {
            return Err(ConfigError::ValidationFailed(format!(
                "converging_batch_fraction {} is outside 0-1",
                supervisor.converging_batch_fraction
            )));
        }

        for (task_type, weight) in &supervisor.sampling_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::InvalidSamplingWeight(
                    task_type.to_string(),
                    *weight,
                ));
            }
        }
        let total: f64 = supervisor
            .sampling_weights
            .iter()
            .filter(|(t, _)| **t != TaskType::RankMatch)
            .map(|(_, w)| w)
            .sum();
        if total <= 0.0 {
            return Err(ConfigError::ZeroSamplingWeights);
        }
        Ok(())
    }
}
