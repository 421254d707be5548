//! Configuration loader with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::RuntimeConfig;

/// Validation failures surfaced with the offending value.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid soft_threshold: {0}. Must be in [0, 1]")]
    InvalidSoftThreshold(f64),

    #[error("Invalid intent_threshold: {0}. Must be in [0, 1]")]
    InvalidIntentThreshold(f64),

    #[error("Invalid max_iterations: {0}. Must be at least 1")]
    InvalidMaxIterations(u32),

    #[error("Invalid swarm.max_concurrency: {0}. Must be between 1 and 64")]
    InvalidMaxConcurrency(usize),

    #[error("Invalid quality_threshold: {0}. Must be in [0, 5]")]
    InvalidQualityThreshold(f64),

    #[error(
        "Invalid swarm budget: orchestrator reserve ({reserve}) must be below the total ({total})"
    )]
    InvalidSwarmBudget { reserve: u64, total: u64 },

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error(
        "Invalid resource thresholds: warn ({warn}) must be below critical ({critical}), both in (0, 1]"
    )]
    InvalidResourceThresholds { warn: f64, critical: f64 },
}

/// Loads `RuntimeConfig` with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration. Precedence (lowest to highest):
    ///
    /// 1. Programmatic defaults
    /// 2. `.overlord/config.yaml` (project config)
    /// 3. `.overlord/local.yaml` (local overrides, optional)
    /// 4. `OVERLORD_*` environment variables (`__` separates nesting)
    pub fn load() -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(".overlord/config.yaml"))
            .merge(Yaml::file(".overlord/local.yaml"))
            .merge(Env::prefixed("OVERLORD_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from a single file over the defaults.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &RuntimeConfig) -> Result<(), ConfigError> {
        let budget = &config.budget;
        if !(0.0..=1.0).contains(&budget.soft_threshold) {
            return Err(ConfigError::InvalidSoftThreshold(budget.soft_threshold));
        }
        if budget.max_iterations == 0 {
            return Err(ConfigError::InvalidMaxIterations(budget.max_iterations));
        }

        let policy = &config.policy;
        if !(0.0..=1.0).contains(&policy.intent_threshold) {
            return Err(ConfigError::InvalidIntentThreshold(policy.intent_threshold));
        }

        let swarm = &config.swarm;
        if swarm.max_concurrency == 0 || swarm.max_concurrency > 64 {
            return Err(ConfigError::InvalidMaxConcurrency(swarm.max_concurrency));
        }
        if !(0.0..=5.0).contains(&swarm.quality_threshold) {
            return Err(ConfigError::InvalidQualityThreshold(swarm.quality_threshold));
        }
        if swarm.orchestrator_reserve_tokens >= swarm.total_token_budget {
            return Err(ConfigError::InvalidSwarmBudget {
                reserve: swarm.orchestrator_reserve_tokens,
                total: swarm.total_token_budget,
            });
        }

        if !matches!(config.log.level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::InvalidLogLevel(config.log.level.clone()));
        }

        let resources = &config.resources;
        if resources.warn_threshold >= resources.critical_threshold
            || resources.warn_threshold <= 0.0
            || resources.critical_threshold > 1.0
        {
            return Err(ConfigError::InvalidResourceThresholds {
                warn: resources.warn_threshold,
                critical: resources.critical_threshold,
            });
        }

        Ok(())
    }
}
