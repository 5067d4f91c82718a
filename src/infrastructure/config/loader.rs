//! Hierarchical configuration loading.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Knowledge base path cannot be empty")]
    EmptyKnowledgeBasePath,

    #[error("Backup root cannot be empty")]
    EmptyBackupRoot,

    #[error("Invalid max_batch_size: {0}. Must be at least 1")]
    InvalidMaxBatchSize(usize),

    #[error("Invalid max_attempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error("Invalid confidence_threshold: {0}. Must be within [0, 1]")]
    InvalidConfidenceThreshold(f64),

    #[error("Invalid collection window: {0}s. Must be at least 1")]
    InvalidCollectionWindow(u64),

    #[error("Webhook secret must be set when webhook_port is configured with repositories")]
    MissingWebhookSecret,

    #[error("Project '{project}' monitor URL cannot be empty")]
    EmptyMonitorUrl { project: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.vigil/config.yaml`
    /// 3. `.vigil/local.yaml` (optional local overrides)
    /// 4. Environment variables (`VIGIL_*` prefix, `__` nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".vigil/config.yaml"))
            .merge(Yaml::file(".vigil/local.yaml"))
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.knowledge_base.path.is_empty() {
            return Err(ConfigError::EmptyKnowledgeBasePath);
        }
        if config.backup.root.is_empty() {
            return Err(ConfigError::EmptyBackupRoot);
        }

        let auto = &config.auto_remediation;
        if auto.max_batch_size == 0 {
            return Err(ConfigError::InvalidMaxBatchSize(auto.max_batch_size));
        }
        if auto.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(auto.max_attempts));
        }
        if !(0.0..=1.0).contains(&auto.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                auto.confidence_threshold,
            ));
        }
        if auto.collection_window_seconds == 0 {
            return Err(ConfigError::InvalidCollectionWindow(
                auto.collection_window_seconds,
            ));
        }

        if !config.github.repositories.is_empty() && config.github.webhook_secret.is_empty() {
            return Err(ConfigError::MissingWebhookSecret);
        }

        for (name, project) in &config.projects {
            if let Some(monitor) = &project.monitor {
                if monitor.url.is_empty() {
                    return Err(ConfigError::EmptyMonitorUrl {
                        project: name.clone(),
                    });
                }
            }
        }

        for provider in &config.ai.providers {
            if provider.model.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "provider '{}' model cannot be empty",
                    provider.kind
                )));
            }
        }

        Ok(())
    }
}
