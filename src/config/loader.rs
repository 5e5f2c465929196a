//! Configuration Loader
//!
//! Layers a configuration file and `RA__`-prefixed environment variables with the
//! `config` crate, then validates the result. Nested keys use `__` as separator, e.g.
//! `RA__JOB_QUEUE__WORKER_COUNT=8`.

use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::ReconfigurationAgentConfig;

const ENV_PREFIX: &str = "RA";
const ENV_SEPARATOR: &str = "__";

/// Validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: ReconfigurationAgentConfig,
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `path` (YAML, TOML or JSON by extension) with
    /// environment overrides.
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigurationError::config_file_not_found(
                path.display().to_string(),
            ));
        }

        debug!(path = %path.display(), "Loading reconfiguration agent configuration");

        let config: ReconfigurationAgentConfig = Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| ConfigurationError::parse_error(path.display().to_string(), e))?;

        config.validate()?;

        info!(
            path = %path.display(),
            workers = config.job_queue.worker_count,
            max_queue_size = config.job_queue.max_queue_size,
            "🔧 CONFIG: Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            source_path: Some(path.to_path_buf()),
        }))
    }

    /// Wrap an explicitly constructed configuration after validating it
    pub fn from_config(config: ReconfigurationAgentConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            source_path: None,
        }))
    }

    pub fn config(&self) -> &ReconfigurationAgentConfig {
        &self.config
    }

    /// File the configuration was loaded from, if any
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let result = ConfigManager::load_from_file(dir.path().join("absent.yaml"));
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.yaml");
        fs::write(
            &path,
            "job_queue:\n  worker_count: 2\nstaleness:\n  entry_keep_duration_seconds: 30\n",
        )
        .unwrap();

        let manager = ConfigManager::load_from_file(&path).unwrap();
        let config = manager.config();
        assert_eq!(config.job_queue.worker_count, 2);
        assert_eq!(config.job_queue.max_queue_size, 10_000);
        assert_eq!(config.staleness.entry_keep_duration_seconds, 30);
        assert_eq!(config.retryable_errors.replica_open.drop_threshold, 40);
        assert_eq!(manager.source_path(), Some(path.as_path()));
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = ReconfigurationAgentConfig::default();
        config.job_queue.max_queue_size = 0;
        assert!(ConfigManager::from_config(config).is_err());
        assert!(ConfigManager::from_config(ReconfigurationAgentConfig::default()).is_ok());
    }
}
