//! Hierarchical configuration loading.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;

use crate::domain::models::Severity;
use crate::infrastructure::config::model::Config;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.gator/config.yaml` (project config)
    /// 3. `GATOR_CFG_*` environment variables
    ///
    /// The `GATOR_CFG_` prefix keeps config overrides apart from the
    /// `GATOR_PARENT`/`GATOR_IDENT` variables the runtime itself injects.
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".gator/config.yaml"))
            .merge(Env::prefixed("GATOR_CFG_").split("__"))
            .extract()
            .context("failed to assemble configuration")?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from an explicit file, for `--config`.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("GATOR_CFG_").split("__"))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<()> {
        if config.tracking_dir.is_empty() {
            anyhow::bail!("tracking_dir cannot be empty");
        }
        if config.intervals.sample_secs == 0 || config.intervals.update_secs == 0 {
            anyhow::bail!("intervals must be positive");
        }
        if config.timeouts.connect_attempts == 0 {
            anyhow::bail!("connect_attempts cannot be zero");
        }
        if config.timeouts.connect_initial_ms > config.timeouts.connect_cap_ms {
            anyhow::bail!(
                "connect_initial_ms ({}) must not exceed connect_cap_ms ({})",
                config.timeouts.connect_initial_ms,
                config.timeouts.connect_cap_ms
            );
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            anyhow::bail!("invalid log level '{}'", config.logging.level);
        }
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            anyhow::bail!("invalid log format '{}'", config.logging.format);
        }
        if Severity::from_str(&config.console.severity).is_none() {
            anyhow::bail!("invalid console severity '{}'", config.console.severity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_bad_severity_rejected() {
        let mut config = Config::default();
        config.console.severity = "loud".to_string();
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_bad_backoff_rejected() {
        let mut config = Config::default();
        config.timeouts.connect_initial_ms = 10_000;
        config.timeouts.connect_cap_ms = 1_000;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "intervals:\n  sample_secs: 2\nconsole:\n  severity: DEBUG\n")
            .unwrap();
        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.intervals.sample_secs, 2);
        assert_eq!(config.console.severity, "DEBUG");
        // Untouched sections keep their defaults.
        assert_eq!(config.intervals.update_secs, 10);
    }
}
