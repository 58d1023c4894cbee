//! Runtime configuration for the monitor.
//!
//! The engine itself only ever sees explicit periods and TTLs; this module is
//! where those values come from when running the `sysmon` binary.

use config::{Config, Environment, File, FileFormat};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use typed_builder::TypedBuilder;

/// Default polling period for every subscribed metric, in milliseconds.
pub const DEFAULT_PERIOD_MS: u64 = 1_000;

/// Default lifetime of a cached collection result, in milliseconds.
pub const DEFAULT_CACHE_TTL_MS: u64 = 500;

/// Default number of pending begin notifications an interval correlator retains.
pub const DEFAULT_CORRELATOR_CAPACITY: usize = 50;

/// Prefix for environment overrides (`SYSMON__PERIOD_MS=250`).
pub const ENV_PREFIX: &str = "SYSMON";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_collectors() -> Vec<String> {
    ["cpu", "memory", "network", "process"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct MonitorConfig {
    /// Polling period shared by every subscription the binary creates.
    #[builder(default = DEFAULT_PERIOD_MS)]
    period_ms: u64,
    /// How long a collected snapshot is served from cache.
    #[builder(default = DEFAULT_CACHE_TTL_MS)]
    cache_ttl_ms: u64,
    /// Retention of pending begin notifications per correlator.
    #[builder(default = DEFAULT_CORRELATOR_CAPACITY)]
    correlator_capacity: usize,
    /// Default tracing filter, overridden by `RUST_LOG`.
    #[builder(default = default_log_level())]
    #[serde(default = "default_log_level")]
    log_level: String,
    /// Names of the collectors to enable (`cpu`, `memory`, `network`, `process`).
    #[builder(default = default_collectors())]
    #[serde(default = "default_collectors")]
    collectors: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig::builder().build()
    }
}

impl MonitorConfig {
    /// Load configuration from defaults, then an optional TOML file, then
    /// `SYSMON__*` environment variables, each layer overriding the previous one.
    pub fn load_from_file_and_env(file_path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .set_default("period_ms", DEFAULT_PERIOD_MS as i64)?
            .set_default("cache_ttl_ms", DEFAULT_CACHE_TTL_MS as i64)?
            .set_default("correlator_capacity", DEFAULT_CORRELATOR_CAPACITY as i64)?
            .add_source(File::new(file_path, FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config = settings.try_deserialize::<MonitorConfig>()?;
        config.validate()?;

        debug!(?config, file_path, "Loaded monitor configuration");

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_ms == 0 {
            return Err(ConfigError::Invalid("period_ms must be non-zero".into()));
        }
        if self.cache_ttl_ms == 0 {
            return Err(ConfigError::Invalid("cache_ttl_ms must be non-zero".into()));
        }
        if self.correlator_capacity == 0 {
            return Err(ConfigError::Invalid(
                "correlator_capacity must be non-zero".into(),
            ));
        }

        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = MonitorConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.period(), Duration::from_secs(1));
        assert_eq!(config.cache_ttl(), Duration::from_millis(500));
        assert_eq!(config.collectors().len(), 4);
    }

    #[test]
    fn load_valid_config_from_file() {
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
        period_ms = 250
        cache_ttl_ms = 100
        log_level = "debug"
        collectors = ["cpu", "memory"]
    "#
        )
        .unwrap();
        let config_path = temp_file.path().to_str().unwrap();

        let config = MonitorConfig::load_from_file_and_env(config_path).unwrap();

        assert_eq!(config.period(), Duration::from_millis(250));
        assert_eq!(config.cache_ttl(), Duration::from_millis(100));
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.collectors(), &vec!["cpu".to_string(), "memory".to_string()]);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = MonitorConfig::load_from_file_and_env("does/not/exist.toml").unwrap();

        assert_eq!(*config.period_ms(), DEFAULT_PERIOD_MS);
        assert_eq!(*config.cache_ttl_ms(), DEFAULT_CACHE_TTL_MS);
    }

    #[test]
    fn override_config_with_env_vars() {
        env::set_var("SYSMON__CORRELATOR_CAPACITY", "7");

        let config = MonitorConfig::load_from_file_and_env("does/not/exist.toml").unwrap();
        assert_eq!(*config.correlator_capacity(), 7);

        env::remove_var("SYSMON__CORRELATOR_CAPACITY");
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(temp_file, "period_ms = 0").unwrap();
        let config_path = temp_file.path().to_str().unwrap();

        let result = MonitorConfig::load_from_file_and_env(config_path);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
