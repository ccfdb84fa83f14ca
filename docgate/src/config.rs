use rotation::config::{Config as RotationConfig, SecretStoreType, ValidationError};
use serde::Deserialize;
use std::fs::File;
use std::time::Duration;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "docgate".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    /// Default filter, `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
    pub environment: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            sentry_dsn: None,
            environment: None,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub listener: Listener,
    pub admin_listener: Listener,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(flatten)]
    pub rotation: RotationConfig,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener == self.admin_listener {
            return Err(ConfigError::SharedListener);
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::MustBePositive("request_timeout_secs").into());
        }
        self.rotation.validate()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn secret_store(&self) -> SecretStoreType {
        self.rotation.secret_store.r#type.clone()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
    #[error("listener and admin_listener must differ")]
    SharedListener,
}
