use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} must be greater than 0")]
    MustBePositive(&'static str),

    #[error("backoff_base must be at least 1")]
    InvalidBackoffBase,

    #[error("database.{0} cannot be empty")]
    EmptyDatabaseField(&'static str),

    #[error("secret store path cannot be empty")]
    EmptySecretStorePath,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SecretStoreType {
    /// One file per secret in `path`, as mounted by Kubernetes.
    Filesystem { path: String },
    /// HashiCorp Vault KV v2 engine.
    Vault {
        address: Url,
        #[serde(default = "default_vault_mount")]
        mount: String,
        #[serde(default)]
        path: String,
        namespace: Option<String>,
        /// Name of the environment variable holding the Vault token.
        #[serde(default = "default_vault_token_env")]
        token_env: String,
    },
}

fn default_vault_mount() -> String {
    "secret".into()
}

fn default_vault_token_env() -> String {
    "VAULT_TOKEN".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct SecretStore {
    #[serde(flatten)]
    pub r#type: SecretStoreType,
}

/// Where the documents live and which secret holds the access key.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Database {
    pub endpoint: Url,
    pub database: String,
    pub collection: String,
    /// Name of the secret holding the account key.
    pub key_secret: String,
    /// Document field used as the partition key.
    #[serde(default = "default_partition_key_field")]
    pub partition_key_field: String,
}

fn default_partition_key_field() -> String {
    "id".into()
}

impl Database {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.database.is_empty() {
            return Err(ValidationError::EmptyDatabaseField("database"));
        }
        if self.collection.is_empty() {
            return Err(ValidationError::EmptyDatabaseField("collection"));
        }
        if self.key_secret.is_empty() {
            return Err(ValidationError::EmptyDatabaseField("key_secret"));
        }
        if self.partition_key_field.is_empty() {
            return Err(ValidationError::EmptyDatabaseField("partition_key_field"));
        }
        Ok(())
    }
}

/// Tuning knobs for change detection, rebuilds and retries.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Rotation {
    /// Quiet period before a burst of secret changes is delivered.
    pub debounce_ms: u64,
    /// How often the secret store metadata is polled.
    pub poll_interval_secs: u64,
    /// Retries after the first call when an operation fails with an
    /// authorization error.
    pub max_retry_attempts: u32,
    /// Backoff before retry n (0-based) is `backoff_base^n` seconds.
    pub backoff_base: u32,
    /// Upper bound for secret fetch, client construction and validation.
    pub rebuild_timeout_secs: u64,
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation {
            debounce_ms: 200,
            poll_interval_secs: 30,
            max_retry_attempts: 2,
            backoff_base: 2,
            rebuild_timeout_secs: 5,
        }
    }
}

impl Rotation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.debounce_ms == 0 {
            return Err(ValidationError::MustBePositive("debounce_ms"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ValidationError::MustBePositive("poll_interval_secs"));
        }
        if self.rebuild_timeout_secs == 0 {
            return Err(ValidationError::MustBePositive("rebuild_timeout_secs"));
        }
        if self.backoff_base == 0 {
            return Err(ValidationError::InvalidBackoffBase);
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rebuild_timeout(&self) -> Duration {
        Duration::from_secs(self.rebuild_timeout_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub secret_store: SecretStore,
    pub database: Database,
    #[serde(default)]
    pub rotation: Rotation,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let SecretStoreType::Filesystem { path } = &self.secret_store.r#type
            && path.is_empty()
        {
            return Err(ValidationError::EmptySecretStorePath);
        }
        self.database.validate()?;
        self.rotation.validate()
    }
}
