//! Secret stores hold the database access key. The watcher only compares
//! metadata timestamps; values are fetched when a change is confirmed and
//! when the reconnector builds a new client.
use crate::config::SecretStoreType;
use crate::vault::VaultSecretStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret store rejected the credentials: {0}")]
    Unauthorized(String),

    #[error("environment variable {0} is not set")]
    MissingToken(String),

    #[error("invalid secret store address: {0}")]
    InvalidAddress(String),

    #[error("unexpected secret store response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Timestamps of a secret, never its value.
#[derive(Clone, Debug, PartialEq)]
pub struct SecretMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn list_secret_metadata(&self) -> Result<Vec<SecretMetadata>, SecretError>;
    async fn fetch_secret_value(&self, name: &str) -> Result<String, SecretError>;
}

pub fn get_store(store_type: SecretStoreType) -> Result<Arc<dyn SecretStore>, SecretError> {
    let store: Arc<dyn SecretStore> = match store_type {
        SecretStoreType::Filesystem { path } => Arc::new(FilesystemSecretStore::new(path)),
        SecretStoreType::Vault {
            address,
            mount,
            path,
            namespace,
            token_env,
        } => {
            let token =
                std::env::var(&token_env).map_err(|_| SecretError::MissingToken(token_env))?;
            Arc::new(VaultSecretStore::new(address, mount, path, namespace, token))
        }
    };
    Ok(store)
}

/// Reads secrets from a directory holding one file per secret. Entries whose
/// name starts with a dot are skipped, which covers the `..data` links of
/// Kubernetes secret volumes.
pub struct FilesystemSecretStore {
    dir: PathBuf,
}

impl FilesystemSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FilesystemSecretStore { dir: dir.into() }
    }

    fn secret_path(&self, name: &str) -> Result<PathBuf, SecretError> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(SecretError::NotFound(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

/// Returns `None` for entries that are not regular files.
async fn file_metadata(name: String, path: &Path) -> Result<Option<SecretMetadata>, io::Error> {
    // Follows symlinks, so mounted secrets report their target's times
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Ok(None);
    }
    let modified = metadata.modified()?;
    let created = metadata.created().unwrap_or(modified);

    Ok(Some(SecretMetadata {
        name,
        created_at: DateTime::<Utc>::from(created),
        updated_at: DateTime::<Utc>::from(modified),
    }))
}

#[async_trait]
impl SecretStore for FilesystemSecretStore {
    async fn list_secret_metadata(&self) -> Result<Vec<SecretMetadata>, SecretError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut secrets = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            match file_metadata(name, &path).await {
                Ok(Some(metadata)) => secrets.push(metadata),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable secret file");
                }
            }
        }

        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn fetch_secret_value(&self, name: &str) -> Result<String, SecretError> {
        let path = self.secret_path(name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(value.trim().to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}
