use crate::config::Config;
use crate::connection::Generation;
use crate::database::DatabaseDriver;
use crate::debouncer::Debouncer;
use crate::reconnector::{ReconnectError, ReconnectReason, ReconnectSettings, Reconnector};
use crate::retry::AuthRetryPolicy;
use crate::secrets::{SecretError, SecretStore};
use crate::watcher::{Command, SecretWatcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
pub enum RotationError {
    #[error("initial connection failed: {0}")]
    Connect(#[from] ReconnectError),

    #[error("secret store error: {0}")]
    Secrets(#[from] SecretError),

    #[error("the secret watcher is not running")]
    WatcherStopped,
}

struct RotationInner {
    reconnector: Reconnector,
    policy: AuthRetryPolicy,
    tx: mpsc::Sender<Command>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the background tasks that keep the database credential current: the
/// secret watcher and the rotation listener.
#[derive(Clone)]
pub struct RotationService {
    inner: Arc<RotationInner>,
}

impl RotationService {
    /// Connects to the database and starts watching the key secret. Fails if
    /// the first connection cannot be built.
    pub async fn start(
        config: &Config,
        store: Arc<dyn SecretStore>,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<Self, RotationError> {
        let settings = ReconnectSettings::from_config(&config.database, &config.rotation);
        let debouncer = Debouncer::new(config.rotation.debounce_window());
        let batches = debouncer.subscribe();
        let mut watcher = SecretWatcher::new(
            store.clone(),
            debouncer,
            Some(HashSet::from([settings.key_secret.clone()])),
        );
        // Baseline before the key is read, so a rotation racing startup shows
        // up as a change on the next poll
        watcher.poll_once().await?;

        let reconnector = Reconnector::connect(settings, store, driver).await?;

        let (tx, rx) = mpsc::channel::<Command>(16);
        let watcher_handle = tokio::spawn(watcher.run(config.rotation.poll_interval(), rx));

        let listener = reconnector.clone();
        let listener_handle =
            tokio::spawn(async move { listener.run_rotation_listener(batches).await });

        Ok(RotationService {
            inner: Arc::new(RotationInner {
                policy: AuthRetryPolicy::new(&config.rotation, reconnector.clone()),
                reconnector,
                tx,
                handles: Mutex::new(vec![watcher_handle, listener_handle]),
            }),
        })
    }

    pub fn policy(&self) -> &AuthRetryPolicy {
        &self.inner.policy
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.inner.reconnector
    }

    pub fn is_ready(&self) -> bool {
        self.inner.reconnector.is_healthy()
    }

    pub fn generation(&self) -> Generation {
        self.inner.reconnector.holder().generation()
    }

    /// Polls the secret store now instead of waiting for the next tick.
    pub async fn refresh(&self) -> Result<Vec<String>, RotationError> {
        let (reply, response) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Refresh(reply))
            .await
            .map_err(|_| RotationError::WatcherStopped)?;
        let changed = response.await.map_err(|_| RotationError::WatcherStopped)??;
        Ok(changed)
    }

    pub async fn reconnect(&self) -> Result<Generation, RotationError> {
        Ok(self
            .inner
            .reconnector
            .ensure_fresh_connection(ReconnectReason::Manual)
            .await?)
    }

    /// Stops the watcher and the rotation listener and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.inner.tx.send(Command::Shutdown).await;
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            // The listener only ends when every debouncer handle is gone
            handle.abort();
            let _ = handle.await;
        }
        tracing::info!("credential rotation stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Database, Rotation, SecretStoreType};
    use crate::testutils::{KEY_SECRET, MockDatabase, MockDriver, MockSecretStore, endpoint};
    use std::time::Duration;

    fn config() -> Config {
        Config {
            secret_store: crate::config::SecretStore {
                r#type: SecretStoreType::Filesystem {
                    path: "/unused".into(),
                },
            },
            database: Database {
                endpoint: endpoint(),
                database: "catalog".into(),
                collection: "items".into(),
                key_secret: KEY_SECRET.into(),
                partition_key_field: "id".into(),
            },
            rotation: Rotation::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_end_to_end() {
        let store = Arc::new(MockSecretStore::with_secret(KEY_SECRET, "key-1"));
        let driver = Arc::new(MockDriver::new(MockDatabase::accepting("key-1")));
        let service = RotationService::start(&config(), store.clone(), driver.clone())
            .await
            .unwrap();
        assert_eq!(service.generation(), 1);
        assert!(service.is_ready());

        store.set(KEY_SECRET, "key-2");
        driver.database.rotate_to("key-2");
        assert_eq!(service.refresh().await.unwrap(), vec![KEY_SECRET]);

        // Past the debounce window the listener has rebuilt
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(service.generation(), 2);
        assert_eq!(driver.build_count(), 2);

        service.shutdown().await;
        assert!(matches!(
            service.refresh().await,
            Err(RotationError::WatcherStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_during_startup_is_detected() {
        let store = Arc::new(MockSecretStore::with_secret(KEY_SECRET, "key-1"));
        let driver = Arc::new(MockDriver::new(MockDatabase::accepting("key-1")));
        driver.set_build_delay(Some(Duration::from_millis(100)));
        let starting = tokio::spawn({
            let store = store.clone();
            let driver = driver.clone();
            async move { RotationService::start(&config(), store, driver).await }
        });

        // Rotate after the key was read but before the client is built
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.set(KEY_SECRET, "key-2");
        driver.database.accept("key-2");

        let service = starting.await.unwrap().unwrap();
        assert_eq!(service.generation(), 1);
        assert_eq!(service.refresh().await.unwrap(), vec![KEY_SECRET]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(service.generation(), 2);
        assert_eq!(driver.build_count(), 2);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_without_key() {
        let store = Arc::new(MockSecretStore::default());
        let driver = Arc::new(MockDriver::new(MockDatabase::accepting("key-1")));
        let result = RotationService::start(&config(), store, driver).await;
        assert!(matches!(
            result,
            Err(RotationError::Connect(ReconnectError::SecretFetch { .. }))
        ));
    }
}
