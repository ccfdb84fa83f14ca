//! Polls the secret store and reports confirmed changes to the debouncer.
//!
//! A change is confirmed by comparing timestamps against the last observed
//! record, never by comparing values.
use crate::debouncer::Debouncer;
use crate::metrics_defs::{SECRET_CHANGES, SECRET_POLL_ERRORS};
use crate::secrets::{SecretError, SecretMetadata, SecretStore};
use chrono::{DateTime, Utc};
use shared::counter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretRecord {
    fn from_metadata(metadata: &SecretMetadata) -> Self {
        SecretRecord {
            name: metadata.name.clone(),
            created_at: metadata.created_at,
            updated_at: metadata.updated_at,
        }
    }

    fn differs_from(&self, metadata: &SecretMetadata) -> bool {
        self.created_at != metadata.created_at || self.updated_at != metadata.updated_at
    }
}

pub enum Command {
    /// Poll right away and report the names that changed.
    Refresh(oneshot::Sender<Result<Vec<String>, SecretError>>),
    Shutdown,
}

pub struct SecretWatcher {
    store: Arc<dyn SecretStore>,
    debouncer: Debouncer,
    // None watches every secret in the store
    watched: Option<HashSet<String>>,
    records: HashMap<String, SecretRecord>,
}

impl SecretWatcher {
    pub fn new(
        store: Arc<dyn SecretStore>,
        debouncer: Debouncer,
        watched: Option<HashSet<String>>,
    ) -> Self {
        SecretWatcher {
            store,
            debouncer,
            watched,
            records: HashMap::new(),
        }
    }

    pub fn record(&self, name: &str) -> Option<&SecretRecord> {
        self.records.get(name)
    }

    fn is_watched(&self, name: &str) -> bool {
        self.watched.as_ref().is_none_or(|w| w.contains(name))
    }

    /// Lists the store once and notifies the debouncer of every confirmed
    /// change. The first sighting of a secret only records a baseline.
    pub async fn poll_once(&mut self) -> Result<Vec<String>, SecretError> {
        let listed = self.store.list_secret_metadata().await?;
        let mut seen = HashSet::new();
        let mut changed = Vec::new();

        for metadata in &listed {
            if !self.is_watched(&metadata.name) {
                continue;
            }
            seen.insert(metadata.name.clone());

            match self.records.get(&metadata.name).map(|r| r.differs_from(metadata)) {
                None => {
                    tracing::info!(secret = %metadata.name, "watching secret");
                    self.records
                        .insert(metadata.name.clone(), SecretRecord::from_metadata(metadata));
                    continue;
                }
                Some(false) => continue,
                Some(true) => {}
            }

            tracing::info!(
                secret = %metadata.name,
                updated_at = %metadata.updated_at,
                "secret changed"
            );
            self.records
                .insert(metadata.name.clone(), SecretRecord::from_metadata(metadata));

            counter!(SECRET_CHANGES).increment(1);
            self.debouncer.notify(&metadata.name);
            changed.push(metadata.name.clone());
        }

        self.records.retain(|name, _| {
            let keep = seen.contains(name);
            if !keep {
                tracing::warn!(secret = %name, "secret disappeared from the store");
            }
            keep
        });

        Ok(changed)
    }

    /// Polls every `interval` until shutdown or until the command sender is
    /// dropped. Poll errors are logged and counted.
    pub async fn run(mut self, interval: Duration, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        counter!(SECRET_POLL_ERRORS).increment(1);
                        tracing::error!(error = %err, "failed to poll secret store");
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Refresh(reply)) => {
                        let result = self.poll_once().await;
                        if let Err(err) = &result {
                            counter!(SECRET_POLL_ERRORS).increment(1);
                            tracing::error!(error = %err, "refresh of secret store failed");
                        }
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => {
                        tracing::info!("secret watcher stopped");
                        return;
                    }
                },
            }
        }
    }
}
