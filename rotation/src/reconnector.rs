//! Single-flight rebuild of the database connection.
//!
//! The reconnector is either `Idle` or `Leading` a rebuild. The first caller
//! to find it idle starts the rebuild and stores it as a shared future; every
//! caller arriving while it runs awaits that same future and observes the
//! same outcome. Any attached caller drives the future, so a cancelled leader
//! does not strand the others.
use crate::config;
use crate::connection::{ConnectionHolder, ConnectionState, Generation};
use crate::database::{DatabaseDriver, DatabaseError};
use crate::debouncer::RotationBatch;
use crate::metrics_defs::{
    CONNECTION_GENERATION, REBUILD_DURATION, REBUILD_FAILED, REBUILD_FOLLOWERS, REBUILD_STARTED,
};
use crate::secrets::SecretStore;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use shared::{counter, gauge, histogram};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use url::Url;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReconnectError {
    #[error("could not fetch secret '{name}': {message}")]
    SecretFetch { name: String, message: String },

    #[error("could not build database client: {0}")]
    ClientBuild(DatabaseError),

    #[error("new database client failed validation: {0}")]
    Validation(DatabaseError),

    #[error("rebuild did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReconnectReason {
    /// A debounced batch of secret changes.
    Rotation(BTreeSet<String>),
    /// An operation was rejected with an authorization error.
    AuthFailure,
    Manual,
}

impl ReconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectReason::Rotation(_) => "rotation",
            ReconnectReason::AuthFailure => "auth-failure",
            ReconnectReason::Manual => "manual",
        }
    }
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectReason::Rotation(secrets) => write!(f, "rotation of {secrets:?}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Everything needed to build a connection.
#[derive(Clone, Debug)]
pub struct ReconnectSettings {
    pub endpoint: Url,
    pub database: String,
    pub collection: String,
    pub key_secret: String,
    pub rebuild_timeout: Duration,
}

impl ReconnectSettings {
    pub fn from_config(database: &config::Database, rotation: &config::Rotation) -> Self {
        ReconnectSettings {
            endpoint: database.endpoint.clone(),
            database: database.database.clone(),
            collection: database.collection.clone(),
            key_secret: database.key_secret.clone(),
            rebuild_timeout: rotation.rebuild_timeout(),
        }
    }
}

type Flight = Shared<BoxFuture<'static, Result<Generation, ReconnectError>>>;

enum FlightState {
    Idle,
    Leading(Flight),
}

struct ReconnectorInner {
    settings: ReconnectSettings,
    secrets: Arc<dyn SecretStore>,
    driver: Arc<dyn DatabaseDriver>,
    holder: ConnectionHolder,
    state: Mutex<FlightState>,
    // False after a failed rebuild until the next one succeeds
    healthy: AtomicBool,
}

#[derive(Clone)]
pub struct Reconnector {
    inner: Arc<ReconnectorInner>,
}

impl Reconnector {
    /// Builds and validates the first connection (generation 1).
    pub async fn connect(
        settings: ReconnectSettings,
        secrets: Arc<dyn SecretStore>,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<Self, ReconnectError> {
        let state = tokio::time::timeout(
            settings.rebuild_timeout,
            build_state(&settings, secrets.as_ref(), driver.as_ref(), 1),
        )
        .await
        .map_err(|_| ReconnectError::Timeout(settings.rebuild_timeout))??;

        tracing::info!(
            endpoint = %settings.endpoint,
            database = %settings.database,
            collection = %settings.collection,
            "database connection established"
        );
        gauge!(CONNECTION_GENERATION).set(1.0);

        Ok(Reconnector {
            inner: Arc::new(ReconnectorInner {
                settings,
                secrets,
                driver,
                holder: ConnectionHolder::new(state),
                state: Mutex::new(FlightState::Idle),
                healthy: AtomicBool::new(true),
            }),
        })
    }

    pub fn current(&self) -> Arc<ConnectionState> {
        self.inner.holder.current()
    }

    pub fn holder(&self) -> &ConnectionHolder {
        &self.inner.holder
    }

    pub fn settings(&self) -> &ReconnectSettings {
        &self.inner.settings
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    /// Rebuilds the connection, or waits for the rebuild already in flight.
    pub async fn ensure_fresh_connection(
        &self,
        reason: ReconnectReason,
    ) -> Result<Generation, ReconnectError> {
        self.ensure_fresh(None, reason).await
    }

    /// Like [`Self::ensure_fresh_connection`], but returns right away when a
    /// connection newer than `observed` has already been published.
    pub async fn ensure_fresh_since(
        &self,
        observed: Generation,
        reason: ReconnectReason,
    ) -> Result<Generation, ReconnectError> {
        self.ensure_fresh(Some(observed), reason).await
    }

    async fn ensure_fresh(
        &self,
        observed: Option<Generation>,
        reason: ReconnectReason,
    ) -> Result<Generation, ReconnectError> {
        let flight = {
            let mut state = self.inner.state.lock();
            match &*state {
                FlightState::Leading(flight) => {
                    counter!(REBUILD_FOLLOWERS).increment(1);
                    tracing::debug!(reason = %reason, "attaching to in-flight rebuild");
                    flight.clone()
                }
                FlightState::Idle => {
                    // The leader publishes before going idle, so this read is
                    // ordered after any rebuild that already finished
                    let current = self.inner.holder.generation();
                    if observed.is_some_and(|observed| current > observed) {
                        return Ok(current);
                    }
                    let flight = self.inner.clone().rebuild(reason).boxed().shared();
                    *state = FlightState::Leading(flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    /// Triggers one rebuild per rotation batch that names the key secret,
    /// until the debouncer goes away.
    pub async fn run_rotation_listener(&self, mut batches: broadcast::Receiver<RotationBatch>) {
        let key_secret = self.inner.settings.key_secret.clone();
        loop {
            let reason = match batches.recv().await {
                Ok(batch) if batch.contains(&key_secret) => ReconnectReason::Rotation(batch.secrets),
                Ok(batch) => {
                    tracing::debug!(secrets = ?batch.secrets, "rotation batch does not affect the connection");
                    continue;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "rotation listener lagged, rebuilding to be safe");
                    ReconnectReason::Rotation(BTreeSet::from([key_secret.clone()]))
                }
                Err(RecvError::Closed) => {
                    tracing::info!("rotation batches closed, stopping listener");
                    return;
                }
            };

            // Failures are logged by the leader; the retry policy recovers later
            let _ = self.ensure_fresh_connection(reason).await;
        }
    }
}

impl ReconnectorInner {
    async fn rebuild(self: Arc<Self>, reason: ReconnectReason) -> Result<Generation, ReconnectError> {
        let previous = self.holder.generation();
        counter!(REBUILD_STARTED, "reason" => reason.as_str()).increment(1);
        tracing::info!(reason = %reason, generation = previous, "rebuilding database connection");

        let started = Instant::now();
        let next = previous + 1;
        let build = build_state(
            &self.settings,
            self.secrets.as_ref(),
            self.driver.as_ref(),
            next,
        );
        let result = match tokio::time::timeout(self.settings.rebuild_timeout, build).await {
            Ok(Ok(state)) => {
                self.holder.publish(state);
                Ok(next)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ReconnectError::Timeout(self.settings.rebuild_timeout)),
        };
        histogram!(REBUILD_DURATION).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(generation) => {
                self.healthy.store(true, Ordering::Relaxed);
                gauge!(CONNECTION_GENERATION).set(*generation as f64);
                tracing::info!(generation, "published rebuilt database connection");
            }
            Err(err) => {
                self.healthy.store(false, Ordering::Relaxed);
                counter!(REBUILD_FAILED).increment(1);
                tracing::error!(error = %err, generation = previous, "database connection rebuild failed");
            }
        }

        *self.state.lock() = FlightState::Idle;
        result
    }
}

async fn build_state(
    settings: &ReconnectSettings,
    secrets: &dyn SecretStore,
    driver: &dyn DatabaseDriver,
    generation: Generation,
) -> Result<ConnectionState, ReconnectError> {
    let key = secrets
        .fetch_secret_value(&settings.key_secret)
        .await
        .map_err(|e| ReconnectError::SecretFetch {
            name: settings.key_secret.clone(),
            message: e.to_string(),
        })?;

    let client = driver
        .build_client(&settings.endpoint, &key)
        .await
        .map_err(ReconnectError::ClientBuild)?;

    // Never publish a client that cannot talk to the database
    client
        .validate(&settings.database)
        .await
        .map_err(ReconnectError::Validation)?;

    Ok(ConnectionState {
        client,
        endpoint: settings.endpoint.clone(),
        database: settings.database.clone(),
        collection: settings.collection.clone(),
        generation,
    })
}
