//! Credential rotation for a document database connection.
//!
//! A [`watcher::SecretWatcher`] polls the secret store, confirmed changes are
//! coalesced by the [`debouncer::Debouncer`], and the
//! [`reconnector::Reconnector`] rebuilds the connection at most once at a
//! time. Requests go through [`retry::AuthRetryPolicy`], which retries
//! authorization failures against the rebuilt connection.
pub mod config;
pub mod connection;
pub mod cosmos;
pub mod database;
pub mod debouncer;
pub mod metrics_defs;
pub mod reconnector;
pub mod retry;
pub mod secrets;
mod service;
mod vault;
pub mod watcher;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use service::{RotationError, RotationService};
pub use vault::VaultSecretStore;
