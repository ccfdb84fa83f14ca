//! Transparent retry of database operations that fail authorization.
use crate::config;
use crate::connection::ConnectionState;
use crate::database::DatabaseError;
use crate::metrics_defs::{AUTH_RETRIES, AUTH_RETRIES_EXHAUSTED};
use crate::reconnector::{ReconnectReason, Reconnector};
use shared::counter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bookkeeping for a single `execute` call.
#[derive(Debug, Default)]
struct RetryContext {
    attempt: u32,
    last_error: Option<DatabaseError>,
    backoff: Duration,
    rebuild_succeeded: bool,
}

#[derive(Clone)]
pub struct AuthRetryPolicy {
    max_retry_attempts: u32,
    backoff_base: u32,
    reconnector: Reconnector,
}

impl AuthRetryPolicy {
    pub fn new(settings: &config::Rotation, reconnector: Reconnector) -> Self {
        AuthRetryPolicy {
            max_retry_attempts: settings.max_retry_attempts,
            backoff_base: settings.backoff_base,
            reconnector,
        }
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.reconnector
    }

    /// Delay before retry `attempt` (0-based): `backoff_base ^ attempt` seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(u64::from(self.backoff_base).saturating_pow(attempt))
    }

    /// Runs `operation` against the current connection. Authorization
    /// failures request a rebuild until one succeeds and are retried with
    /// exponential backoff up to `max_retry_attempts` times; every other
    /// error is returned as is.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, DatabaseError>
    where
        F: FnMut(Arc<ConnectionState>) -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let mut ctx = RetryContext::default();

        loop {
            let state = self.reconnector.current();
            let generation = state.generation;

            let err = match operation(state).await {
                Ok(value) => {
                    if let Some(err) = &ctx.last_error {
                        tracing::info!(
                            attempt = ctx.attempt,
                            generation,
                            recovered_from = %err,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_auth_failure() => err,
                Err(err) => return Err(err),
            };

            if ctx.attempt >= self.max_retry_attempts {
                counter!(AUTH_RETRIES_EXHAUSTED).increment(1);
                tracing::error!(
                    attempts = ctx.attempt + 1,
                    generation,
                    error = %err,
                    "operation still unauthorized after all retries"
                );
                return Err(err);
            }

            // A failed rebuild leaves the flag clear so the next failure asks again
            if !ctx.rebuild_succeeded {
                match self
                    .reconnector
                    .ensure_fresh_since(generation, ReconnectReason::AuthFailure)
                    .await
                {
                    Ok(_) => ctx.rebuild_succeeded = true,
                    Err(rebuild_err) => {
                        tracing::warn!(error = %rebuild_err, "rebuild after auth failure failed, retrying anyway");
                    }
                }
            }

            ctx.backoff = self.backoff(ctx.attempt);
            counter!(AUTH_RETRIES).increment(1);
            tracing::warn!(
                attempt = ctx.attempt + 1,
                backoff_ms = ctx.backoff.as_millis() as u64,
                error = %err,
                "retrying operation after authorization failure"
            );
            ctx.last_error = Some(err);

            tokio::time::sleep(ctx.backoff).await;
            ctx.attempt += 1;
        }
    }
}
