//! Coalesces bursts of secret change notifications into rotation batches.
//!
//! Every notification bumps a version and starts a timer. A timer only
//! delivers if the version it captured is still current when it fires, so a
//! batch goes out once the burst has been quiet for the whole window.
use crate::metrics_defs::{ROTATION_BATCHES, ROTATION_BATCH_SIZE};
use parking_lot::Mutex;
use shared::{counter, histogram};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const SUBSCRIBER_CAPACITY: usize = 16;

/// Secrets that changed during one quiescent burst.
#[derive(Clone, Debug, PartialEq)]
pub struct RotationBatch {
    pub secrets: BTreeSet<String>,
    pub opened_at: Instant,
}

impl RotationBatch {
    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains(name)
    }
}

#[derive(Default)]
struct Pending {
    names: BTreeSet<String>,
    opened_at: Option<Instant>,
    version: u64,
}

struct DebouncerInner {
    window: Duration,
    pending: Mutex<Pending>,
    tx: broadcast::Sender<RotationBatch>,
}

#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Debouncer {
            inner: Arc::new(DebouncerInner {
                window,
                pending: Mutex::new(Pending::default()),
                tx,
            }),
        }
    }

    /// Batches published after this call are delivered to the receiver until
    /// it is dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<RotationBatch> {
        self.inner.tx.subscribe()
    }

    /// Records a change of `secret_name`. Must be called from within a tokio
    /// runtime, the delay timer runs as a task.
    pub fn notify(&self, secret_name: &str) {
        let version = {
            let mut pending = self.inner.pending.lock();
            if pending.names.is_empty() {
                pending.opened_at = Some(Instant::now());
            }
            pending.names.insert(secret_name.to_string());
            pending.version += 1;
            pending.version
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            inner.fire(version);
        });
    }
}

impl DebouncerInner {
    fn fire(&self, version: u64) {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.version != version {
                // A newer notification owns the batch now
                return;
            }
            let secrets = std::mem::take(&mut pending.names);
            let opened_at = pending.opened_at.take().unwrap_or_else(Instant::now);
            RotationBatch { secrets, opened_at }
        };

        if batch.secrets.is_empty() {
            return;
        }

        counter!(ROTATION_BATCHES).increment(1);
        histogram!(ROTATION_BATCH_SIZE).record(batch.secrets.len() as f64);
        tracing::info!(
            secrets = ?batch.secrets,
            open_ms = batch.opened_at.elapsed().as_millis() as u64,
            "delivering rotation batch"
        );

        if self.tx.send(batch).is_err() {
            tracing::warn!("rotation batch dropped, nobody is subscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    const WINDOW: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn test_burst_emits_once_after_quiet_period() {
        let debouncer = Debouncer::new(WINDOW);
        let mut rx = debouncer.subscribe();
        let start = Instant::now();

        debouncer.notify("cosmosKey");
        tokio::time::sleep(Duration::from_millis(150)).await;
        debouncer.notify("cosmosKey");

        let batch = rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(350), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
        assert_eq!(batch.secrets, BTreeSet::from(["cosmosKey".to_string()]));
        assert_eq!(batch.opened_at, start);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_union_of_names() {
        let debouncer = Debouncer::new(WINDOW);
        let mut rx = debouncer.subscribe();

        for name in ["cosmosKey", "cosmosEndpoint", "cosmosKey", "cosmosDatabase"] {
            debouncer.notify(name);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.secrets.len(), 3);
        assert!(batch.contains("cosmosEndpoint"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_emit_separate_batches() {
        let debouncer = Debouncer::new(WINDOW);
        let mut rx = debouncer.subscribe();

        debouncer.notify("a");
        let first = rx.recv().await.unwrap();

        debouncer.notify("b");
        let second = rx.recv().await.unwrap();

        assert_eq!(first.secrets, BTreeSet::from(["a".to_string()]));
        assert_eq!(second.secrets, BTreeSet::from(["b".to_string()]));
        assert!(second.opened_at > first.opened_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_notifiers() {
        let debouncer = Debouncer::new(WINDOW);
        let mut rx = debouncer.subscribe();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let debouncer = debouncer.clone();
                tokio::spawn(async move { debouncer.notify(&format!("secret-{i}")) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.secrets.len(), 8);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_subscriber_receives_batch() {
        let debouncer = Debouncer::new(WINDOW);
        let mut first = debouncer.subscribe();
        let mut second = debouncer.subscribe();

        debouncer.notify("cosmosKey");

        assert_eq!(first.recv().await.unwrap(), second.recv().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_subscribers() {
        let debouncer = Debouncer::new(WINDOW);
        debouncer.notify("cosmosKey");
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Pending state was drained, a later subscriber sees only new bursts
        let mut rx = debouncer.subscribe();
        debouncer.notify("other");
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.secrets, BTreeSet::from(["other".to_string()]));
    }
}
