//! Long-running background tasks with explicit cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob_store::BlobStore;
use crate::queue::JobStore;

/// A named tokio task paired with the token that stops it.
pub struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `task_fn` with a fresh cancellation token.
    pub fn spawn<F, Fut>(name: &'static str, task_fn: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(task_fn(token.clone()));
        info!("Started background task '{name}'");
        Self {
            name,
            token,
            handle,
        }
    }

    /// Cancel the task and wait up to `timeout` for it to stop.
    ///
    /// A task that overruns the timeout is aborted.
    pub async fn shutdown(self, timeout: Duration) {
        let Self {
            name,
            token,
            mut handle,
        } = self;
        token.cancel();

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("Background task '{name}' stopped"),
            Ok(Err(err)) if err.is_panic() => warn!("Background task '{name}' panicked: {err}"),
            Ok(Err(err)) => warn!("Background task '{name}' ended abnormally: {err}"),
            Err(_) => {
                warn!(
                    "Background task '{name}' did not stop within {}ms; aborting",
                    timeout.as_millis()
                );
                handle.abort();
            }
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Periodic cleanup: expired blobs and old finalized batch records.
pub fn spawn_housekeeping(
    blobs: Arc<BlobStore>,
    store: JobStore,
    interval: Duration,
    record_retention: Duration,
) -> BackgroundTask {
    BackgroundTask::spawn("housekeeping", move |token| async move {
        loop {
            run_housekeeping_cycle(&blobs, &store, record_retention).await;
            if !sleep_or_cancel(&token, interval).await {
                break;
            }
        }
        debug!("Housekeeping loop exited");
    })
}

async fn run_housekeeping_cycle(blobs: &BlobStore, store: &JobStore, record_retention: Duration) {
    if let Err(err) = blobs.sweep_expired().await {
        warn!("Blob sweep failed: {err}");
    }
    if let Err(err) = store.purge_finished_batches(record_retention).await {
        warn!("Finished batch purge failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[tokio::test]
    async fn shutdown_stops_cooperative_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = BackgroundTask::spawn("ticker", move |token| async move {
            while sleep_or_cancel(&token, Duration::from_millis(5)).await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.shutdown(Duration::from_secs(1)).await;
        let after_shutdown = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn shutdown_gives_up_on_stuck_task() {
        let task = BackgroundTask::spawn("stuck", |_token| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let started = std::time::Instant::now();
        task.shutdown(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn housekeeping_sweeps_expired_blobs_until_stopped() {
        let dir = std::env::temp_dir().join(format!("sauti-housekeeping-test-{}", Uuid::new_v4()));
        let blobs = Arc::new(BlobStore::initialize(dir.join("blobs"), Duration::ZERO).unwrap());
        let store = JobStore::initialize(dir.join("queue.sqlite3")).unwrap();
        let blob_id = blobs.save(vec![7; 16], "old.wav").await.unwrap();

        // Zero TTL: anything older than the sweep instant is expired.
        let task = spawn_housekeeping(
            blobs.clone(),
            store,
            Duration::from_millis(10),
            Duration::from_secs(60),
        );

        let mut swept = false;
        for _ in 0..300 {
            if blobs.get_location(&blob_id).await.unwrap().is_none() {
                swept = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.shutdown(Duration::from_secs(1)).await;
        assert!(swept);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
