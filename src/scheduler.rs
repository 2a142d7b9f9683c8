// src/scheduler.rs

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state_manager::QueueStore;
use crate::worker::DownloadWorker;

struct ScheduleState {
    running: bool,
    /// Set by `abort`; no activation starts until `resume`.
    halted: bool,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Runs the worker as a supervised tokio task, at most one activation at a
/// time.
///
/// An activation only ends after re-reading the waiting set while holding the
/// same lock `request` takes, so a record enqueued during the last transfer is
/// either seen by the running activation or starts a new one.
pub struct WorkerScheduler {
    worker: Arc<DownloadWorker>,
    store: Arc<QueueStore>,
    state: Mutex<ScheduleState>,
    idle: watch::Sender<bool>,
}

impl WorkerScheduler {
    pub fn new(worker: Arc<DownloadWorker>, store: Arc<QueueStore>) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            worker,
            store,
            state: Mutex::new(ScheduleState {
                running: false,
                halted: false,
                stop: CancellationToken::new(),
                handle: None,
            }),
            idle,
        }
    }

    /// Starts an activation unless one is already running. Returns whether a
    /// new activation was started.
    pub async fn request(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        if state.running || state.halted {
            return false;
        }
        state.running = true;
        state.stop = CancellationToken::new();
        let stop = state.stop.clone();
        let previous = state.handle.take();
        self.idle.send_replace(false);

        let this = self.clone();
        state.handle = Some(tokio::spawn(async move { this.activation(previous, stop).await }));
        debug!("worker activation started");
        true
    }

    /// Stops the running activation once its current transfer is over. The
    /// transfer itself is not cancelled here.
    pub async fn cancel(&self) {
        let mut state = self.state.lock().await;
        if state.running {
            state.stop.cancel();
            state.running = false;
            debug!("worker activation cancelled");
        }
    }

    /// Stops the running activation only if nothing is waiting or
    /// downloading. The check runs under the lock `request` takes, so a record
    /// enqueued concurrently either keeps the activation alive or starts a new
    /// one. Returns whether the activation was stopped.
    pub async fn cancel_if_drained(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.running {
            return false;
        }
        match self.store.snapshot().await {
            Ok(records) if !records.iter().any(|r| r.state.is_waiting_or_downloading()) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!("could not check pending downloads: {}", e);
                return false;
            }
        }
        state.stop.cancel();
        state.running = false;
        debug!("worker activation cancelled, queue drained");
        true
    }

    /// Kills the running activation without waiting for its transfer. Later
    /// requests are refused until [`resume`](Self::resume).
    pub async fn abort(&self) {
        let mut state = self.state.lock().await;
        state.stop.cancel();
        state.running = false;
        state.halted = true;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        self.idle.send_replace(true);
    }

    /// Accepts requests again after [`abort`](Self::abort).
    pub async fn resume(&self) {
        self.state.lock().await.halted = false;
    }

    pub async fn is_scheduled(&self) -> bool {
        self.state.lock().await.running
    }

    /// Resolves once no activation is running.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    async fn activation(self: Arc<Self>, previous: Option<JoinHandle<()>>, stop: CancellationToken) {
        // A cancelled activation may still be finishing its last transfer.
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        loop {
            let report = self.worker.run_once(&stop).await;
            info!(
                completed = report.completed.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled.len(),
                "download queue drained"
            );

            let mut state = self.state.lock().await;
            if report.aborted && !stop.is_cancelled() {
                // A store error ends the activation; the next request retries.
                warn!("download queue drain aborted, worker going idle");
                state.running = false;
                self.idle.send_replace(true);
                return;
            }
            if stop.is_cancelled() {
                if !state.running {
                    self.idle.send_replace(true);
                }
                return;
            }
            match self.store.waiting().await {
                Ok(waiting) if !waiting.is_empty() => continue,
                Ok(_) => {}
                Err(e) => warn!("could not re-read waiting downloads: {}", e),
            }
            state.running = false;
            self.idle.send_replace(true);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::downloader::{DownloadError, ProgressCallback, Transfer, TransferOutcome};
    use crate::models::{DownloadRecord, DownloadedState, FileType};
    use crate::notifier::DownloadNotifier;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Holds each transfer until the gate is opened once for it.
    struct GatedTransfer {
        gate: Notify,
    }

    #[async_trait]
    impl Transfer for GatedTransfer {
        async fn download(
            &self,
            _url: &str,
            destination: &Path,
            _progress: Option<ProgressCallback>,
            cancel: CancellationToken,
        ) -> Result<TransferOutcome, DownloadError> {
            tokio::select! {
                _ = self.gate.notified() => tokio::fs::write(destination, b"data")
                    .await
                    .map(|_| TransferOutcome::Completed { bytes: 4 })
                    .map_err(DownloadError::from),
                _ = cancel.cancelled() => Ok(TransferOutcome::Cancelled),
            }
        }

        fn cancel(&self) {}
    }

    async fn setup(dir: &Path) -> (Arc<QueueStore>, Arc<GatedTransfer>, Arc<WorkerScheduler>) {
        let store = Arc::new(QueueStore::open_in_memory().await.unwrap());
        let transfer = Arc::new(GatedTransfer { gate: Notify::new() });
        let config = QueueConfig::rooted_at(dir);
        let worker = Arc::new(DownloadWorker::new(
            store.clone(),
            transfer.clone(),
            DownloadNotifier::new(16),
            &config,
        ));
        let scheduler = Arc::new(WorkerScheduler::new(worker, store.clone()));
        (store, transfer, scheduler)
    }

    fn record(dir: &Path, id: &str) -> DownloadRecord {
        DownloadRecord::new(id, "c1", id, format!("http://x/{id}.mp4"), dir.join(format!("{id}.mp4")), 4, FileType::Video)
    }

    async fn until_state(store: &QueueStore, id: &str, state: DownloadedState) {
        let mut queue = store.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            queue.wait_for(|records| records.iter().any(|r| r.id == id && r.state == state)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn idle(scheduler: &WorkerScheduler) {
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle()).await.unwrap();
    }

    #[tokio::test]
    async fn drained_check_keeps_activation_for_new_waiting_record() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transfer, scheduler) = setup(dir.path()).await;
        store.upsert(vec![record(dir.path(), "a")]).await.unwrap();
        assert!(scheduler.request().await);
        until_state(&store, "a", DownloadedState::Downloading).await;

        // Enqueued while the activation runs, so its own request is refused.
        store.upsert(vec![record(dir.path(), "b")]).await.unwrap();
        assert!(!scheduler.request().await);

        assert!(!scheduler.cancel_if_drained().await);
        assert!(scheduler.is_scheduled().await);

        transfer.gate.notify_one();
        until_state(&store, "b", DownloadedState::Downloading).await;
        transfer.gate.notify_one();
        idle(&scheduler).await;

        let all = store.snapshot().await.unwrap();
        assert!(all.iter().all(|r| r.state == DownloadedState::Downloaded));
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn drained_check_stops_activation_once_nothing_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transfer, scheduler) = setup(dir.path()).await;
        store.upsert(vec![record(dir.path(), "a")]).await.unwrap();
        assert!(scheduler.request().await);
        until_state(&store, "a", DownloadedState::Downloading).await;

        store.delete_by_ids(&["a".to_string()]).await.unwrap();
        assert!(scheduler.cancel_if_drained().await);
        assert!(!scheduler.is_scheduled().await);

        transfer.gate.notify_one();
        idle(&scheduler).await;
        assert!(store.snapshot().await.unwrap().is_empty());
        assert!(!dir.path().join("a.mp4").exists());
    }

    #[tokio::test]
    async fn aborted_scheduler_refuses_requests_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transfer, scheduler) = setup(dir.path()).await;
        store.upsert(vec![record(dir.path(), "a")]).await.unwrap();
        assert!(scheduler.request().await);
        until_state(&store, "a", DownloadedState::Downloading).await;

        scheduler.abort().await;
        store.upsert(vec![record(dir.path(), "b")]).await.unwrap();
        assert!(!scheduler.request().await);
        assert!(!scheduler.is_scheduled().await);
        assert_eq!(store.waiting().await.unwrap().len(), 1);

        scheduler.resume().await;
        assert!(scheduler.request().await);
        transfer.gate.notify_one();
        until_state(&store, "b", DownloadedState::Downloaded).await;
        idle(&scheduler).await;

        let downloading: Vec<DownloadRecord> = store
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.state == DownloadedState::Downloading)
            .collect();
        assert_eq!(downloading.len(), 1);
        assert_eq!(downloading[0].id, "a");
    }
}
