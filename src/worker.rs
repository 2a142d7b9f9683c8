// src/worker.rs

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::downloader::{ProgressCallback, Transfer, TransferOutcome};
use crate::models::{temporary_path, DownloadRecord, DownloadedState, FileType};
use crate::notifier::{DownloadEvent, DownloadNotifier, ProgressChanged};
use crate::state_manager::{QueueStore, StateError};

/// Low-importance status line shown while the worker is busy, e.g. a system
/// notification with the current title and percentage.
pub trait ProgressNotice: Send + Sync {
    fn update(&self, title: &str, percent: Option<u8>);
    fn clear(&self);
}

/// Notice that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotice;

impl ProgressNotice for LogNotice {
    fn update(&self, title: &str, percent: Option<u8>) {
        debug!(title, ?percent, "downloading");
    }

    fn clear(&self) {}
}

/// What one drain of the queue did, by record id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
    /// The drain stopped on a store error; waiting records may remain.
    pub aborted: bool,
}

enum ItemOutcome {
    Completed,
    Failed(DownloadRecord),
    Cancelled,
    Skipped,
}

struct ActiveItem {
    id: String,
    token: CancellationToken,
}

/// Drains the waiting set one record at a time, oldest first.
///
/// The worker is the only writer of the `Downloading` state. Failed and
/// cancelled records are deleted, never put back to `Waiting`.
pub struct DownloadWorker {
    store: Arc<QueueStore>,
    transfer: Arc<dyn Transfer>,
    notifier: DownloadNotifier,
    notice: Arc<dyn ProgressNotice>,
    download_dir: PathBuf,
    progress_interval: Duration,
    active: Mutex<Option<ActiveItem>>,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<QueueStore>,
        transfer: Arc<dyn Transfer>,
        notifier: DownloadNotifier,
        config: &QueueConfig,
    ) -> Self {
        Self {
            store,
            transfer,
            notifier,
            notice: Arc::new(LogNotice),
            download_dir: config.download_dir.clone(),
            progress_interval: config.progress_interval(),
            active: Mutex::new(None),
        }
    }

    pub fn with_notice(mut self, notice: Arc<dyn ProgressNotice>) -> Self {
        self.notice = notice;
        self
    }

    /// Processes waiting records until none is left or `stop` fires.
    /// `stop` is checked between records; it does not interrupt a transfer.
    pub async fn run_once(&self, stop: &CancellationToken) -> DrainReport {
        if let Err(e) = tokio::fs::create_dir_all(&self.download_dir).await {
            warn!(dir = %self.download_dir.display(), "could not create download directory: {}", e);
        }

        let mut report = DrainReport::default();
        let mut failed = Vec::new();
        while !stop.is_cancelled() {
            let next = match self.store.waiting().await {
                Ok(waiting) => waiting.into_iter().next(),
                Err(e) => {
                    error!("could not read waiting downloads: {}", e);
                    report.aborted = true;
                    break;
                }
            };
            let Some(record) = next else { break };
            let id = record.id.clone();

            match self.process(record).await {
                Ok(ItemOutcome::Completed) => report.completed.push(id),
                Ok(ItemOutcome::Failed(record)) => {
                    report.failed.push(id);
                    failed.push(record);
                }
                Ok(ItemOutcome::Cancelled) => report.cancelled.push(id),
                Ok(ItemOutcome::Skipped) => {}
                Err(e) => {
                    error!(id, "download bookkeeping failed: {}", e);
                    report.aborted = true;
                    break;
                }
            }
        }

        self.notice.clear();
        if !failed.is_empty() {
            self.notifier.send(DownloadEvent::Failed(failed));
        }
        report
    }

    /// Cancels the active transfer if it belongs to `id`.
    pub async fn cancel(&self, id: &str) -> bool {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(item) if item.id == id => {
                item.token.cancel();
                self.transfer.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancels whatever transfer is active.
    pub async fn cancel_all(&self) -> bool {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(item) => {
                item.token.cancel();
                self.transfer.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|item| item.id.clone())
    }

    async fn process(&self, record: DownloadRecord) -> Result<ItemOutcome, StateError> {
        let token = CancellationToken::new();
        // Registered before the claim so a removal racing the claim still
        // reaches this transfer.
        *self.active.lock().await = Some(ActiveItem { id: record.id.clone(), token: token.clone() });

        let mut claimed = record.with_state(DownloadedState::Downloading);
        claimed.progress = Some(0.0);
        let won = match self.store.transition(&claimed, DownloadedState::Waiting).await {
            Ok(won) => won,
            Err(e) => {
                *self.active.lock().await = None;
                return Err(e);
            }
        };
        if !won {
            *self.active.lock().await = None;
            debug!(id = record.id, "record no longer waiting, skipped");
            return Ok(ItemOutcome::Skipped);
        }
        info!(id = claimed.id, title = claimed.title, url = claimed.url, "download started");

        let callback = self.progress_callback(&claimed);
        let result = self
            .transfer
            .download(&claimed.url, &claimed.path, Some(callback), token)
            .await;
        *self.active.lock().await = None;

        match result {
            Ok(TransferOutcome::Completed { bytes }) => {
                let size = match completed_size(&claimed).await {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(id = claimed.id, "downloaded file unreadable: {}", e);
                        self.discard(&claimed).await?;
                        return Ok(ItemOutcome::Failed(claimed));
                    }
                };
                if self.store.transition(&claimed.downloaded(size), DownloadedState::Downloading).await? {
                    info!(id = claimed.id, bytes, size, "download finished");
                    Ok(ItemOutcome::Completed)
                } else {
                    info!(id = claimed.id, "record removed while downloading, discarding file");
                    remove_files(&claimed.path).await;
                    Ok(ItemOutcome::Cancelled)
                }
            }
            Ok(TransferOutcome::Cancelled) => {
                info!(id = claimed.id, "download cancelled");
                self.discard(&claimed).await?;
                Ok(ItemOutcome::Cancelled)
            }
            Err(e) => {
                warn!(id = claimed.id, url = claimed.url, "download failed: {}", e);
                self.discard(&claimed).await?;
                Ok(ItemOutcome::Failed(claimed))
            }
        }
    }

    async fn discard(&self, record: &DownloadRecord) -> Result<(), StateError> {
        self.store.delete_by_ids(std::slice::from_ref(&record.id)).await?;
        remove_files(&record.path).await;
        Ok(())
    }

    /// Throttled progress: at most one event per `progress_interval`, plus the
    /// final one. The stored progress is refreshed in 10% steps.
    fn progress_callback(&self, record: &DownloadRecord) -> ProgressCallback {
        let notifier = self.notifier.clone();
        let notice = self.notice.clone();
        let store = self.store.clone();
        let id = record.id.clone();
        let title = record.title.clone();
        let fallback_total = (record.size > 0).then_some(record.size);
        let interval_ms = self.progress_interval.as_millis() as u64;
        let started = Instant::now();
        let last_emit = AtomicU64::new(u64::MAX);
        let last_step = AtomicU8::new(0);

        Arc::new(move |downloaded, total| {
            let total = total.or(fallback_total);
            let now = started.elapsed().as_millis() as u64;
            let last = last_emit.load(Ordering::Relaxed);
            let finished = total.is_some_and(|t| downloaded >= t);
            if last != u64::MAX && now.saturating_sub(last) < interval_ms && !finished {
                return;
            }
            last_emit.store(now, Ordering::Relaxed);

            let event = ProgressChanged { id: id.clone(), downloaded, total };
            let percent = event.percent();
            notice.update(&title, percent);
            notifier.send(DownloadEvent::Progress(event));

            if let Some(percent) = percent {
                let step = percent / 10;
                if step > last_step.load(Ordering::Relaxed) {
                    last_step.store(step, Ordering::Relaxed);
                    let store = store.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = store.update_progress(&id, f32::from(percent) / 100.0).await {
                            debug!(id, "progress not stored: {}", e);
                        }
                    });
                }
            }
        })
    }
}

/// Size of a finished download as found on disk. Offline XBlock bundles may
/// be a directory, in which case every file below it is counted.
async fn completed_size(record: &DownloadRecord) -> std::io::Result<u64> {
    match record.file_type {
        FileType::Video | FileType::Unknown => Ok(tokio::fs::metadata(&record.path).await?.len()),
        FileType::XBlock => {
            let path = record.path.clone();
            tokio::task::spawn_blocking(move || disk_usage(&path))
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
        }
    }
}

fn disk_usage(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += disk_usage(&entry?.path())?;
    }
    Ok(total)
}

/// Best-effort removal of a download and its partial file. A missing file is
/// not an error; anything else is logged.
pub(crate) async fn remove_files(path: &Path) {
    let is_dir = tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false);
    let result = if is_dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "could not remove download: {}", e);
        }
    }
    let _ = tokio::fs::remove_file(temporary_path(path)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::DownloadError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Writes `bytes` bytes for urls ending in ".ok", waits for cancellation on
    /// ".block", fails everything else.
    struct ScriptedTransfer {
        bytes: usize,
        calls: StdMutex<Vec<String>>,
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl Transfer for ScriptedTransfer {
        async fn download(
            &self,
            url: &str,
            destination: &Path,
            progress: Option<ProgressCallback>,
            cancel: CancellationToken,
        ) -> Result<TransferOutcome, DownloadError> {
            self.calls.lock().unwrap().push(url.to_string());
            if url.ends_with(".block") {
                cancel.cancelled().await;
                return Ok(TransferOutcome::Cancelled);
            }
            if !url.ends_with(".ok") {
                return Err(DownloadError::InvalidUrl(url.to_string()));
            }
            tokio::fs::write(destination, vec![0u8; self.bytes]).await?;
            if let Some(progress) = progress {
                progress(self.bytes as u64, Some(self.bytes as u64));
            }
            Ok(TransferOutcome::Completed { bytes: self.bytes as u64 })
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn setup(dir: &Path, bytes: usize) -> (Arc<QueueStore>, Arc<ScriptedTransfer>, DownloadWorker, DownloadNotifier) {
        let store = Arc::new(QueueStore::open_in_memory().await.unwrap());
        let transfer = Arc::new(ScriptedTransfer { bytes, calls: StdMutex::new(Vec::new()), cancels: AtomicUsize::new(0) });
        let notifier = DownloadNotifier::new(16);
        let config = QueueConfig::rooted_at(dir);
        let worker = DownloadWorker::new(store.clone(), transfer.clone(), notifier.clone(), &config);
        (store, transfer, worker, notifier)
    }

    fn record(dir: &Path, id: &str, url: &str, file_type: FileType) -> DownloadRecord {
        DownloadRecord::new(id, "c1", id, url, dir.join(format!("{id}.bin")), 5, file_type)
    }

    #[tokio::test]
    async fn drains_in_order_and_measures_size_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transfer, worker, _notifier) = setup(dir.path(), 1000).await;
        store
            .upsert(vec![
                record(dir.path(), "a", "http://x/a.ok", FileType::Video),
                record(dir.path(), "b", "http://x/b.ok", FileType::XBlock),
            ])
            .await
            .unwrap();

        let report = worker.run_once(&CancellationToken::new()).await;

        assert_eq!(report.completed, vec!["a", "b"]);
        assert_eq!(*transfer.calls.lock().unwrap(), vec!["http://x/a.ok", "http://x/b.ok"]);
        let all = store.snapshot().await.unwrap();
        assert!(all.iter().all(|r| r.state == DownloadedState::Downloaded && r.size == 1000));
        assert!(worker.active_id().await.is_none());
    }

    #[tokio::test]
    async fn failures_are_deleted_and_announced_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _transfer, worker, notifier) = setup(dir.path(), 10).await;
        let mut events = notifier.subscribe();
        store
            .upsert(vec![
                record(dir.path(), "bad1", "http://x/bad1", FileType::Video),
                record(dir.path(), "good", "http://x/good.ok", FileType::Video),
                record(dir.path(), "bad2", "http://x/bad2", FileType::Video),
            ])
            .await
            .unwrap();

        let report = worker.run_once(&CancellationToken::new()).await;
        assert_eq!(report.failed, vec!["bad1", "bad2"]);

        let remaining = store.snapshot().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "good");

        let mut failed_batches = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DownloadEvent::Failed(records) = event {
                failed_batches.push(records.into_iter().map(|r| r.id).collect::<Vec<_>>());
            }
        }
        assert_eq!(failed_batches, vec![vec!["bad1".to_string(), "bad2".to_string()]]);
    }

    #[tokio::test]
    async fn stopped_worker_claims_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transfer, worker, _notifier) = setup(dir.path(), 10).await;
        store.upsert(vec![record(dir.path(), "a", "http://x/a.ok", FileType::Video)]).await.unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        let report = worker.run_once(&stop).await;
        assert_eq!(report, DrainReport::default());
        assert!(transfer.calls.lock().unwrap().is_empty());
        assert_eq!(store.waiting().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_is_scoped_to_the_active_id() {
        let dir = tempfile::tempdir().unwrap();
        let (store, transfer, worker, _notifier) = setup(dir.path(), 10).await;
        assert!(!worker.cancel("a").await);
        assert!(!worker.cancel_all().await);

        store.upsert(vec![record(dir.path(), "a", "http://x/a.block", FileType::Video)]).await.unwrap();
        let worker = Arc::new(worker);
        let drain = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run_once(&CancellationToken::new()).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.active_id().await.as_deref() != Some("a") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!worker.cancel("b").await);
        assert_eq!(transfer.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(worker.active_id().await.as_deref(), Some("a"));

        assert!(worker.cancel("a").await);
        let report = tokio::time::timeout(Duration::from_secs(5), drain).await.unwrap().unwrap();
        assert_eq!(report.cancelled, vec!["a"]);
        assert_eq!(transfer.cancels.load(Ordering::SeqCst), 1);
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_ends_the_drain_without_claiming() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("downloads.db");
        let store = Arc::new(QueueStore::open(&db_path).await.unwrap());
        let transfer = Arc::new(ScriptedTransfer { bytes: 10, calls: StdMutex::new(Vec::new()), cancels: AtomicUsize::new(0) });
        let config = QueueConfig::rooted_at(dir.path());
        let worker = DownloadWorker::new(store.clone(), transfer.clone(), DownloadNotifier::new(16), &config);
        store.upsert(vec![record(dir.path(), "a", "http://x/a.ok", FileType::Video)]).await.unwrap();

        let side = rusqlite::Connection::open(&db_path).unwrap();
        side.execute_batch(
            "CREATE TRIGGER reject_updates BEFORE UPDATE ON downloads
             BEGIN SELECT RAISE(ABORT, 'database or disk is full'); END;",
        )
        .unwrap();

        let report = worker.run_once(&CancellationToken::new()).await;
        assert!(report.aborted);
        assert!(report.completed.is_empty());
        assert!(transfer.calls.lock().unwrap().is_empty());
        assert!(worker.active_id().await.is_none());
        assert_eq!(store.waiting().await.unwrap().len(), 1);
    }

    #[test]
    fn directory_usage_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bundle/assets")).unwrap();
        std::fs::write(dir.path().join("bundle/index.html"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("bundle/assets/app.js"), vec![0u8; 50]).unwrap();
        assert_eq!(disk_usage(&dir.path().join("bundle")).unwrap(), 150);
    }

    #[tokio::test]
    async fn remove_files_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("v1.mp4");
        std::fs::write(&file, b"data").unwrap();
        std::fs::write(temporary_path(&file), b"part").unwrap();

        remove_files(&file).await;
        remove_files(&file).await;

        assert!(!file.exists());
        assert!(!temporary_path(&file).exists());
    }
}
