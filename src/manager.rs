// src/manager.rs

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::downloader::Transfer;
use crate::models::{DownloadRecord, DownloadedState};
use crate::notifier::{DownloadEvent, DownloadNotifier, ProgressChanged};
use crate::policy::{AdmissionPolicy, PolicyError};
use crate::scheduler::WorkerScheduler;
use crate::state_manager::{QueueStore, StateError};
use crate::worker::{remove_files, DownloadWorker, LogNotice, ProgressNotice};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("state manager error: {0}")]
    State(#[from] StateError),
}

/// Drift repaired by [`QueueController::reconcile`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records that were mid-transfer when the process stopped.
    pub requeued: usize,
    /// Downloaded records whose file is gone.
    pub dropped: usize,
}

/// The central component that admits, removes and observes downloads.
///
/// It owns the queue store, the worker and its scheduler. Every mutation of
/// the queue outside the worker goes through here.
pub struct QueueController {
    config: QueueConfig,
    store: Arc<QueueStore>,
    notifier: DownloadNotifier,
    worker: Arc<DownloadWorker>,
    scheduler: Arc<WorkerScheduler>,
    policy: AdmissionPolicy,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl QueueController {
    pub fn new(
        config: QueueConfig,
        store: Arc<QueueStore>,
        transfer: Arc<dyn Transfer>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self::with_notice(config, store, transfer, policy, Arc::new(LogNotice))
    }

    pub fn with_notice(
        config: QueueConfig,
        store: Arc<QueueStore>,
        transfer: Arc<dyn Transfer>,
        policy: AdmissionPolicy,
        notice: Arc<dyn ProgressNotice>,
    ) -> Self {
        let notifier = DownloadNotifier::new(config.event_capacity);
        let worker = Arc::new(
            DownloadWorker::new(store.clone(), transfer, notifier.clone(), &config).with_notice(notice),
        );
        let scheduler = Arc::new(WorkerScheduler::new(worker.clone(), store.clone()));
        Self {
            config,
            store,
            notifier,
            worker,
            scheduler,
            policy,
            observer: Mutex::new(None),
        }
    }

    /// Opens the store at `config.database_path` and starts the controller.
    pub async fn open(
        config: QueueConfig,
        transfer: Arc<dyn Transfer>,
        policy: AdmissionPolicy,
    ) -> Result<Arc<Self>, ManagerError> {
        let store = Arc::new(QueueStore::open(&config.database_path).await?);
        let controller = Arc::new(Self::new(config, store, transfer, policy));
        controller.start().await?;
        Ok(controller)
    }

    /// Repairs drift left by a previous process, then starts watching the
    /// store so waiting records always get a worker activation.
    pub async fn start(&self) -> Result<ReconcileReport, ManagerError> {
        let report = self.reconcile().await?;
        self.scheduler.resume().await;

        let mut queue = self.store.subscribe();
        let scheduler = self.scheduler.clone();
        let handle = tokio::spawn(async move {
            loop {
                let has_waiting = queue
                    .borrow_and_update()
                    .iter()
                    .any(|r| r.state == DownloadedState::Waiting);
                if has_waiting && scheduler.request().await {
                    debug!("worker activated by queue change");
                }
                if queue.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.observer.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(report)
    }

    /// Puts interrupted transfers back to waiting and forgets downloaded
    /// records whose file no longer exists.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ManagerError> {
        let requeued = self.store.reset_interrupted().await?;

        let mut missing = Vec::new();
        for record in self.store.snapshot().await? {
            if record.state.is_downloaded() && !file_exists(&record.path).await {
                missing.push(record.id);
            }
        }
        self.store.delete_by_ids(&missing).await?;

        let report = ReconcileReport { requeued, dropped: missing.len() };
        if report != ReconcileReport::default() {
            info!(requeued = report.requeued, dropped = report.dropped, "download queue reconciled");
        }
        Ok(report)
    }

    /// Admits `records` as waiting downloads. Ids already in the store are
    /// skipped; returns how many records were queued.
    ///
    /// A policy violation rejects the whole request and leaves the store
    /// untouched.
    pub async fn enqueue(&self, records: Vec<DownloadRecord>) -> Result<usize, ManagerError> {
        self.admit(records, false).await
    }

    /// Like [`enqueue`](Self::enqueue), after the user confirmed a large
    /// download over cellular data.
    pub async fn enqueue_on_cellular(&self, records: Vec<DownloadRecord>) -> Result<usize, ManagerError> {
        self.admit(records, true).await
    }

    async fn admit(&self, records: Vec<DownloadRecord>, cellular_confirmed: bool) -> Result<usize, ManagerError> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let known: HashSet<String> = self.store.by_ids(&ids).await?.into_iter().map(|r| r.id).collect();

        let mut seen = HashSet::new();
        let fresh: Vec<DownloadRecord> = records
            .into_iter()
            .filter(|r| !known.contains(&r.id) && seen.insert(r.id.clone()))
            .map(|mut r| {
                r.state = DownloadedState::Waiting;
                r.progress = None;
                r
            })
            .collect();
        if fresh.is_empty() {
            debug!("nothing new to download");
            return Ok(0);
        }

        if let Err(e) = self.policy.check(&fresh, &self.config.download_dir, cellular_confirmed) {
            warn!(count = fresh.len(), "download request rejected: {}", e);
            return Err(e.into());
        }

        let count = fresh.len();
        self.store.upsert(fresh).await?;
        info!(count, "downloads queued");
        self.scheduler.request().await;
        Ok(count)
    }

    /// Removes records and their files, cancelling the transfer of any of them
    /// that is in flight.
    ///
    /// Rows are deleted before the worker is told to cancel. A claim that
    /// landed first is cancelled here; a later one fails because the row is
    /// gone.
    pub async fn remove(&self, ids: &[String]) -> Result<(), ManagerError> {
        let records = self.store.by_ids(ids).await?;
        self.store.delete_by_ids(ids).await?;

        for record in records.iter().filter(|r| r.state.is_waiting_or_downloading()) {
            if self.worker.cancel(&record.id).await {
                info!(id = record.id, "active download cancelled");
            }
        }
        for record in &records {
            remove_files(&record.path).await;
        }
        info!(count = records.len(), "downloads removed");

        self.scheduler.cancel_if_drained().await;
        Ok(())
    }

    /// Removes every record of a course, downloaded or not.
    pub async fn remove_course(&self, course_id: &str) -> Result<(), ManagerError> {
        let ids: Vec<String> = self
            .store
            .by_course_id(course_id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        self.remove(&ids).await
    }

    /// Tears the queue down: cancels the active transfer and the scheduled
    /// activation, and clears every record that is not downloaded yet.
    pub async fn remove_all(&self) -> Result<(), ManagerError> {
        let pending: Vec<DownloadRecord> = self
            .store
            .snapshot()
            .await?
            .into_iter()
            .filter(|r| r.state.is_waiting_or_downloading())
            .collect();
        let ids: Vec<String> = pending.iter().map(|r| r.id.clone()).collect();
        self.store.delete_by_ids(&ids).await?;

        if self.worker.cancel_all().await {
            info!("active download cancelled");
        }
        self.scheduler.cancel().await;

        for record in &pending {
            remove_files(&record.path).await;
        }
        info!(count = pending.len(), "download queue cleared");
        Ok(())
    }

    /// Live queue: the current snapshot first, then one after each change.
    pub fn observe_queue(&self) -> BoxStream<'static, Vec<DownloadRecord>> {
        self.store.watch()
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<Vec<DownloadRecord>> {
        self.store.subscribe()
    }

    pub fn observe_progress(&self) -> BoxStream<'static, ProgressChanged> {
        self.notifier.progress()
    }

    pub fn observe_events(&self) -> BoxStream<'static, DownloadEvent> {
        self.notifier.events()
    }

    pub async fn snapshot(&self) -> Result<Vec<DownloadRecord>, ManagerError> {
        Ok(self.store.snapshot().await?)
    }

    pub async fn snapshot_ids(&self, ids: &[String]) -> Result<Vec<DownloadRecord>, ManagerError> {
        Ok(self.store.by_ids(ids).await?)
    }

    pub async fn snapshot_course(&self, course_id: &str) -> Result<Vec<DownloadRecord>, ManagerError> {
        Ok(self.store.by_course_id(course_id).await?)
    }

    /// Local file to play instead of streaming: only for downloaded records
    /// whose file is still on disk.
    pub async fn local_path(&self, id: &str) -> Result<Option<PathBuf>, ManagerError> {
        let records = self.store.by_ids(&[id.to_string()]).await?;
        for record in records {
            if record.state.is_downloaded() && file_exists(&record.path).await {
                return Ok(Some(record.path));
            }
        }
        Ok(None)
    }

    pub async fn is_scheduled(&self) -> bool {
        self.scheduler.is_scheduled().await
    }

    /// Resolves once the worker has nothing left to do.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Stops watching the store and aborts the worker as if the process had
    /// died. A record in flight stays `Downloading` and goes back to waiting on
    /// the next [`start`](Self::start). Records enqueued in between wait for it
    /// too.
    pub async fn shutdown(&self) {
        if let Some(observer) = self.observer.lock().await.take() {
            observer.abort();
        }
        self.scheduler.abort().await;
        info!("download queue stopped");
    }
}

async fn file_exists(path: &std::path::Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
