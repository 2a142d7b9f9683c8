// src/downloader.rs

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::models::temporary_path;

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("server answered {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("no data received for {0:?}")]
    TimedOut(Duration),
}

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    /// Stopped through its cancellation token or [`Transfer::cancel`].
    Cancelled,
}

/// Called with cumulative bytes written and the content length, if the server
/// sent one.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// A single file transfer. Knows nothing about queueing and never retries.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Downloads `url` into `destination`, returning once the file is complete,
    /// the transfer failed, or `cancel` fired.
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, DownloadError>;

    /// Aborts the transfer currently in flight, if any.
    fn cancel(&self);
}

/// Plain HTTP GET transfer backed by reqwest.
///
/// The body is streamed into `<destination>.part`, which is renamed into place
/// once the last chunk is written. Partial files are removed on failure and on
/// cancellation.
#[derive(Debug)]
pub struct HttpTransfer {
    client: Client,
    read_timeout: Duration,
    active: Mutex<Option<CancellationToken>>,
}

impl HttpTransfer {
    pub fn new(config: &QueueConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::with_client(client, config.read_timeout()))
    }

    pub fn with_client(client: Client, read_timeout: Duration) -> Self {
        Self { client, read_timeout, active: Mutex::new(None) }
    }

    fn set_active(&self, token: Option<CancellationToken>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        temp: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<TransferOutcome, DownloadError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
        let response = self.client.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status { url: url.to_string(), status: status.as_u16() });
        }
        let total = response.content_length();
        debug!(url, ?total, "transfer started");

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(temp).await?;

        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        loop {
            let next = tokio::time::timeout(self.read_timeout, stream.next())
                .await
                .map_err(|_| DownloadError::TimedOut(self.read_timeout))?;
            let Some(chunk) = next else { break };
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            downloaded += bytes.len() as u64;
            if let Some(callback) = progress {
                callback(downloaded, total);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(temp, destination).await?;
        Ok(TransferOutcome::Completed { bytes: downloaded })
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, DownloadError> {
        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Cancelled);
        }
        self.set_active(Some(cancel.clone()));

        let temp = temporary_path(destination);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(TransferOutcome::Cancelled),
            res = self.fetch(url, destination, &temp, progress.as_ref()) => res,
        };
        self.set_active(None);

        if !matches!(result, Ok(TransferOutcome::Completed { .. })) {
            if let Err(e) = tokio::fs::remove_file(&temp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), "could not remove partial file: {}", e);
                }
            }
        }
        result
    }

    fn cancel(&self) {
        if let Some(token) = self.active.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            token.cancel();
        }
    }
}
