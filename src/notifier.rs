// src/notifier.rs

use crate::models::DownloadRecord;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

/// Incremental progress of the record currently downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressChanged {
    pub id: String,
    pub downloaded: u64,
    /// Content length from the server, or the catalog size when the server
    /// did not send one. `None` if neither is known.
    pub total: Option<u64>,
}

impl ProgressChanged {
    /// Whole percent in 0..=100, if the total is known.
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(total) if total > 0 => Some((self.downloaded.min(total) * 100 / total) as u8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress(ProgressChanged),
    /// Records whose transfer failed during the last drain of the queue.
    /// They have already been removed from the store.
    Failed(Vec<DownloadRecord>),
}

/// Fan-out of transient download events.
///
/// Delivery is best effort: subscribers only see events sent after they
/// attached, and a subscriber that falls behind skips what it missed.
#[derive(Debug, Clone)]
pub struct DownloadNotifier {
    tx: broadcast::Sender<DownloadEvent>,
}

impl DownloadNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn send(&self, event: DownloadEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    pub fn events(&self) -> BoxStream<'static, DownloadEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    pub fn progress(&self) -> BoxStream<'static, ProgressChanged> {
        self.events()
            .filter_map(|event| async move {
                match event {
                    DownloadEvent::Progress(progress) => Some(progress),
                    DownloadEvent::Failed(_) => None,
                }
            })
            .boxed()
    }
}
