pub mod catalog;
pub mod config;
pub mod downloader;
pub mod manager;
pub mod models;
pub mod notifier;
pub mod policy;
pub mod scheduler;
pub mod state_manager;
pub mod worker;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::catalog::{record_for_block, CourseDownloads, DownloadSizeSummary, DownloadableBlock};
    pub use crate::config::QueueConfig;
    pub use crate::downloader::{DownloadError, HttpTransfer, ProgressCallback, Transfer, TransferOutcome};
    pub use crate::manager::{ManagerError, QueueController, ReconcileReport};
    pub use crate::models::{DownloadRecord, DownloadedState, FileType};
    pub use crate::notifier::{DownloadEvent, ProgressChanged};
    pub use crate::policy::{
        AdmissionPolicy, ConnectionKind, FixedNetwork, NetworkMonitor, PolicyError, PreferenceStore,
        SharedPreferences, StorageProbe, UnknownStorage,
    };
    pub use crate::state_manager::QueueStore;
    pub use crate::worker::{LogNotice, ProgressNotice};
}
