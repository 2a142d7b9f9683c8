// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for the download queue. Every field has a default, so a config
/// file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory owned by the queue; downloaded files land here.
    pub download_dir: PathBuf,
    pub database_path: PathBuf,
    pub connect_timeout_secs: u64,
    /// Maximum silence between two body chunks before the transfer fails.
    pub read_timeout_secs: u64,
    /// Minimum spacing of progress events per transfer.
    pub progress_interval_ms: u64,
    /// Cellular downloads at or above this total need explicit confirmation.
    pub max_cellular_bytes: u64,
    /// Free space must be at least `storage_factor` times the requested size.
    pub storage_factor: u64,
    /// Buffer of the event broadcast channel.
    pub event_capacity: usize,
    pub user_agent: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            database_path: PathBuf::from("downloads.db"),
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            progress_interval_ms: 200,
            max_cellular_bytes: 100_000_000,
            storage_factor: 2,
            event_capacity: 256,
            user_agent: concat!("course-offline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl QueueConfig {
    /// Loads a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Default config rooted in `dir`: files under `dir/downloads`, database at
    /// `dir/downloads.db`.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            download_dir: dir.join("downloads"),
            database_path: dir.join("downloads.db"),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
