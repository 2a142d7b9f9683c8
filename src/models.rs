// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a queued download.
///
/// `NotDownloaded` is what callers report when no record exists; it is never
/// written to the store by the normal enqueue path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadedState {
    Waiting,
    Downloading,
    Downloaded,
    NotDownloaded,
}

impl DownloadedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadedState::Waiting => "WAITING",
            DownloadedState::Downloading => "DOWNLOADING",
            DownloadedState::Downloaded => "DOWNLOADED",
            DownloadedState::NotDownloaded => "NOT_DOWNLOADED",
        }
    }

    /// True for records that still occupy the queue.
    pub fn is_waiting_or_downloading(&self) -> bool {
        matches!(self, DownloadedState::Waiting | DownloadedState::Downloading)
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self, DownloadedState::Downloaded)
    }
}

impl fmt::Display for DownloadedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for DownloadedState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(DownloadedState::Waiting),
            "DOWNLOADING" => Ok(DownloadedState::Downloading),
            "DOWNLOADED" => Ok(DownloadedState::Downloaded),
            "NOT_DOWNLOADED" => Ok(DownloadedState::NotDownloaded),
            other => Err(ParseEnumError { kind: "state", value: other.to_string() }),
        }
    }
}

/// Kind of content behind a record. Only affects how the completed size is
/// measured and how the UI presents the item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    Video,
    XBlock,
    Unknown,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Video => "VIDEO",
            FileType::XBlock => "X_BLOCK",
            FileType::Unknown => "UNKNOWN",
        }
    }

    /// Extension used when the source URL does not carry one.
    pub fn default_extension(&self) -> &'static str {
        match self {
            FileType::Video => "mp4",
            FileType::XBlock => "zip",
            FileType::Unknown => "bin",
        }
    }
}

impl FromStr for FileType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VIDEO" => Ok(FileType::Video),
            "X_BLOCK" => Ok(FileType::XBlock),
            "UNKNOWN" => Ok(FileType::Unknown),
            other => Err(ParseEnumError { kind: "file type", value: other.to_string() }),
        }
    }
}

/// Represents the persistent state of a single downloadable block.
/// One row of the queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Block id, unique within the store.
    pub id: String,
    pub course_id: String,
    pub title: String,
    /// Expected size from catalog metadata at enqueue time, the on-disk size
    /// once downloaded. 0 when unknown.
    pub size: u64,
    pub path: PathBuf,
    pub url: String,
    pub file_type: FileType,
    pub state: DownloadedState,
    /// Last known fraction in 0.0..=1.0, only set while downloading.
    pub progress: Option<f32>,
    pub last_modified: Option<String>,
}

impl DownloadRecord {
    pub fn new(
        id: impl Into<String>,
        course_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        path: impl Into<PathBuf>,
        size: u64,
        file_type: FileType,
    ) -> Self {
        Self {
            id: id.into(),
            course_id: course_id.into(),
            title: title.into(),
            size,
            path: path.into(),
            url: url.into(),
            file_type,
            state: DownloadedState::Waiting,
            progress: None,
            last_modified: None,
        }
    }

    /// Copy of this record in `state`, with progress cleared.
    pub fn with_state(&self, state: DownloadedState) -> Self {
        Self { state, progress: None, ..self.clone() }
    }

    /// Copy of this record marked as downloaded with the measured size.
    pub fn downloaded(&self, size: u64) -> Self {
        Self { size, ..self.with_state(DownloadedState::Downloaded) }
    }

    /// Path of the partial file written while the transfer is running.
    /// e.g. "/dir/abc.mp4" becomes "/dir/abc.mp4.part"
    pub fn temporary_path(&self) -> PathBuf {
        temporary_path(&self.path)
    }
}

pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}
