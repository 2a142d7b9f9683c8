// src/catalog.rs

//! Turning catalog blocks into queue records, and folding queue state back
//! into per-section status for course screens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{DownloadRecord, DownloadedState, FileType};

/// A downloadable unit as described by the course catalog, with the URL of
/// the preferred quality already chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadableBlock {
    pub id: String,
    pub title: String,
    pub file_type: FileType,
    pub url: String,
    /// Size announced by the catalog, 0 when unknown.
    pub size: u64,
    pub last_modified: Option<String>,
}

/// Name of the local file for `url`: the SHA-256 of the URL plus the URL's
/// extension, so the same source always lands at the same path.
pub fn file_name_for(url: &str, file_type: FileType) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let extension = url_extension(url).unwrap_or_else(|| file_type.default_extension().to_string());
    format!("{:x}.{}", digest, extension)
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let name = parsed.path().rsplit('/').next()?;
    let (stem, extension) = name.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && !extension.is_empty()
        && extension.len() <= 5
        && extension.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| extension.to_ascii_lowercase())
}

/// Queue record for `block`, stored under `folder`. Blocks without a URL
/// have nothing to download.
pub fn record_for_block(folder: &Path, block: &DownloadableBlock, course_id: &str) -> Option<DownloadRecord> {
    if block.url.is_empty() {
        return None;
    }
    let path = folder.join(file_name_for(&block.url, block.file_type));
    let mut record = DownloadRecord::new(
        block.id.clone(),
        course_id,
        block.title.clone(),
        block.url.clone(),
        path,
        block.size,
        block.file_type,
    );
    record.last_modified = block.last_modified.clone();
    Some(record)
}

/// Totals behind a "download this course" prompt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadSizeSummary {
    /// Every section is either downloaded or in the queue.
    pub all_downloaded_or_downloading: bool,
    pub remaining_count: usize,
    pub remaining_size: u64,
    pub all_count: usize,
    pub all_size: u64,
}

/// Downloadable children of each section of one course.
#[derive(Debug, Clone)]
pub struct CourseDownloads {
    course_id: String,
    folder: PathBuf,
    blocks: HashMap<String, DownloadableBlock>,
    groups: Vec<(String, Vec<String>)>,
}

impl CourseDownloads {
    pub fn new(course_id: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        Self {
            course_id: course_id.into(),
            folder: folder.into(),
            blocks: HashMap::new(),
            groups: Vec::new(),
        }
    }

    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    /// Registers the downloadable children of a section. Adding the same
    /// section again appends to it.
    pub fn add_group(&mut self, group_id: impl Into<String>, children: Vec<DownloadableBlock>) {
        let group_id = group_id.into();
        let ids: Vec<String> = children.iter().map(|b| b.id.clone()).collect();
        for block in children {
            self.blocks.insert(block.id.clone(), block);
        }
        match self.groups.iter_mut().find(|(id, _)| *id == group_id) {
            Some((_, existing)) => existing.extend(ids),
            None => self.groups.push((group_id, ids)),
        }
    }

    pub fn child_ids(&self, group_id: &str) -> Vec<String> {
        self.groups
            .iter()
            .find(|(id, _)| id == group_id)
            .map(|(_, children)| children.clone())
            .unwrap_or_default()
    }

    pub fn all_child_ids(&self) -> Vec<String> {
        self.groups.iter().flat_map(|(_, children)| children.iter().cloned()).collect()
    }

    /// Records to enqueue for one section, leaving out what is already
    /// downloaded.
    pub fn records_for_group(&self, group_id: &str, existing: &[DownloadRecord]) -> Vec<DownloadRecord> {
        self.records_for(&self.child_ids(group_id), existing)
    }

    pub fn records_for_all(&self, existing: &[DownloadRecord]) -> Vec<DownloadRecord> {
        self.records_for(&self.all_child_ids(), existing)
    }

    fn records_for(&self, ids: &[String], existing: &[DownloadRecord]) -> Vec<DownloadRecord> {
        let downloaded: Vec<&str> = existing
            .iter()
            .filter(|r| r.state.is_downloaded())
            .map(|r| r.id.as_str())
            .collect();
        ids.iter()
            .filter(|id| !downloaded.contains(&id.as_str()))
            .filter_map(|id| self.blocks.get(id))
            .filter_map(|block| record_for_block(&self.folder, block, &self.course_id))
            .collect()
    }

    /// State of every child block and every section, given the queue.
    ///
    /// A section is downloading while any child is queued, downloaded once all
    /// of its children are, and not downloaded otherwise.
    pub fn statuses(&self, records: &[DownloadRecord]) -> HashMap<String, DownloadedState> {
        let by_id: HashMap<&str, &DownloadRecord> = records.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut statuses = HashMap::new();

        for (group_id, children) in &self.groups {
            let mut downloading = 0;
            let mut downloaded = 0;
            for child in children {
                let state = match by_id.get(child.as_str()).map(|r| r.state) {
                    Some(state) if state.is_waiting_or_downloading() => {
                        downloading += 1;
                        DownloadedState::Downloading
                    }
                    Some(DownloadedState::Downloaded) => {
                        downloaded += 1;
                        DownloadedState::Downloaded
                    }
                    _ => DownloadedState::NotDownloaded,
                };
                statuses.insert(child.clone(), state);
            }

            let group_state = if downloading > 0 {
                DownloadedState::Downloading
            } else if !children.is_empty() && downloaded == children.len() {
                DownloadedState::Downloaded
            } else {
                DownloadedState::NotDownloaded
            };
            statuses.insert(group_id.clone(), group_state);
        }
        statuses
    }

    pub fn summary(&self, records: &[DownloadRecord]) -> DownloadSizeSummary {
        let statuses = self.statuses(records);
        let state_of = |id: &str| statuses.get(id).copied().unwrap_or(DownloadedState::NotDownloaded);
        let mut summary = DownloadSizeSummary { all_downloaded_or_downloading: true, ..Default::default() };

        for (group_id, children) in &self.groups {
            if state_of(group_id) == DownloadedState::NotDownloaded {
                summary.all_downloaded_or_downloading = false;
            }
            for child in children {
                let size = self.blocks.get(child).map(|b| b.size).unwrap_or(0);
                summary.all_count += 1;
                summary.all_size = summary.all_size.saturating_add(size);
                if state_of(child) != DownloadedState::Downloaded {
                    summary.remaining_count += 1;
                    summary.remaining_size = summary.remaining_size.saturating_add(size);
                }
            }
        }
        summary
    }
}
