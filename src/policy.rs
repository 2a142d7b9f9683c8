// src/policy.rs

use crate::config::QueueConfig;
use crate::models::DownloadRecord;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why a download request was not admitted. The messages are meant to be
/// shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("You are offline. Connect to the internet to download.")]
    NoConnection,
    #[error("Connect to Wi-Fi to download, or turn off \"Download only on Wi-Fi\".")]
    WifiRequired,
    #[error("Not enough free space: {required} bytes needed, {available} bytes available.")]
    InsufficientStorage { required: u64, available: u64 },
    #[error("This download is {size} bytes. Confirm to download it over cellular data.")]
    CellularConfirmationRequired { size: u64 },
}

/// Connectivity class reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    Offline,
    Wifi,
    Cellular,
}

pub trait NetworkMonitor: Send + Sync {
    fn connection(&self) -> ConnectionKind;
}

pub trait PreferenceStore: Send + Sync {
    fn wifi_only(&self) -> bool;
}

pub trait StorageProbe: Send + Sync {
    /// Free bytes on the volume holding `dir`, `None` if it cannot be told.
    fn free_bytes(&self, dir: &Path) -> Option<u64>;
}

/// A network monitor that always reports the same connection.
#[derive(Debug, Clone, Copy)]
pub struct FixedNetwork(pub ConnectionKind);

impl NetworkMonitor for FixedNetwork {
    fn connection(&self) -> ConnectionKind {
        self.0
    }
}

/// In-memory preferences, toggled at runtime.
#[derive(Debug, Default)]
pub struct SharedPreferences {
    wifi_only: AtomicBool,
}

impl SharedPreferences {
    pub fn new(wifi_only: bool) -> Self {
        Self { wifi_only: AtomicBool::new(wifi_only) }
    }

    pub fn set_wifi_only(&self, value: bool) {
        self.wifi_only.store(value, Ordering::SeqCst);
    }
}

impl PreferenceStore for SharedPreferences {
    fn wifi_only(&self) -> bool {
        self.wifi_only.load(Ordering::SeqCst)
    }
}

/// Storage probe for platforms without a free-space query; skips the check.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownStorage;

impl StorageProbe for UnknownStorage {
    fn free_bytes(&self, _dir: &Path) -> Option<u64> {
        None
    }
}

/// Checks a batch of records against connectivity, free space and user
/// preferences before it is admitted to the queue.
#[derive(Clone)]
pub struct AdmissionPolicy {
    network: Arc<dyn NetworkMonitor>,
    preferences: Arc<dyn PreferenceStore>,
    storage: Arc<dyn StorageProbe>,
    max_cellular_bytes: u64,
    storage_factor: u64,
}

impl AdmissionPolicy {
    pub fn new(
        network: Arc<dyn NetworkMonitor>,
        preferences: Arc<dyn PreferenceStore>,
        storage: Arc<dyn StorageProbe>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            network,
            preferences,
            storage,
            max_cellular_bytes: config.max_cellular_bytes,
            storage_factor: config.storage_factor,
        }
    }

    /// `cellular_confirmed` is set when the user already agreed to a large
    /// download over cellular data.
    pub fn check(
        &self,
        records: &[DownloadRecord],
        download_dir: &Path,
        cellular_confirmed: bool,
    ) -> Result<(), PolicyError> {
        let total = records.iter().map(|r| r.size).fold(0u64, u64::saturating_add);
        let connection = self.network.connection();

        if connection == ConnectionKind::Offline {
            return Err(PolicyError::NoConnection);
        }
        if let Some(available) = self.storage.free_bytes(download_dir) {
            let required = total.saturating_mul(self.storage_factor);
            if available < required {
                return Err(PolicyError::InsufficientStorage { required, available });
            }
        }
        let wifi_only = self.preferences.wifi_only();
        if wifi_only && connection != ConnectionKind::Wifi {
            return Err(PolicyError::WifiRequired);
        }
        if !wifi_only
            && connection == ConnectionKind::Cellular
            && total >= self.max_cellular_bytes
            && !cellular_confirmed
        {
            return Err(PolicyError::CellularConfirmationRequired { size: total });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;

    struct FixedStorage(u64);

    impl StorageProbe for FixedStorage {
        fn free_bytes(&self, _dir: &Path) -> Option<u64> {
            Some(self.0)
        }
    }

    fn policy(connection: ConnectionKind, wifi_only: bool, free: Option<u64>) -> AdmissionPolicy {
        let storage: Arc<dyn StorageProbe> = match free {
            Some(bytes) => Arc::new(FixedStorage(bytes)),
            None => Arc::new(UnknownStorage),
        };
        AdmissionPolicy::new(
            Arc::new(FixedNetwork(connection)),
            Arc::new(SharedPreferences::new(wifi_only)),
            storage,
            &QueueConfig::default(),
        )
    }

    fn records(size: u64) -> Vec<DownloadRecord> {
        vec![DownloadRecord::new("v1", "c1", "Intro", "http://x/v1.mp4", "/tmp/v1.mp4", size, FileType::Video)]
    }

    #[test]
    fn wifi_only_blocks_cellular() {
        let result = policy(ConnectionKind::Cellular, true, None).check(&records(10), Path::new("/tmp"), false);
        assert_eq!(result, Err(PolicyError::WifiRequired));
    }

    #[test]
    fn wifi_only_allows_wifi() {
        assert!(policy(ConnectionKind::Wifi, true, None).check(&records(10), Path::new("/tmp"), false).is_ok());
    }

    #[test]
    fn offline_is_checked_first() {
        let result = policy(ConnectionKind::Offline, true, Some(0)).check(&records(10), Path::new("/tmp"), false);
        assert_eq!(result, Err(PolicyError::NoConnection));
    }

    #[test]
    fn free_space_must_cover_twice_the_size() {
        let result = policy(ConnectionKind::Wifi, false, Some(1500)).check(&records(1000), Path::new("/tmp"), false);
        assert_eq!(result, Err(PolicyError::InsufficientStorage { required: 2000, available: 1500 }));
        assert!(policy(ConnectionKind::Wifi, false, Some(2000)).check(&records(1000), Path::new("/tmp"), false).is_ok());
    }

    #[test]
    fn large_cellular_download_needs_confirmation() {
        let big = records(150_000_000);
        let p = policy(ConnectionKind::Cellular, false, None);
        assert_eq!(
            p.check(&big, Path::new("/tmp"), false),
            Err(PolicyError::CellularConfirmationRequired { size: 150_000_000 })
        );
        assert!(p.check(&big, Path::new("/tmp"), true).is_ok());
        assert!(p.check(&records(1000), Path::new("/tmp"), false).is_ok());
    }

    #[test]
    fn oversized_catalog_sizes_saturate() {
        let mut huge = records(u64::MAX);
        huge.extend(records(u64::MAX));
        let result = policy(ConnectionKind::Wifi, false, Some(1000)).check(&huge, Path::new("/tmp"), false);
        assert_eq!(result, Err(PolicyError::InsufficientStorage { required: u64::MAX, available: 1000 }));
    }

    #[test]
    fn preferences_can_change_at_runtime() {
        let prefs = Arc::new(SharedPreferences::new(false));
        let p = AdmissionPolicy::new(
            Arc::new(FixedNetwork(ConnectionKind::Cellular)),
            prefs.clone(),
            Arc::new(UnknownStorage),
            &QueueConfig::default(),
        );
        assert!(p.check(&records(10), Path::new("/tmp"), false).is_ok());
        prefs.set_wifi_only(true);
        assert_eq!(p.check(&records(10), Path::new("/tmp"), false), Err(PolicyError::WifiRequired));
    }
}
