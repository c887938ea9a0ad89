use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadCleanupPolicy {
    DeleteAfterInstall,
    KeepOneVersion,
    KeepTwoVersions,
    KeepAllVersions,
}

impl DownloadCleanupPolicy {
    /// Number of versions per package kept by the versioned policies.
    pub fn keep_count(&self) -> Option<usize> {
        match self {
            Self::KeepOneVersion => Some(1),
            Self::KeepTwoVersions => Some(2),
            Self::DeleteAfterInstall | Self::KeepAllVersions => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub rclone_path: String,
    pub adb_path: String,
    pub downloads_location: String,
    pub backups_location: String,
    pub bandwidth_limit: String,
    pub cleanup_policy: DownloadCleanupPolicy,
    /// Also write `release.json` next to downloads for third-party tools.
    pub write_legacy_release_json: bool,
    /// Reinstall with data backup when an update conflicts with the installed signature.
    pub auto_reinstall_on_conflict: bool,
    /// Read once at startup.
    pub network_lane_concurrency: usize,
    pub network_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub command_retry_attempts: u32,
    pub device_poll_interval_ms: u64,
    pub access_test_timeout_ms: u64,
    pub catalog_refresh_interval_secs: u64,
    pub recent_tasks_limit: usize,
    pub installation_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        let downloads_root = dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let backups_root = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            rclone_path: "rclone".to_string(),
            adb_path: "".to_string(),
            downloads_location: downloads_root.join("HeadsetEngine").to_string_lossy().to_string(),
            backups_location: backups_root
                .join("HeadsetEngine_backups")
                .to_string_lossy()
                .to_string(),
            bandwidth_limit: "".to_string(),
            cleanup_policy: DownloadCleanupPolicy::DeleteAfterInstall,
            write_legacy_release_json: false,
            auto_reinstall_on_conflict: true,
            network_lane_concurrency: 2,
            network_retry_attempts: 3,
            retry_backoff_ms: 500,
            command_retry_attempts: 2,
            device_poll_interval_ms: 3000,
            access_test_timeout_ms: 5000,
            catalog_refresh_interval_secs: 30 * 60,
            recent_tasks_limit: 50,
            installation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Settings {
    pub fn downloads_location(&self) -> PathBuf {
        PathBuf::from(&self.downloads_location)
    }

    pub fn backups_location(&self) -> PathBuf {
        PathBuf::from(&self.backups_location)
    }

    /// Clamped network lane size.
    pub fn network_lanes(&self) -> usize {
        self.network_lane_concurrency.clamp(1, 8)
    }

    /// Settings rooted in `root`, used by tests and portable setups.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            downloads_location: root.join("downloads").to_string_lossy().to_string(),
            backups_location: root.join("backups").to_string_lossy().to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"adb_path": "/opt/adb", "network_lane_concurrency": 40}"#)
                .unwrap();
        assert_eq!(settings.adb_path, "/opt/adb");
        assert_eq!(settings.network_retry_attempts, 3);
        assert_eq!(settings.network_lanes(), 8);
        assert_eq!(settings.cleanup_policy, DownloadCleanupPolicy::DeleteAfterInstall);
    }

    #[test]
    fn keep_counts() {
        assert_eq!(DownloadCleanupPolicy::KeepTwoVersions.keep_count(), Some(2));
        assert_eq!(DownloadCleanupPolicy::KeepAllVersions.keep_count(), None);
    }
}
