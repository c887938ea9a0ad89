use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::models::CatalogApp;

pub const METADATA_FILE: &str = "metadata.json";
pub const LEGACY_RELEASE_FILE: &str = "release.json";

#[derive(Debug, Serialize)]
struct DownloadMetadata<'a> {
    format_version: u32,
    full_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    package_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version_code: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    downloaded_at: String,
}

#[derive(Debug, Serialize)]
struct LegacyReleaseJson<'a> {
    #[serde(rename = "GameName")]
    game_name: &'a str,
    #[serde(rename = "ReleaseName")]
    release_name: &'a str,
    #[serde(rename = "PackageName")]
    package_name: &'a str,
    #[serde(rename = "VersionCode")]
    version_code: u64,
    #[serde(rename = "LastUpdated")]
    last_updated: &'a str,
    /// Megabytes
    #[serde(rename = "GameSize")]
    game_size: u64,
}

/// Writes `metadata.json` for a finished download and, if asked, the legacy `release.json`.
#[instrument(skip(app), fields(dir = %dst_dir.display()), err)]
pub async fn write_download_metadata(
    app: Option<&CatalogApp>,
    full_name: &str,
    dst_dir: &Path,
    write_legacy_release: bool,
) -> Result<()> {
    let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();

    let meta = DownloadMetadata {
        format_version: 1,
        full_name,
        app_name: app.map(|a| a.app_name.as_str()),
        package_name: app.map(|a| a.package_name.as_str()),
        version_code: app.map(|a| a.version_code),
        last_updated: app.map(|a| a.last_updated.as_str()),
        size: app.map(|a| a.size_bytes),
        downloaded_at: now,
    };

    let json = serde_json::to_string_pretty(&meta)?;
    let meta_path = dst_dir.join(METADATA_FILE);
    fs::write(&meta_path, json)
        .await
        .with_context(|| format!("Failed to write {}", meta_path.display()))?;
    info!(path = %meta_path.display(), "Wrote download metadata");

    if write_legacy_release {
        let Some(app) = app else {
            warn!(full_name, "Could not write legacy release.json: release not in catalog");
            return Ok(());
        };
        let legacy = LegacyReleaseJson {
            game_name: &app.app_name,
            release_name: full_name,
            package_name: &app.package_name,
            version_code: app.version_code,
            last_updated: &app.last_updated,
            game_size: app.size_bytes / 1_000_000,
        };
        let legacy_path = dst_dir.join(LEGACY_RELEASE_FILE);
        fs::write(&legacy_path, serde_json::to_string_pretty(&legacy)?)
            .await
            .with_context(|| format!("Failed to write {}", legacy_path.display()))?;
        info!(path = %legacy_path.display(), "Wrote legacy release.json");
    }

    Ok(())
}

/// What the download cache needs to know about a downloaded release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadInfo {
    pub downloaded_at: Option<u64>,
    pub package_name: Option<String>,
    pub version_code: Option<u64>,
}

#[derive(Deserialize)]
struct DownloadMetaPartial {
    downloaded_at: Option<String>,
    #[serde(alias = "PackageName")]
    package_name: Option<String>,
    #[serde(alias = "VersionCode")]
    version_code: Option<u64>,
}

impl From<DownloadMetaPartial> for DownloadInfo {
    fn from(meta: DownloadMetaPartial) -> Self {
        Self {
            downloaded_at: meta.downloaded_at.as_deref().and_then(rfc3339_to_millis),
            package_name: meta.package_name,
            version_code: meta.version_code,
        }
    }
}

fn rfc3339_to_millis(value: &str) -> Option<u64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000).max(0) as u64)
}

/// Whether `dir` looks like a downloaded release.
pub fn has_download_metadata(dir: &Path) -> bool {
    dir.join(METADATA_FILE).is_file() || dir.join(LEGACY_RELEASE_FILE).is_file()
}

/// Reads `metadata.json`, falling back to `release.json`. Unreadable files yield empty info.
pub async fn read_download_metadata(dir: &Path) -> DownloadInfo {
    for name in [METADATA_FILE, LEGACY_RELEASE_FILE] {
        let path = dir.join(name);
        let Ok(text) = fs::read_to_string(&path).await else {
            continue;
        };
        match serde_json::from_str::<DownloadMetaPartial>(&text) {
            Ok(meta) => return meta.into(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable download metadata")
            }
        }
    }
    DownloadInfo::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> CatalogApp {
        CatalogApp {
            app_name: "Example Game".into(),
            full_name: "Example Game v42+1.2.3".into(),
            package_name: "com.example.game".into(),
            version_code: 42,
            last_updated: "2024-03-01 10:00 UTC".into(),
            size_bytes: 2_500_000_000,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let app = app();
        write_download_metadata(Some(&app), &app.full_name, dir.path(), false).await.unwrap();

        assert!(has_download_metadata(dir.path()));
        assert!(!dir.path().join(LEGACY_RELEASE_FILE).exists());
        let info = read_download_metadata(dir.path()).await;
        assert_eq!(info.package_name.as_deref(), Some("com.example.game"));
        assert_eq!(info.version_code, Some(42));
        assert!(info.downloaded_at.unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn legacy_release_json_uses_megabytes() {
        let dir = tempfile::tempdir().unwrap();
        let app = app();
        write_download_metadata(Some(&app), &app.full_name, dir.path(), true).await.unwrap();

        let legacy: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(LEGACY_RELEASE_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(legacy["GameSize"], 2500);
        assert_eq!(legacy["ReleaseName"], "Example Game v42+1.2.3");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn legacy_only_directories_are_understood() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(LEGACY_RELEASE_FILE),
            r#"{"PackageName": "com.example.other", "VersionCode": 7}"#,
        )
        .unwrap();
        let info = read_download_metadata(dir.path()).await;
        assert_eq!(info.package_name.as_deref(), Some("com.example.other"));
        assert_eq!(info.version_code, Some(7));
        assert_eq!(info.downloaded_at, None);
    }
}
