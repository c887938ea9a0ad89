use std::{
    collections::{BTreeMap, HashSet},
    error::Error,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::{fs, sync::watch};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    downloader::{has_download_metadata, read_download_metadata},
    error::EngineError,
    events::{EngineEvent, EventBus},
    models::{DeleteSummary, DownloadCleanupPolicy, DownloadEntry, Settings},
    utils::{dir_size, ensure_inside, system_time_to_millis},
};

/// Scratch directory for donation archives inside the downloads root.
pub const UPLOAD_TMP_DIR: &str = "_upload";

/// The local downloads directory: one subdirectory per downloaded release.
#[derive(Debug, Clone)]
pub struct DownloadsCatalog {
    settings: watch::Receiver<Settings>,
    events: EventBus,
}

impl DownloadsCatalog {
    pub fn new(settings: watch::Receiver<Settings>, events: EventBus) -> Self {
        Self { settings, events }
    }

    pub fn downloads_location(&self) -> PathBuf {
        self.settings.borrow().downloads_location()
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_downloads(&self) -> Result<Vec<DownloadEntry>> {
        let root = self.downloads_location();
        let mut entries: Vec<DownloadEntry> = Vec::new();
        if !root.is_dir() {
            return Ok(entries);
        }
        let mut rd = fs::read_dir(&root)
            .await
            .with_context(|| format!("Failed to read {}", root.display()))?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(UPLOAD_TMP_DIR) {
                continue;
            }
            match entry.file_type().await {
                Ok(t) if t.is_dir() => {}
                _ => continue,
            }
            if let Some(e) = build_download_entry(&path).await {
                entries.push(e);
            }
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Deletes one downloaded release. The path must be a directory inside the downloads root.
    #[instrument(skip(self), err)]
    pub async fn delete_download(&self, path: &Path) -> Result<()> {
        self.delete_inner(path).await?;
        self.events.publish(EngineEvent::DownloadsChanged);
        Ok(())
    }

    async fn delete_inner(&self, path: &Path) -> Result<()> {
        let root = self.downloads_location();
        let target = ensure_inside(&root, path, "downloads")
            .await
            .map_err(|e| anyhow!(EngineError::validation(format!("{e:#}"))))?;
        ensure!(target.is_dir(), EngineError::validation("Download path is not a directory"));
        info!(path = %target.display(), "Deleting download directory");
        fs::remove_dir_all(&target).await.context("Failed to delete download directory")?;
        Ok(())
    }

    /// Deletes every downloaded release. Directories without download metadata are skipped.
    #[instrument(skip(self), err, ret)]
    pub async fn delete_all_downloads(&self) -> Result<DeleteSummary> {
        info!("Deleting all downloads");
        let mut summary = DeleteSummary::default();
        for entry in self.list_downloads().await? {
            let dir = PathBuf::from(&entry.path);
            if !has_download_metadata(&dir) {
                warn!(path = %dir.display(), "Not deleting download: no metadata file found");
                summary.skipped += 1;
                continue;
            }
            match self.delete_inner(&dir).await {
                Ok(()) => summary.removed += 1,
                Err(e) => {
                    error!(error = e.as_ref() as &dyn Error, path = %dir.display(), "Failed to delete download");
                    summary.skipped += 1;
                }
            }
        }
        if summary.removed > 0 {
            self.events.publish(EngineEvent::DownloadsChanged);
        }
        Ok(summary)
    }

    /// Applies the cleanup policy after `installed` (a downloaded release directory) was installed.
    ///
    /// Versioned policies only look at releases of the installed package. Individual
    /// deletion failures are logged and skipped.
    #[instrument(skip(self), fields(installed = %installed.display()), err)]
    pub async fn apply_cleanup_policy(
        &self,
        policy: DownloadCleanupPolicy,
        installed: &Path,
    ) -> Result<DeleteSummary> {
        let mut summary = DeleteSummary::default();
        let to_remove: Vec<PathBuf> = match policy {
            DownloadCleanupPolicy::KeepAllVersions => {
                debug!("Cleanup policy: keep all versions, nothing to do");
                return Ok(summary);
            }
            DownloadCleanupPolicy::DeleteAfterInstall => {
                if !installed.exists() {
                    debug!("Downloaded directory no longer exists");
                    return Ok(summary);
                }
                vec![installed.to_path_buf()]
            }
            DownloadCleanupPolicy::KeepOneVersion | DownloadCleanupPolicy::KeepTwoVersions => {
                let keep = policy.keep_count().unwrap_or(usize::MAX);
                let info = read_download_metadata(installed).await;
                let Some(package) = info.package_name else {
                    warn!("Installed release has no package metadata, skipping cleanup");
                    return Ok(summary);
                };
                let entries: Vec<DownloadEntry> = self
                    .list_downloads()
                    .await?
                    .into_iter()
                    .filter(|e| e.package_name.as_deref() == Some(package.as_str()))
                    .collect();
                let installed = installed.to_string_lossy();
                plan_cleanup(&entries, keep, Some(&installed))
                    .into_iter()
                    .map(|e| PathBuf::from(&e.path))
                    .collect()
            }
        };

        for path in to_remove {
            match self.delete_inner(&path).await {
                Ok(()) => {
                    info!(removed = %path.display(), "Removed downloaded release");
                    summary.removed += 1;
                }
                Err(e) => {
                    warn!(error = e.as_ref() as &dyn Error, path = %path.display(), "Failed to remove downloaded release");
                    summary.skipped += 1;
                }
            }
        }
        if summary.removed > 0 {
            self.events.publish(EngineEvent::DownloadsChanged);
        }
        Ok(summary)
    }
}

/// Entries to delete so that at most `keep` releases per package remain.
///
/// Releases are ranked by version code, newest first; the `pinned` path is always kept and
/// counts towards `keep`. Entries without a package name are never deleted.
pub fn plan_cleanup<'a>(
    entries: &'a [DownloadEntry],
    keep: usize,
    pinned: Option<&str>,
) -> Vec<&'a DownloadEntry> {
    let mut groups: BTreeMap<&str, Vec<&DownloadEntry>> = BTreeMap::new();
    for entry in entries {
        if let Some(package) = entry.package_name.as_deref() {
            groups.entry(package).or_default().push(entry);
        }
    }

    let mut remove = Vec::new();
    for (package, mut group) in groups {
        group.sort_by(|a, b| {
            b.version_code.cmp(&a.version_code).then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        let mut kept: HashSet<&str> = HashSet::new();
        if let Some(pinned) = pinned
            && group.iter().any(|e| e.path == pinned)
        {
            kept.insert(pinned);
        }
        for entry in &group {
            if kept.len() >= keep {
                break;
            }
            kept.insert(entry.path.as_str());
        }
        trace!(package, kept = ?kept, "Planned cleanup");
        remove.extend(group.into_iter().filter(|e| !kept.contains(e.path.as_str())));
    }
    remove
}

#[instrument(level = "trace", fields(dir = %dir.display()))]
async fn build_download_entry(dir: &Path) -> Option<DownloadEntry> {
    let name = dir.file_name()?.to_str()?.to_string();
    let info = read_download_metadata(dir).await;

    let mut timestamp = info.downloaded_at.unwrap_or(0);
    if timestamp == 0
        && let Ok(meta) = fs::metadata(dir).await
        && let Ok(modified) = meta.modified()
    {
        timestamp = system_time_to_millis(modified);
    }

    let total_size = dir_size(dir).await.unwrap_or(0);
    Some(DownloadEntry {
        path: dir.to_string_lossy().to_string(),
        name,
        timestamp,
        total_size,
        package_name: info.package_name,
        version_code: info.version_code,
    })
}
