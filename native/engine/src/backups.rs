use std::{
    error::Error,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail, ensure};
use time::{OffsetDateTime, format_description::well_known::Rfc3339, macros::format_description};
use tokio::{fs, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    adb::{AdbDevice, PACKAGE_NAME_REGEX, PackageName},
    error::{EngineError, ErrorKind, kind_of},
    events::{EngineEvent, EventBus},
    models::{
        BackupEntry, BackupManifest, BackupPart, BackupParts, DeleteSummary, PartFailure, Settings,
    },
    utils::{
        dir_has_any_files, dir_size, ensure_inside, files_with_extension, first_subdirectory,
        remove_child_dir_if_exists, single_subdirectory, system_time_to_millis,
    },
};

const MARKER_FILE: &str = ".backup";
const MANIFEST_FILE: &str = "backup.json";
const MANIFEST_FORMAT_VERSION: u32 = 1;
const BACKUP_TMP: &str = "/sdcard/backup_tmp";

/// Options to control backup behavior
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub parts: BackupParts,
    /// Appended to the directory name, e.g. `reinstall`
    pub name_suffix: Option<String>,
    /// Human readable name used instead of the package name
    pub display_name: Option<String>,
    /// Fail when run-as is refused instead of skipping private data
    pub require_private_data: bool,
}

/// Parts found in a backup directory, checked before a restore touches the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupShape {
    pub apk: Option<PathBuf>,
    pub private_data: Option<PathBuf>,
    pub shared_data: Option<PathBuf>,
    pub obb: Option<PathBuf>,
}

impl BackupShape {
    fn is_empty(&self) -> bool {
        self.apk.is_none()
            && self.private_data.is_none()
            && self.shared_data.is_none()
            && self.obb.is_none()
    }

    /// Package name inferred from the part subdirectories
    fn inferred_package(&self) -> Option<String> {
        [&self.private_data, &self.shared_data, &self.obb]
            .into_iter()
            .flatten()
            .filter_map(|dir| dir.file_name().and_then(|n| n.to_str()))
            .find(|name| PACKAGE_NAME_REGEX.is_match(name))
            .map(str::to_string)
    }
}

/// Outcome of capturing a single part
enum Capture {
    Captured,
    Absent(String),
}

/// Creates, lists, restores and deletes app backups under the configured backups root.
#[derive(Debug, Clone)]
pub struct BackupManager {
    settings: watch::Receiver<Settings>,
    events: EventBus,
}

impl BackupManager {
    pub fn new(settings: watch::Receiver<Settings>, events: EventBus) -> Self {
        Self { settings, events }
    }

    pub fn backups_location(&self) -> PathBuf {
        self.settings.borrow().backups_location()
    }

    /// Creates a backup and fails if no requested part could be captured.
    pub async fn create_backup(
        &self,
        device: &AdbDevice,
        package: &PackageName,
        options: &BackupOptions,
        token: &CancellationToken,
    ) -> Result<BackupEntry> {
        self.try_create_backup(device, package, options, token).await?.ok_or_else(|| {
            EngineError::Execution(format!("Nothing to back up for {package}")).into()
        })
    }

    /// Creates a backup of the given package.
    /// Returns `Ok(None)` (and leaves nothing behind) if there was nothing to back up.
    #[instrument(skip(self, device, token), fields(device = %device), err)]
    pub async fn try_create_backup(
        &self,
        device: &AdbDevice,
        package: &PackageName,
        options: &BackupOptions,
        token: &CancellationToken,
    ) -> Result<Option<BackupEntry>> {
        ensure!(
            !options.parts.is_empty(),
            EngineError::validation("At least one backup part must be selected")
        );
        ensure!(
            !options.require_private_data || options.parts.private_data,
            EngineError::validation("require_private_data requires private data to be selected")
        );

        let backups_location = self.backups_location();
        fs::create_dir_all(&backups_location).await.with_context(|| {
            format!("Failed to create backups directory {}", backups_location.display())
        })?;

        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let backup_path = backups_location.join(backup_dir_name(
            now,
            package,
            options.display_name.as_deref(),
            options.name_suffix.as_deref(),
        ));
        let backup_path = create_unique_dir(&backup_path).await?;
        info!(path = %backup_path.display(), parts = %options.parts, "Creating app backup");

        let mut captured = Vec::new();
        let mut failed = Vec::new();
        for part in options.parts.iter() {
            let result = match part {
                BackupPart::PrivateData => {
                    self.capture_private_data(device, package, &backup_path, options, token).await
                }
                BackupPart::SharedData => {
                    capture_remote_dir(
                        device,
                        &format!("/sdcard/Android/data/{package}"),
                        &backup_path.join("data"),
                        &backup_path,
                        token,
                    )
                    .await
                }
                BackupPart::Obb => {
                    capture_remote_dir(
                        device,
                        &format!("/sdcard/Android/obb/{package}"),
                        &backup_path.join("obb"),
                        &backup_path,
                        token,
                    )
                    .await
                }
                BackupPart::Apk => capture_apk(device, package, &backup_path, token).await,
            };
            match result {
                Ok(Capture::Captured) => {
                    debug!(%part, "Captured backup part");
                    captured.push(part);
                }
                Ok(Capture::Absent(reason)) => {
                    debug!(%part, reason, "Backup part not captured");
                    failed.push(PartFailure { part, reason });
                }
                Err(e) => {
                    // Cancellation already removed the directory
                    if !matches!(kind_of(&e), Some(ErrorKind::Cancelled)) {
                        let _ = fs::remove_dir_all(&backup_path).await;
                    }
                    return Err(e.context(format!("Failed to back up {part}")));
                }
            }
        }

        if captured.is_empty() {
            info!("Nothing backed up, cleaning up empty directory");
            let _ = fs::remove_dir_all(&backup_path).await;
            return Ok(None);
        }

        let manifest = BackupManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            package_name: package.to_string(),
            display_name: options.display_name.clone(),
            created_at: now.format(&Rfc3339).unwrap_or_default(),
            requested: options.parts.iter().collect(),
            captured,
            failed,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(backup_path.join(MANIFEST_FILE), manifest_json)
            .await
            .context("Failed to write backup manifest")?;
        fs::File::create(backup_path.join(MARKER_FILE))
            .await
            .context("Failed to write backup marker")?;

        info!(path = %backup_path.display(), "Backup created successfully");
        self.events.publish(EngineEvent::BackupsChanged);
        build_entry(&backup_path).await.map(Some)
    }

    /// Private data via run-as, piped through tar because run-as has odd permissions
    async fn capture_private_data(
        &self,
        device: &AdbDevice,
        package: &PackageName,
        backup_path: &Path,
        options: &BackupOptions,
        token: &CancellationToken,
    ) -> Result<Capture> {
        if device.dir_exists(BACKUP_TMP).await? {
            info!("Found old {BACKUP_TMP}, deleting");
            device.shell(&format!("rm -rf {BACKUP_TMP}/")).await?;
        }

        let private_data_backup_path = backup_path.join("data_private");
        fs::create_dir_all(&private_data_backup_path).await?;
        let tmp_pkg = format!("{BACKUP_TMP}/{package}");
        let cmd = format!(
            "mkdir -p '{tmp_pkg}'; run-as {package} tar -cf - -C '/data/data/{package}' . | tar \
             -xvf - -C '{tmp_pkg}'"
        );
        let cleanup_tmp = || async {
            let _ = device.shell(&format!("rm -rf {BACKUP_TMP}/")).await;
        };
        let cmd_output = await_or_cancel_backup(
            token,
            backup_path,
            "run-as private data tar",
            device.shell(&cmd),
            cleanup_tmp(),
        )
        .await?;
        trace!(cmd_output, "Private data tar output");
        if cmd_output.contains("run-as:") {
            cleanup_tmp().await;
            let _ = fs::remove_dir_all(&private_data_backup_path).await;
            let reason = format!("run-as failed: {}", cmd_output.trim());
            if options.require_private_data {
                return Err(EngineError::Execution(format!("Private data backup failed: {reason}"))
                    .into());
            }
            return Ok(Capture::Absent(reason));
        }

        let pulled = await_or_cancel_backup(
            token,
            backup_path,
            "pull private data",
            device.pull_dir(&tmp_pkg, &private_data_backup_path),
            cleanup_tmp(),
        )
        .await;
        cleanup_tmp().await;
        let private_pkg_dir = match pulled {
            Ok(dir) => dir,
            Err(e) if kind_of(&e) == Some(ErrorKind::Execution) => {
                let _ = fs::remove_dir_all(&private_data_backup_path).await;
                return Ok(Capture::Absent(format!("{e:#}")));
            }
            Err(e) => return Err(e),
        };

        if private_pkg_dir.is_dir() {
            let _ = remove_child_dir_if_exists(&private_pkg_dir, "cache").await;
            let _ = remove_child_dir_if_exists(&private_pkg_dir, "code_cache").await;
        }
        if !dir_has_any_files(&private_data_backup_path).await? {
            debug!("No files in pulled private data, deleting");
            let _ = fs::remove_dir_all(&private_data_backup_path).await;
            return Ok(Capture::Absent("no private data".into()));
        }
        Ok(Capture::Captured)
    }

    #[instrument(skip(self), err)]
    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let dir = self.backups_location();
        debug!(dir = %dir.display(), "Listing backups in directory");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        ensure!(
            dir.is_dir(),
            EngineError::state(format!("Backups location is not a directory: {}", dir.display()))
        );

        let mut entries = Vec::new();
        let mut rd = fs::read_dir(&dir).await?;
        while let Some(item) = rd.next_entry().await? {
            let path = item.path();
            if !path.join(MARKER_FILE).is_file() {
                continue;
            }
            trace!(path = %path.display(), "Found backup candidate");
            match build_entry(&path).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(error = e.as_ref() as &dyn Error, path = %path.display(), "Skipping unreadable backup");
                }
            }
        }
        // Newest first
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        debug!(count = entries.len(), "Finished scanning backups");
        Ok(entries)
    }

    /// Validates a backup's shape without touching the device.
    #[instrument(skip(self), err)]
    pub async fn inspect_backup(&self, backup_path: &Path) -> Result<BackupShape> {
        if !backup_path.is_dir() {
            bail!(EngineError::validation(format!(
                "Backup path is not a directory: {}",
                backup_path.display()
            )));
        }
        let shape = BackupShape {
            apk: files_with_extension(backup_path, "apk").await?.into_iter().next(),
            private_data: single_subdirectory(&backup_path.join("data_private")).await?,
            shared_data: single_subdirectory(&backup_path.join("data")).await?,
            obb: single_subdirectory(&backup_path.join("obb")).await?,
        };
        if shape.is_empty() {
            bail!(EngineError::validation(format!(
                "Backup contains no restorable parts: {}",
                backup_path.display()
            )));
        }
        Ok(shape)
    }

    /// Restores a backup. The backup is validated before anything is written to the device.
    #[instrument(skip(self, device), fields(device = %device), err)]
    pub async fn restore(&self, device: &AdbDevice, backup_path: &Path) -> Result<()> {
        let shape = self.inspect_backup(backup_path).await?;

        match &shape.apk {
            Some(apk) => {
                info!(apk = %apk.display(), "Restoring APK");
                device.install_package(apk).await.context("Failed to install APK during restore")?;
            }
            None => {
                // Without an APK the app must already be installed
                let Some(pkg) = shape.inferred_package() else {
                    bail!(EngineError::validation(
                        "Backup does not contain an APK and no package folder was found to infer \
                         the package name"
                    ));
                };
                let pkg = PackageName::parse(&pkg)
                    .context("Inferred invalid package name from backup directory")?;
                device.apk_path(&pkg).await.with_context(|| {
                    format!("Backup does not contain an APK and package '{pkg}' is not installed")
                })?;
            }
        }

        if let Some(pkg_dir) = &shape.obb {
            debug!("Restoring OBB");
            device.push_dir(pkg_dir, "/sdcard/Android/obb", true).await?;
        }

        if let Some(pkg_dir) = &shape.shared_data {
            debug!("Restoring shared data");
            device.push_dir(pkg_dir, "/sdcard/Android/data", true).await?;
        }

        if let Some(pkg_dir) = &shape.private_data {
            let package_name = pkg_dir
                .file_name()
                .and_then(|n| n.to_str())
                .context("Failed to get private data package name")?;

            debug!("Restoring private data");
            let _ = device.shell("rm -rf /sdcard/restore_tmp/").await;
            device.push_dir(pkg_dir, "/sdcard/restore_tmp", false).await?;

            let cmd = format!(
                "tar -cf - -C '/sdcard/restore_tmp/{pkg}/' . | run-as {pkg} tar -xvf - -C \
                 '/data/data/{pkg}/'; rm -rf /sdcard/restore_tmp/",
                pkg = package_name
            );
            let output = device.shell(&cmd).await?;
            if output.contains("run-as:") {
                bail!(EngineError::Execution(format!(
                    "Failed to restore private data: {}",
                    output.trim()
                )));
            }
        }

        info!("Backup restored successfully");
        Ok(())
    }

    /// Deletes one backup. The path must be a marked backup inside the backups root.
    #[instrument(skip(self), err)]
    pub async fn delete(&self, path: &Path) -> Result<()> {
        self.delete_inner(path).await?;
        self.events.publish(EngineEvent::BackupsChanged);
        Ok(())
    }

    async fn delete_inner(&self, path: &Path) -> Result<()> {
        let root = self.backups_location();
        let target = ensure_inside(&root, path, "backups")
            .await
            .map_err(|e| anyhow!(EngineError::validation(format!("{e:#}"))))?;
        ensure!(target.is_dir(), EngineError::validation("Backup path is not a directory"));
        ensure!(
            target.join(MARKER_FILE).exists(),
            EngineError::validation("Backup marker not found (.backup)")
        );

        info!(path = %target.display(), "Deleting backup directory");
        fs::remove_dir_all(&target).await.context("Failed to delete backup directory")?;
        Ok(())
    }

    /// Deletes every listed backup independently. Backups that fail to delete are skipped.
    /// Folders without a marker are not backups and are left alone.
    #[instrument(skip(self), ret, err)]
    pub async fn delete_all(&self) -> Result<DeleteSummary> {
        let root = self.backups_location();
        let mut summary = DeleteSummary::default();
        if !root.is_dir() {
            return Ok(summary);
        }
        let mut rd = fs::read_dir(&root).await?;
        while let Some(item) = rd.next_entry().await? {
            if !item.path().join(MARKER_FILE).is_file() {
                trace!(path = %item.path().display(), "Not a backup, leaving in place");
                continue;
            }
            match self.delete_inner(&item.path()).await {
                Ok(()) => summary.removed += 1,
                Err(e) => {
                    error!(error = e.as_ref() as &dyn Error, path = %item.path().display(), "Failed to delete backup");
                    summary.skipped += 1;
                }
            }
        }
        if summary.removed > 0 {
            self.events.publish(EngineEvent::BackupsChanged);
        }
        Ok(summary)
    }
}

/// `YYYY-MM-DD_HH-MM-SS_<display>[_<suffix>]`, sanitized
fn backup_dir_name(
    now: OffsetDateTime,
    package: &PackageName,
    display_name: Option<&str>,
    suffix: Option<&str>,
) -> String {
    let fmt = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    let timestamp = now.format(&fmt).unwrap_or_else(|_| "0000-00-00_00-00-00".into());
    let display = display_name
        .map(sanitize_filename::sanitize)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| package.to_string());
    let mut directory_name = format!("{timestamp}_{display}");
    if let Some(suffix) = suffix.map(sanitize_filename::sanitize).filter(|s| !s.is_empty()) {
        directory_name.push('_');
        directory_name.push_str(&suffix);
    }
    directory_name
}

/// Creates `base`, or `base_2`, `base_3`, ... when it is taken, so a backup never shares a
/// directory with an earlier one.
async fn create_unique_dir(base: &Path) -> Result<PathBuf> {
    let mut candidate = base.to_path_buf();
    for n in 2u32.. {
        match fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                trace!(path = %candidate.display(), "Backup directory taken");
                let mut name = base.as_os_str().to_os_string();
                name.push(format!("_{n}"));
                candidate = PathBuf::from(name);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create {}", candidate.display()));
            }
        }
    }
    bail!("No free backup directory name for {}", base.display())
}

async fn capture_remote_dir(
    device: &AdbDevice,
    remote: &str,
    local_parent: &Path,
    backup_path: &Path,
    token: &CancellationToken,
) -> Result<Capture> {
    if !device.dir_exists(remote).await? {
        return Ok(Capture::Absent("not present on device".into()));
    }
    let pulled = await_or_cancel_backup(
        token,
        backup_path,
        remote,
        device.pull_dir(remote, local_parent),
        async {},
    )
    .await?;
    if pulled.is_dir() {
        let _ = remove_child_dir_if_exists(&pulled, "cache").await;
    }
    if !dir_has_any_files(local_parent).await? {
        debug!(remote, "No files in pulled directory, deleting");
        let _ = fs::remove_dir_all(local_parent).await;
        return Ok(Capture::Absent("directory is empty".into()));
    }
    Ok(Capture::Captured)
}

async fn capture_apk(
    device: &AdbDevice,
    package: &PackageName,
    backup_path: &Path,
    token: &CancellationToken,
) -> Result<Capture> {
    let apk_remote = match device.apk_path(package).await {
        Ok(path) => path,
        Err(e) if kind_of(&e) == Some(ErrorKind::Execution) || kind_of(&e).is_none() => {
            return Ok(Capture::Absent(format!("{e:#}")));
        }
        Err(e) => return Err(e),
    };
    await_or_cancel_backup(
        token,
        backup_path,
        "pull APK",
        device.pull(&apk_remote, backup_path),
        async {},
    )
    .await?;
    Ok(Capture::Captured)
}

/// Awaits a future or, if cancellation is requested, deletes the incomplete backup directory and
/// runs cleanup, then returns a cancellation error.
#[instrument(level = "debug", skip(token, fut, backup_path, cleanup), fields(op = op_name), err)]
async fn await_or_cancel_backup<T, F, C>(
    token: &CancellationToken,
    backup_path: &Path,
    op_name: &str,
    fut: F,
    cleanup: C,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
    C: Future<Output = ()>,
{
    tokio::select! {
        res = fut => res,
        _ = token.cancelled() => {
            cleanup.await;
            warn!(path = %backup_path.display(), op = op_name, "Backup cancelled, removing incomplete directory");
            let _ = fs::remove_dir_all(backup_path).await;
            Err(EngineError::cancelled(format!("Backup cancelled during: {op_name}")).into())
        }
    }
}

#[instrument(level = "debug", fields(dir = %dir.display()), err)]
async fn build_entry(dir: &Path) -> Result<BackupEntry> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| dir.to_string_lossy().into_owned());

    let mut timestamp = 0u64;
    let mut display_name = name.clone();

    // Parse prefix: YYYY-MM-DD_HH-MM-SS_...
    if name.len() > 20 && name.is_char_boundary(20) && name.as_bytes()[19] == b'_' {
        timestamp = parse_dir_timestamp(&name[0..19]).unwrap_or(0);
        display_name = name[20..].to_string();
    }
    if timestamp == 0
        && let Ok(meta) = fs::metadata(dir).await
        && let Ok(modified) = meta.modified()
    {
        timestamp = system_time_to_millis(modified);
    }

    let manifest = read_manifest(dir).await;
    let (has_apk, has_private_data, has_shared_data, has_obb) = match &manifest {
        Some(m) => {
            let has = |part| m.captured.contains(&part);
            (
                has(BackupPart::Apk),
                has(BackupPart::PrivateData),
                has(BackupPart::SharedData),
                has(BackupPart::Obb),
            )
        }
        None => (
            !files_with_extension(dir, "apk").await?.is_empty(),
            dir.join("data_private").is_dir(),
            dir.join("data").is_dir(),
            dir.join("obb").is_dir(),
        ),
    };
    let total_size = dir_size(dir).await.unwrap_or(0);

    trace!(name = %display_name, timestamp, total_size, "Built backup entry");
    Ok(BackupEntry {
        path: dir.to_string_lossy().to_string(),
        name: display_name,
        timestamp,
        total_size,
        has_apk,
        has_private_data,
        has_shared_data,
        has_obb,
    })
}

async fn read_manifest(dir: &Path) -> Option<BackupManifest> {
    let content = fs::read(dir.join(MANIFEST_FILE)).await.ok()?;
    match serde_json::from_slice(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(error = &e as &dyn Error, dir = %dir.display(), "Ignoring malformed backup manifest");
            None
        }
    }
}

fn parse_dir_timestamp(ts: &str) -> Option<u64> {
    let fmt = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    let odt = time::PrimitiveDateTime::parse(ts, &fmt).ok()?.assume_utc();
    u64::try_from(odt.unix_timestamp_nanos() / 1_000_000).ok()
}

/// Recovers the package name a backup belongs to from its manifest or part folders.
pub async fn backup_package(backup_path: &Path) -> Option<String> {
    if let Some(manifest) = read_manifest(backup_path).await {
        return Some(manifest.package_name);
    }
    for part in ["data_private", "data", "obb"] {
        if let Ok(Some(sub)) = first_subdirectory(&backup_path.join(part)).await
            && let Some(name) = sub.file_name().and_then(|n| n.to_str())
            && PACKAGE_NAME_REGEX.is_match(name)
        {
            return Some(name.to_string());
        }
    }
    None
}
