use std::{error::Error, path::PathBuf};

use anyhow::{Context, Result, ensure};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    CancelMode, DeviceStepConfig, NetworkStepConfig, ProgressUpdate, TaskManager, lanes::LaneSlot,
};
use crate::{
    adb::PackageName,
    archive::create_zip_from_dir,
    downloads_catalog::UPLOAD_TMP_DIR,
    error::EngineError,
    models::{TaskStatus, get_apk_info},
};

/// Removes temporary files and directories when dropped, newest first.
struct CleanupGuard {
    paths: Vec<PathBuf>,
}

impl CleanupGuard {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn add_path(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for path in self.paths.iter().rev() {
            if !path.exists() {
                continue;
            }
            let result = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            match result {
                Ok(()) => debug!(path = %path.display(), "Cleaned up temporary path"),
                Err(e) => warn!(
                    error = &e as &dyn Error,
                    path = %path.display(),
                    "Failed to clean up temporary donation path"
                ),
            }
        }
    }
}

/// `"<label> v<version_code> <package>.zip"`, made safe for use as a file name.
fn archive_file_name(label: &str, version_code: u64, package: &str) -> Result<String> {
    let sanitized = sanitize_filename::sanitize(format!("{label} v{version_code} {package}"));
    ensure!(!sanitized.trim().is_empty(), "Sanitized archive name is empty");
    Ok(format!("{sanitized}.zip"))
}

/// Uppercase hex MD5 of the installation id, shipped with every donation.
fn hardware_id(installation_id: &str) -> String {
    format!("{:X}", md5::compute(installation_id.as_bytes()))
}

impl TaskManager {
    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_donate_app(
        &self,
        package: PackageName,
        display_name: Option<String>,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(
            package_name = %package,
            device_permits_available = self.lanes.device.available_permits(),
            "Starting app donation task"
        );

        let device = self.session.current_device()?;
        let installation_id = self.settings.borrow().installation_id.clone();
        let upload_root = self.downloads.downloads_location().join(UPLOAD_TMP_DIR);
        tokio::fs::create_dir_all(&upload_root).await.with_context(|| {
            format!("Failed to create upload directory {}", upload_root.display())
        })?;

        // Registered before the pull so an aborted pull leaves nothing behind
        let mut cleanup_guard = CleanupGuard::new();
        cleanup_guard.add_path(upload_root.join(package.as_str()));

        // Step 1: pull APK and OBB from the device
        let pulled_dir = self
            .run_device_step(
                DeviceStepConfig {
                    step_number: 1,
                    waiting_msg: "Waiting to start pull from device...",
                    running_msg: "Pulling app from device...".to_string(),
                    log_context: "donate_app_pull",
                    cancel_mode: CancelMode::Abort,
                },
                lane,
                update_progress,
                token,
                || device.pull_app_for_donation(&package, &upload_root),
            )
            .await?;
        lane.release();

        if token.is_cancelled() {
            warn!("Task was cancelled after pull step");
            return Err(EngineError::cancelled("Task cancelled after pulling app from device").into());
        }

        // Step 2: APK metadata, HWID file and the ZIP archive
        update_progress(ProgressUpdate {
            status: TaskStatus::Running,
            step_number: 2,
            step_progress: None,
            message: "Preparing archive for upload...".into(),
        });

        let apk_path = pulled_dir.join(format!("{package}.apk"));
        let apk_info = get_apk_info(&apk_path)
            .with_context(|| format!("Failed to read APK metadata from {}", apk_path.display()))?;

        let label = apk_info
            .application_label
            .filter(|s| !s.trim().is_empty())
            .or(display_name)
            .unwrap_or_else(|| package.as_str().to_owned());
        let version_code = apk_info.version_code.with_context(|| {
            format!("Failed to get version code from APK {}", apk_path.display())
        })?;
        let archive_name = archive_file_name(&label, version_code, &apk_info.package_name)?;

        tokio::fs::write(pulled_dir.join("HWID.txt"), hardware_id(&installation_id))
            .await
            .context("Failed to write HWID.txt")?;

        let archive_path =
            create_zip_from_dir(&pulled_dir, &upload_root, &archive_name, Some(token.clone()))
                .await
                .context("Failed to create archive from pulled app")?;
        cleanup_guard.add_path(archive_path.clone());

        if token.is_cancelled() {
            warn!("Task was cancelled after archive preparation step");
            return Err(EngineError::cancelled("Task cancelled after preparing archive").into());
        }

        // Step 3: upload
        self.run_network_step(
            NetworkStepConfig {
                step_number: 3,
                waiting_msg: "Waiting to start upload...",
                verb: "Uploading archive",
                log_context: "donation_upload",
            },
            lane,
            update_progress,
            token,
            |tx| self.catalog.upload_donation_archive(&archive_path, Some(tx), token),
        )
        .await
        .context("Failed to upload donation app archive")?;

        info!(archive = %archive_name, "Donation uploaded");
        Ok(())
    }
}
