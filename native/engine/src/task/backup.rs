use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{BackupStepConfig, CancelMode, DeviceStepConfig, ProgressUpdate, TaskManager, lanes::LaneSlot};
use crate::{adb::PackageName, backups::BackupOptions};

impl TaskManager {
    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_backup(
        &self,
        cfg: BackupStepConfig,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(
            package_name = %cfg.package_name,
            device_permits_available = self.lanes.device.available_permits(),
            "Starting backup task"
        );

        let package = PackageName::parse(&cfg.package_name)?;
        let device = self.session.current_device()?;
        debug!(path = %self.backups.backups_location().display(), "Using backups location");

        let running_msg = format!("Creating backup ({})...", cfg.parts);
        let options = BackupOptions {
            parts: cfg.parts,
            name_suffix: cfg.name_suffix,
            display_name: cfg.display_name,
            require_private_data: false,
        };

        // The backup manager watches the token and removes an incomplete backup itself
        let entry = self
            .run_device_step(
                DeviceStepConfig {
                    step_number: 1,
                    waiting_msg: "Waiting to start backup...",
                    running_msg,
                    log_context: "backup",
                    cancel_mode: CancelMode::Cooperative,
                },
                lane,
                update_progress,
                token,
                || self.backups.create_backup(&device, &package, &options, token),
            )
            .await?;

        info!(path = %entry.path, "Backup created");
        Ok(())
    }

    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_restore(
        &self,
        backup_path: &Path,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(
            backup_path = %backup_path.display(),
            device_permits_available = self.lanes.device.available_permits(),
            "Starting restore task"
        );

        let device = self.session.current_device()?;
        self.run_device_step(
            DeviceStepConfig {
                step_number: 1,
                waiting_msg: "Waiting to start restore...",
                running_msg: "Restoring backup...".to_string(),
                log_context: "restore",
                cancel_mode: CancelMode::FinishThenCancel,
            },
            lane,
            update_progress,
            token,
            || self.backups.restore(&device, backup_path),
        )
        .await?;
        self.request_device_refresh();
        Ok(())
    }
}
