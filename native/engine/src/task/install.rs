use std::{future::Future, path::Path, time::Duration};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, instrument, warn};

use super::{
    CancelMode, DeviceStepConfig, InstallStepConfig, PARTIALLY_APPLIED, ProgressUpdate,
    TaskManager, acquire_permit_or_cancel, lanes::LaneSlot,
};
use crate::{
    adb::{
        PackageName,
        device::{InstallOptions, SideloadProgress},
    },
    error::EngineError,
    models::TaskStatus,
};

impl TaskManager {
    /// Waits for the device lane, then runs `fut` while holding it.
    #[instrument(level = "debug", skip(self, lane, update_progress, token, fut))]
    pub(super) async fn run_device_step<'a, F, Fut, T>(
        &self,
        cfg: DeviceStepConfig<'a>,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
        fut: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        lane.release();
        update_progress(ProgressUpdate {
            status: TaskStatus::Waiting,
            step_number: cfg.step_number,
            step_progress: None,
            message: cfg.waiting_msg.into(),
        });

        let permit = acquire_permit_or_cancel!(self.lanes.device, token, "device");
        lane.hold(permit);
        debug!(
            device_permits_remaining = self.lanes.device.available_permits(),
            "Acquired device lane for {}", cfg.log_context
        );

        update_progress(ProgressUpdate {
            status: TaskStatus::Running,
            step_number: cfg.step_number,
            step_progress: None,
            message: cfg.running_msg,
        });

        debug!("Starting {} operation", cfg.log_context);
        let result = match cfg.cancel_mode {
            CancelMode::Cooperative => fut().await,
            CancelMode::Abort => tokio::select! {
                result = fut() => result,
                _ = token.cancelled() => {
                    info!("{} aborted by cancellation", cfg.log_context);
                    Err(EngineError::cancelled(format!("{} cancelled", cfg.log_context)).into())
                }
            },
            CancelMode::FinishThenCancel => finish_then_cancel(fut().await, token, cfg.log_context),
        };
        debug!("{} operation completed", cfg.log_context);
        result
    }

    /// Runs an install on the device lane and forwards its progress. Installs are never
    /// interrupted; a cancel is honoured once the install returned.
    #[instrument(level = "debug", skip(self, lane, update_progress, token, install))]
    pub(super) async fn run_install_step<'a, F, Fut>(
        &self,
        cfg: InstallStepConfig<'a>,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
        install: F,
    ) -> Result<()>
    where
        F: FnOnce(mpsc::UnboundedSender<SideloadProgress>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        lane.release();
        update_progress(ProgressUpdate {
            status: TaskStatus::Waiting,
            step_number: cfg.step_number,
            step_progress: None,
            message: "Waiting to start installation...".into(),
        });

        let permit = acquire_permit_or_cancel!(self.lanes.device, token, "device");
        lane.hold(permit);
        debug!(
            device_permits_remaining = self.lanes.device.available_permits(),
            "Acquired device lane for installation"
        );

        update_progress(ProgressUpdate {
            status: TaskStatus::Running,
            step_number: cfg.step_number,
            step_progress: None,
            message: "Installing APK...".into(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<SideloadProgress>();
        let install = install(tx);
        tokio::pin!(install);

        debug!("Starting {} monitoring", cfg.log_context);
        let mut last_log_time = std::time::Instant::now();
        let result = loop {
            tokio::select! {
                result = &mut install => {
                    info!("{} task completed", cfg.log_context);
                    break result;
                }
                Some(progress) = rx.recv() => {
                    // Log progress every 5 seconds
                    let now = std::time::Instant::now();
                    if now.duration_since(last_log_time) > Duration::from_secs(5) {
                        debug!(
                            install_progress = progress.progress.unwrap_or(0.0),
                            status = %progress.status,
                            context = cfg.log_context,
                            "Installation progress"
                        );
                        last_log_time = now;
                    }

                    update_progress(ProgressUpdate {
                        status: TaskStatus::Running,
                        step_number: cfg.step_number,
                        step_progress: progress.progress,
                        message: progress.status,
                    });
                }
            }
        };

        finish_then_cancel(result, token, cfg.log_context)?;
        self.request_device_refresh();
        info!(context = cfg.log_context, "Installation completed");
        Ok(())
    }

    fn install_options(&self) -> InstallOptions<'_> {
        let reinstall = self.settings.borrow().auto_reinstall_on_conflict;
        InstallOptions { reinstall_backups: reinstall.then_some(&self.backups), package: None }
    }

    /// Asks the device session for fresh details without waiting for them.
    pub(super) fn request_device_refresh(&self) {
        let session = self.session.clone();
        tokio::spawn(async move { session.refresh().await }.in_current_span());
    }

    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_install_apk(
        &self,
        apk_path: &Path,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(
            apk_path = %apk_path.display(),
            device_permits_available = self.lanes.device.available_permits(),
            "Starting APK install task"
        );

        let device = self.session.current_device()?;
        let options = self.install_options();
        self.run_install_step(
            InstallStepConfig { step_number: 1, log_context: "apk_install" },
            lane,
            update_progress,
            token,
            move |tx| async move { device.install_apk(apk_path, options, &tx).await },
        )
        .await
        .context("APK installation failed")
    }

    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_install_local_app(
        &self,
        app_path: &Path,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(
            app_path = %app_path.display(),
            device_permits_available = self.lanes.device.available_permits(),
            "Starting local app install task"
        );

        let device = self.session.current_device()?;
        let options = self.install_options();
        self.run_install_step(
            InstallStepConfig { step_number: 1, log_context: "sideload_local" },
            lane,
            update_progress,
            token,
            move |tx| async move { device.sideload_app(app_path, options, tx).await },
        )
        .await
        .context("Local app installation failed")
    }

    /// Installs a downloaded release directory, used by download-and-install.
    pub(super) async fn install_downloaded_app(
        &self,
        app_dir: &Path,
        package: &PackageName,
        step_number: u8,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        let device = self.session.current_device()?;
        let options = InstallOptions { package: Some(package), ..self.install_options() };
        self.run_install_step(
            InstallStepConfig { step_number, log_context: "sideload" },
            lane,
            update_progress,
            token,
            move |tx| async move { device.sideload_app(app_dir, options, tx).await },
        )
        .await
    }

    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_uninstall(
        &self,
        package: PackageName,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(
            package_name = %package,
            device_permits_available = self.lanes.device.available_permits(),
            "Starting uninstall task"
        );

        let device = self.session.current_device()?;
        self.run_device_step(
            DeviceStepConfig {
                step_number: 1,
                waiting_msg: "Waiting to start uninstallation...",
                running_msg: "Uninstalling app...".to_string(),
                log_context: "uninstall",
                cancel_mode: CancelMode::FinishThenCancel,
            },
            lane,
            update_progress,
            token,
            || async { device.uninstall_package(&package).await },
        )
        .await?;
        self.request_device_refresh();
        Ok(())
    }
}

/// Turns the result of an uninterruptible device mutation into a cancellation if one was
/// requested while it ran.
fn finish_then_cancel<T>(result: Result<T>, token: &CancellationToken, context: &str) -> Result<T> {
    if !token.is_cancelled() {
        return result;
    }
    warn!(context, succeeded = result.is_ok(), "Cancelled during a device mutation that was allowed to finish");
    match result {
        Ok(_) => Err(EngineError::cancelled(PARTIALLY_APPLIED).into()),
        Err(e) => Err(e.context(EngineError::cancelled(PARTIALLY_APPLIED))),
    }
}
