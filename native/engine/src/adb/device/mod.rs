mod sideload;
mod transfer;

use std::{
    error::Error,
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use derive_more::Debug;
pub use sideload::{InstallOptions, SideloadProgress};
use tokio::fs;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    adb::{AdbBridge, PackageName, RebootMode},
    error::EngineError,
    models::{
        ControllerInfo, InstalledPackage,
        device::{
            CONTROLLER_INFO_COMMAND_DUMPSYS, CONTROLLER_INFO_COMMAND_JSON,
            parse_controllers_dumpsys, parse_controllers_json, parse_package_list,
        },
    },
};

/// Handle to one device, addressed by serial.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    #[debug(skip)]
    bridge: Arc<dyn AdbBridge>,
    /// Serial reported by ADB, e.g. `1WMHH000M12345` or `192.168.1.100:5555`
    pub serial: String,
}

impl Display for AdbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serial)
    }
}

impl AdbDevice {
    pub fn new(bridge: Arc<dyn AdbBridge>, serial: impl Into<String>) -> Self {
        Self { bridge, serial: serial.into() }
    }

    /// Queries manufacturer + model. If manufacturer is empty, returns just model.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn query_identity(&self) -> Result<String> {
        let manufacturer = tokio::time::timeout(
            Duration::from_secs(2),
            self.shell("getprop ro.product.manufacturer"),
        )
        .await
        .context("Timed out reading ro.product.manufacturer")?
        .context("Failed to read ro.product.manufacturer")?
        .trim()
        .to_string();
        let model =
            tokio::time::timeout(Duration::from_secs(2), self.shell("getprop ro.product.model"))
                .await
                .context("Timed out reading ro.product.model")?
                .context("Failed to read ro.product.model")?
                .trim()
                .to_string();
        if !manufacturer.is_empty() && !model.is_empty() {
            Ok(format!("{manufacturer} {model}"))
        } else if !model.is_empty() {
            Ok(model)
        } else {
            bail!("empty identity");
        }
    }

    /// Returns `dumpsys battery` output
    #[instrument(level = "debug", skip(self), err)]
    pub async fn battery_dump(&self) -> Result<String> {
        self.shell_checked("dumpsys battery").await.context("'dumpsys battery' command failed")
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn battery_level(&self) -> Result<u8> {
        let dump = self.battery_dump().await?;
        let level = dump
            .lines()
            .find_map(|line| {
                // Look for lines like "  level: 85"
                let value = line.trim().strip_prefix("level:")?;
                value.trim().parse().ok()
            })
            .context("Failed to parse device battery level from dumpsys output")?;
        trace!(level, "Parsed device battery level");
        Ok(level)
    }

    /// Controller info via `rstest`, falling back to dumpsys
    #[instrument(level = "debug", skip(self), err)]
    pub async fn controllers(&self) -> Result<Vec<ControllerInfo>> {
        let json_result = match self.shell_checked(CONTROLLER_INFO_COMMAND_JSON).await {
            Ok(json) => parse_controllers_json(&json),
            Err(e) => Err(e),
        };
        match json_result {
            Ok(controllers) => Ok(controllers),
            Err(e) => {
                debug!(
                    error = e.as_ref() as &dyn Error,
                    "rstest unavailable, falling back to dumpsys"
                );
                let dump = self
                    .shell(CONTROLLER_INFO_COMMAND_DUMPSYS)
                    .await
                    .context("Failed to get controller info via dumpsys")?;
                Ok(parse_controllers_dumpsys(&dump))
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(count), err)]
    pub async fn installed_packages(&self) -> Result<Vec<InstalledPackage>> {
        let all = self
            .shell_checked("pm list packages --show-versioncode")
            .await
            .context("Failed to list packages")?;
        let system =
            self.shell_checked("pm list packages -s").await.context("Failed to list system packages")?;
        let packages = parse_package_list(&all, &system);
        tracing::Span::current().record("count", packages.len());
        Ok(packages)
    }

    /// Executes a shell command on the device
    #[instrument(level = "debug", skip(self), err, ret)]
    pub async fn shell(&self, command: &str) -> Result<String> {
        self.bridge.shell(&self.serial, command).await.context("Failed to execute shell command")
    }

    /// Executes a shell command and fails if exit code is non-zero.
    /// Appends `; printf '\n%s' $?` and parses the final line as the exit status.
    #[instrument(level = "debug", skip(self), err, ret)]
    pub async fn shell_checked(&self, command: &str) -> Result<String> {
        let shell_output = self
            .shell(&format!("{command} ; printf '\\n%s' $?"))
            .await
            .with_context(|| format!("Failed to execute checked shell command: {command}"))?;
        let (output, exit_code) = match shell_output.rsplit_once('\n') {
            Some(parts) => parts,
            None => {
                let trimmed = shell_output.trim();
                if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                    ("", trimmed)
                } else {
                    return Err(anyhow!("Failed to extract exit code"));
                }
            }
        };
        if exit_code.trim() != "0" {
            error!(exit_code, output, "Shell command returned non-zero exit code");
            return Err(EngineError::Execution(format!(
                "Command {command} failed with exit code {}. Output: {output}",
                exit_code.trim()
            ))
            .into());
        }
        Ok(output.to_string())
    }

    /// Installs an APK without any conflict handling
    #[instrument(level = "debug", skip(self), err)]
    pub async fn install_package(&self, apk_path: &Path) -> Result<()> {
        self.bridge.install(&self.serial, apk_path).await
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn reboot(&self, mode: RebootMode) -> Result<()> {
        // The connection drops while rebooting, so the exit status may never arrive.
        self.shell(mode.shell_command())
            .await
            .with_context(|| format!("Failed to reboot with mode: {mode:?}"))?;
        Ok(())
    }

    /// `enabled` restores the real sensor; otherwise the sensor is faked as covered.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn set_proximity_sensor(&self, enabled: bool) -> Result<()> {
        let cmd = if enabled {
            "am broadcast -a com.oculus.vrpowermanager.automation_disable"
        } else {
            "am broadcast -a com.oculus.vrpowermanager.prox_close"
        };
        self.shell_checked(cmd)
            .await
            .with_context(|| format!("Failed to set proximity sensor: enabled={enabled}"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn set_guardian_paused(&self, paused: bool) -> Result<()> {
        let value = if paused { 1 } else { 0 };
        self.shell_checked(&format!("setprop debug.oculus.guardian_pause {value}"))
            .await
            .with_context(|| format!("Failed to set guardian paused: {paused}"))?;
        Ok(())
    }

    /// Launches an application, preferring the VR launcher category
    #[instrument(level = "debug", skip(self), err)]
    pub async fn launch(&self, package: &PackageName) -> Result<()> {
        let output = self
            .shell(&format!("monkey -p {package} -c com.oculus.intent.category.VR 1"))
            .await
            .context("Failed to execute monkey command")?;

        if !output.contains("monkey aborted") {
            info!("Launched with VR category");
            return Ok(());
        }
        info!(output, "Monkey command with VR category failed");

        debug!("Retrying with default launch category");
        let output = self
            .shell(&format!("monkey -p {package} 1"))
            .await
            .context("Failed to execute monkey command")?;

        if output.contains("monkey aborted") {
            warn!(output, %package, "Monkey command returned error");
            return Err(EngineError::Execution(format!("Failed to launch package '{package}'")).into());
        }

        info!("Launched with default category");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn force_stop(&self, package: &PackageName) -> Result<()> {
        self.shell_checked(&format!("am force-stop {package}"))
            .await
            .with_context(|| format!("Failed to force stop {package}"))?;
        Ok(())
    }

    /// Uninstalls a package, disabling device-policy protected packages first
    #[instrument(level = "debug", skip(self), err)]
    pub async fn uninstall_package(&self, package: &PackageName) -> Result<()> {
        match self.bridge.uninstall(&self.serial, package.as_str()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let error_str = format!("{e:#}");
                debug!(error = %error_str, "Uninstall failed, checking error type");

                if error_str.contains("DELETE_FAILED_INTERNAL_ERROR") {
                    let escaped = package.as_str().replace('.', "\\.");
                    let output = self
                        .shell(&format!("pm list packages | grep -w ^package:{escaped}$"))
                        .await
                        .unwrap_or_default();

                    if output.trim().is_empty() {
                        Err(EngineError::Execution(format!("Package not installed: {package}"))
                            .into())
                    } else {
                        Err(e)
                    }
                } else if error_str.contains("DELETE_FAILED_DEVICE_POLICY_MANAGER") {
                    info!(%package, "Package is protected by device policy, trying to force uninstall");
                    self.shell(&format!("pm disable-user {package}")).await?;
                    self.bridge.uninstall(&self.serial, package.as_str()).await
                } else {
                    Err(e)
                }
            }
        }
        .context("Failed to uninstall package")
    }

    /// APK path reported by `pm path <package>`
    #[instrument(level = "debug", skip(self), err)]
    pub async fn apk_path(&self, package: &PackageName) -> Result<String> {
        let output = self
            .shell_checked(&format!("pm path {package}"))
            .await
            .context("Failed to run 'pm path'")?;
        for line in output.lines() {
            if let Some(rest) = line.strip_prefix("package:") {
                let p = rest.trim();
                if !p.is_empty() {
                    return Ok(p.to_string());
                }
            }
        }
        bail!("Failed to parse APK path for package '{package}': {output}");
    }

    /// Pulls an app's APK and OBB (if present) for donation.
    ///
    /// Layout:
    /// - `<dest_root>/<package_name>/<package_name>.apk`
    /// - `<dest_root>/<package_name>/<package_name>/` OBB files, when present
    #[instrument(level = "debug", skip(self, dest_root), err)]
    pub async fn pull_app_for_donation(
        &self,
        package: &PackageName,
        dest_root: &Path,
    ) -> Result<PathBuf> {
        let package_str = package.as_str();
        fs::create_dir_all(dest_root).await.with_context(|| {
            format!("Failed to create destination root {}", dest_root.display())
        })?;

        let app_dir = dest_root.join(package_str);
        if app_dir.exists() {
            debug!(path = %app_dir.display(), "Removing existing app donation directory");
            fs::remove_dir_all(&app_dir).await.with_context(|| {
                format!("Failed to remove existing directory {}", app_dir.display())
            })?;
        }
        fs::create_dir_all(&app_dir).await.with_context(|| {
            format!("Failed to create app donation directory {}", app_dir.display())
        })?;

        let apk_remote = self.apk_path(package).await?;
        let local_apk_path = self.pull(&apk_remote, &app_dir).await?;

        let renamed_apk_path = app_dir.join(format!("{package_str}.apk"));
        if local_apk_path != renamed_apk_path {
            fs::rename(&local_apk_path, &renamed_apk_path).await.with_context(|| {
                format!(
                    "Failed to rename pulled APK from {} to {}",
                    local_apk_path.display(),
                    renamed_apk_path.display()
                )
            })?;
        }

        let obb_remote_dir = format!("/sdcard/Android/obb/{package_str}");
        if self.dir_exists(&obb_remote_dir).await? {
            debug!(package = package_str, "Pulling OBB directory for donation");
            self.pull_dir(&obb_remote_dir, &app_dir).await?;
        } else {
            debug!(package = package_str, "No OBB directory found for package, skipping");
        }

        Ok(app_dir)
    }
}
