use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::AdbDevice;
use crate::{
    adb::{PACKAGE_NAME_REGEX, PackageName},
    backups::{BackupManager, BackupOptions},
    error::EngineError,
    models::{BackupParts, get_apk_info},
};

/// Progress information for sideload operations
#[derive(Debug, Clone, PartialEq)]
pub struct SideloadProgress {
    pub status: String,
    pub progress: Option<f32>,
}

/// How to handle an install that conflicts with the installed version.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions<'a> {
    /// Keeps app data across a forced reinstall; `None` surfaces the conflict instead.
    pub reinstall_backups: Option<&'a BackupManager>,
    /// Package of the APK, read from the APK itself when not given.
    pub package: Option<&'a PackageName>,
}

fn send_progress(
    progress_sender: &UnboundedSender<SideloadProgress>,
    status: &str,
    progress: Option<f32>,
) {
    let _ = progress_sender.send(SideloadProgress { status: status.to_string(), progress });
}

fn is_install_conflict(message: &str) -> bool {
    message.contains("INSTALL_FAILED_VERSION_DOWNGRADE")
        || message.contains("INSTALL_FAILED_UPDATE_INCOMPATIBLE")
}

impl AdbDevice {
    /// Sideloads an app by installing its APK and pushing OBB data if present.
    ///
    /// The directory must hold exactly one APK. OBB files are expected in a
    /// subdirectory named after the package.
    #[instrument(level = "debug", skip(self, options, progress_sender), err)]
    pub async fn sideload_app(
        &self,
        app_dir: &Path,
        options: InstallOptions<'_>,
        progress_sender: UnboundedSender<SideloadProgress>,
    ) -> Result<()> {
        ensure!(app_dir.is_dir(), EngineError::validation("App path must be a directory"));

        send_progress(&progress_sender, "Enumerating files", None);
        let mut apk_paths = Vec::new();
        let mut subdirs = Vec::new();
        let mut dir = tokio::fs::read_dir(app_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                subdirs.push(path);
            } else if path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("apk"))
            {
                apk_paths.push(path);
            }
        }
        let apk_path = match apk_paths.len() {
            0 => bail!(EngineError::validation("No APK file found in app directory")),
            1 => &apk_paths[0],
            _ => bail!(EngineError::validation("Multiple APK files found in app directory")),
        };

        let package_name = match options.package {
            Some(package) => package.clone(),
            None => match get_apk_info(apk_path) {
                Ok(info) => PackageName::parse(&info.package_name)?,
                Err(e) => {
                    // Fall back to the OBB folder name
                    let from_obb = subdirs
                        .iter()
                        .filter_map(|d| d.file_name().and_then(|n| n.to_str()))
                        .find(|n| PACKAGE_NAME_REGEX.is_match(n));
                    match from_obb {
                        Some(name) => PackageName::parse(name)?,
                        None => return Err(e.context("Failed to read APK info")),
                    }
                }
            },
        };
        let obb_dir = subdirs
            .into_iter()
            .find(|d| d.file_name().and_then(|n| n.to_str()) == Some(package_name.as_str()));

        send_progress(&progress_sender, "Installing APK", Some(0.0));
        let install_scale = if obb_dir.is_some() { 0.5 } else { 1.0 };
        let options = InstallOptions { package: Some(&package_name), ..options };
        self.install_apk(apk_path, options, &progress_sender).await?;
        send_progress(&progress_sender, "Installed APK", Some(install_scale));

        if let Some(obb_dir) = obb_dir {
            debug!(obb_dir = %obb_dir.display(), "Pushing OBB");
            send_progress(&progress_sender, "Pushing OBB", Some(install_scale));
            self.push_dir(&obb_dir, "/sdcard/Android/obb", true).await?;
            send_progress(&progress_sender, "Pushed OBB", Some(1.0));
        }

        Ok(())
    }

    /// Installs an APK. On a signature or downgrade conflict the app is reinstalled
    /// with its data kept, when `options.reinstall_backups` allows it.
    #[instrument(level = "debug", skip(self, options, progress_sender), err)]
    pub async fn install_apk(
        &self,
        apk_path: &Path,
        options: InstallOptions<'_>,
        progress_sender: &UnboundedSender<SideloadProgress>,
    ) -> Result<()> {
        info!(path = %apk_path.display(), "Installing APK");
        let err = match self.install_package(apk_path).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let message = format!("{err:#}");
        let backups = match options.reinstall_backups {
            Some(backups) if is_install_conflict(&message) => backups,
            _ => return Err(err),
        };

        info!(reason = message, "Incompatible update, reinstalling");
        send_progress(progress_sender, "Incompatible update, reinstalling", None);
        let package_name = match options.package {
            Some(package) => package.clone(),
            None => {
                let apk_info = get_apk_info(apk_path).context("Failed to get APK info for backup")?;
                PackageName::parse(&apk_info.package_name)
                    .context("Invalid package name in APK info")?
            }
        };

        send_progress(progress_sender, "Backing up app data", None);
        let backup = backups
            .try_create_backup(
                self,
                &package_name,
                &BackupOptions {
                    parts: BackupParts::data_only(),
                    name_suffix: Some("reinstall".to_string()),
                    display_name: None,
                    // Don't lose private data on reinstall, e.g. when the app is not debuggable
                    require_private_data: true,
                },
                // A reinstall is not interrupted halfway
                &CancellationToken::new(),
            )
            .await
            .context("Failed to backup app for reinstall")?;

        send_progress(progress_sender, "Uninstalling old version", None);
        self.uninstall_package(&package_name)
            .await
            .context("Failed to uninstall package for reinstall")?;
        send_progress(progress_sender, "Installing APK", None);
        self.install_package(apk_path).await.context("Failed to reinstall APK")?;

        if let Some(backup) = backup {
            send_progress(progress_sender, "Restoring app data", None);
            backups
                .restore(self, Path::new(&backup.path))
                .await
                .context("Failed to restore backup after reinstall")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::{
        adb::FakeBridge,
        error::{ErrorKind, kind_of},
        events::EventBus,
        models::Settings,
    };

    const PKG: &str = "com.example.app";

    fn app_dir(with_obb: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("game.apk"), b"not a real apk").unwrap();
        if with_obb {
            let obb = dir.path().join(PKG);
            std::fs::create_dir(&obb).unwrap();
            std::fs::write(obb.join(format!("main.1.{PKG}.obb")), b"obb").unwrap();
        }
        dir
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sideload_pushes_obb_named_after_package() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        let device = AdbDevice::new(bridge.clone(), "SERIAL");
        let dir = app_dir(true);
        let (tx, mut rx) = mpsc::unbounded_channel();

        device.sideload_app(dir.path(), InstallOptions::default(), tx).await.unwrap();

        assert_eq!(bridge.installs.lock().unwrap().as_slice(), [dir.path().join("game.apk")]);
        let pushes = bridge.pushes.lock().unwrap().clone();
        assert_eq!(pushes, vec![(dir.path().join(PKG), "/sdcard/Android/obb".to_string())]);
        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = p.progress.or(last);
        }
        assert_eq!(last, Some(1.0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sideload_rejects_ambiguous_directories() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        let device = AdbDevice::new(bridge.clone(), "SERIAL");
        let dir = app_dir(false);
        std::fs::write(dir.path().join("other.apk"), b"x").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = device.sideload_app(dir.path(), InstallOptions::default(), tx).await.unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Validation));
        assert!(bridge.installs.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_without_reinstall_is_surfaced() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        bridge
            .install_failures
            .lock()
            .unwrap()
            .push_back("Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: signatures do not match]".into());
        let device = AdbDevice::new(bridge.clone(), "SERIAL");
        let dir = app_dir(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let package = PackageName::parse(PKG).unwrap();

        let options = InstallOptions { package: Some(&package), ..Default::default() };
        let err = device.install_apk(&dir.path().join("game.apk"), options, &tx).await.unwrap_err();
        assert!(format!("{err:#}").contains("INSTALL_FAILED_UPDATE_INCOMPATIBLE"));
        assert!(bridge.uninstalls.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_reinstalls_and_restores_data() {
        let root = tempfile::tempdir().unwrap();
        let (_settings_tx, settings) = watch::channel(Settings::rooted_at(root.path()));
        let backups = BackupManager::new(settings, EventBus::new());
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        bridge
            .install_failures
            .lock()
            .unwrap()
            .push_back("Failure [INSTALL_FAILED_VERSION_DOWNGRADE]".into());
        bridge.add_file(&format!("/sdcard/backup_tmp/{PKG}/files/save.dat"), b"save");
        bridge.respond(&format!("pm path {PKG}"), "package:/data/app/base.apk");
        let device = AdbDevice::new(bridge.clone(), "SERIAL");
        let dir = app_dir(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let package = PackageName::parse(PKG).unwrap();

        let options = InstallOptions { reinstall_backups: Some(&backups), package: Some(&package) };
        device.install_apk(&dir.path().join("game.apk"), options, &tx).await.unwrap();

        assert_eq!(bridge.uninstalls.lock().unwrap().as_slice(), [PKG]);
        assert_eq!(bridge.installs.lock().unwrap().len(), 1);
        assert_eq!(bridge.shell_count(&format!("run-as {PKG} tar -xvf -")), 1);
        let listed = backups.list_backups().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].name.ends_with("_reinstall"));
    }
}
