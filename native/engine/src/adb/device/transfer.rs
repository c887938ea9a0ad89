use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use tokio::fs;
use tracing::{debug, instrument};

use super::AdbDevice;
use crate::error::{ErrorKind, kind_of};

/// Last component of a remote path
fn remote_file_name(remote: &str) -> Option<&str> {
    remote.trim_end_matches('/').rsplit('/').next().filter(|n| !n.is_empty())
}

impl AdbDevice {
    /// Pulls a single file. If `dest` is an existing directory the file keeps its remote name.
    #[instrument(level = "debug", skip(self), err)]
    pub(crate) async fn pull(&self, source_file: &str, dest: &Path) -> Result<PathBuf> {
        let dest_path = if dest.is_dir() {
            let name = remote_file_name(source_file)
                .with_context(|| format!("Remote path has no file name: {source_file}"))?;
            dest.join(name)
        } else {
            dest.to_path_buf()
        };
        self.bridge
            .pull(&self.serial, source_file, dest)
            .await
            .with_context(|| format!("Failed to pull {source_file}"))?;
        Ok(dest_path)
    }

    /// Pulls a remote directory into `dest_parent`, returning the local copy's path.
    #[instrument(level = "debug", skip(self), err)]
    pub(crate) async fn pull_dir(&self, source: &str, dest_parent: &Path) -> Result<PathBuf> {
        let name = remote_file_name(source)
            .with_context(|| format!("Remote path has no directory name: {source}"))?;
        fs::create_dir_all(dest_parent)
            .await
            .with_context(|| format!("Failed to create {}", dest_parent.display()))?;
        self.bridge
            .pull(&self.serial, source, dest_parent)
            .await
            .with_context(|| format!("Failed to pull directory {source}"))?;
        Ok(dest_parent.join(name))
    }

    #[instrument(level = "debug", skip(self), err)]
    pub(crate) async fn push(&self, source_file: &Path, dest_file: &str) -> Result<()> {
        ensure!(source_file.is_file(), "Path does not exist or is not a file");
        self.bridge
            .push(&self.serial, source_file, dest_file)
            .await
            .with_context(|| format!("Failed to push {}", source_file.display()))
    }

    /// Pushes `source` into `dest_parent`, so it lands at `dest_parent/<name>`.
    /// With `overwrite` the remote target is removed first.
    #[instrument(level = "debug", skip(self), err)]
    pub(crate) async fn push_dir(
        &self,
        source: &Path,
        dest_parent: &str,
        overwrite: bool,
    ) -> Result<String> {
        ensure!(source.is_dir(), "Source must be a directory");
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .context("Failed to get directory name")?;
        let dest = format!("{}/{name}", dest_parent.trim_end_matches('/'));
        if overwrite {
            debug!(dest, "Removing remote directory before push");
            self.shell(&format!("rm -rf '{dest}'")).await?;
        }
        self.shell(&format!("mkdir -p '{dest_parent}'")).await?;
        self.bridge
            .push(&self.serial, source, dest_parent)
            .await
            .with_context(|| format!("Failed to push directory {}", source.display()))?;
        Ok(dest)
    }

    /// Checks if a directory exists on the device
    #[instrument(level = "debug", skip(self), ret)]
    pub(crate) async fn dir_exists(&self, path: &str) -> Result<bool> {
        match self.shell_checked(&format!("test -d '{path}'")).await {
            Ok(_) => Ok(true),
            Err(e) if kind_of(&e) == Some(ErrorKind::Execution) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adb::FakeBridge;

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_dir_nests_under_parent() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        bridge.add_file("/sdcard/Android/data/com.example/files/save.dat", b"save");
        let device = AdbDevice::new(bridge.clone(), "SERIAL");
        let dest = tempfile::tempdir().unwrap();

        assert!(device.dir_exists("/sdcard/Android/data/com.example").await.unwrap());
        assert!(!device.dir_exists("/sdcard/Android/data/other").await.unwrap());

        let local = device
            .pull_dir("/sdcard/Android/data/com.example", &dest.path().join("data"))
            .await
            .unwrap();
        assert_eq!(local, dest.path().join("data").join("com.example"));
        assert_eq!(std::fs::read(local.join("files/save.dat")).unwrap(), b"save");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_dir_with_overwrite_clears_target() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        let device = AdbDevice::new(bridge.clone(), "SERIAL");
        let src = tempfile::tempdir().unwrap();
        let obb = src.path().join("com.example");
        std::fs::create_dir(&obb).unwrap();

        let dest = device.push_dir(&obb, "/sdcard/Android/obb/", true).await.unwrap();
        assert_eq!(dest, "/sdcard/Android/obb/com.example");
        assert_eq!(bridge.shell_count("rm -rf '/sdcard/Android/obb/com.example'"), 1);
        assert_eq!(bridge.pushes.lock().unwrap()[0].1, "/sdcard/Android/obb/");
    }
}
