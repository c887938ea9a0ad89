use std::{
    error::Error,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow, ensure};
use sysproxy::Sysproxy;
use tokio::fs;
use tracing::{Span, debug, error, instrument};

use crate::error::EngineError;

#[instrument(ret, level = "debug")]
pub fn get_sys_proxy() -> Option<String> {
    match Sysproxy::get_system_proxy() {
        Ok(proxy) if proxy.enable => {
            let result = format!("http://{}:{}", proxy.host, proxy.port);
            debug!(proxy = &result, "got system proxy");
            Some(result)
        }
        Ok(_) => None,
        Err(e) => {
            error!(error = &e as &dyn Error, "failed to get system proxy");
            None
        }
    }
}

/// Resolves a tool binary: an explicit path wins, otherwise `name` is looked up in `PATH`.
#[instrument(level = "debug", ret, err)]
pub fn resolve_binary_path(configured: Option<&str>, name: &str) -> Result<PathBuf> {
    if let Some(configured) = configured.filter(|p| !p.trim().is_empty()) {
        let path = PathBuf::from(configured);
        if path.is_file() {
            return Ok(path);
        }
        return which::which(configured)
            .with_context(|| format!("Configured {name} binary not found: {configured}"));
    }
    which::which(name).with_context(|| format!("{name} binary not found in PATH"))
}

pub fn now_millis() -> u64 {
    system_time_to_millis(SystemTime::now())
}

pub fn system_time_to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Finds the first immediate subdirectory in `dir`
pub async fn first_subdirectory(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Returns the only immediate subdirectory of `dir`, or `None` if there are zero or several
pub async fn single_subdirectory(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut found = None;
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            if found.is_some() {
                return Ok(None);
            }
            found = Some(entry.path());
        }
    }
    Ok(found)
}

/// Checks recursively if a directory contains any files
pub async fn dir_has_any_files(dir: &Path) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        let mut rd = match fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        while let Some(entry) = rd.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_file() {
                return Ok(true);
            } else if file_type.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    Ok(false)
}

/// Total size of all files below `dir`. Unreadable entries are skipped.
#[instrument(level = "debug", fields(dir = %dir.display(), size), err)]
pub async fn dir_size(dir: &Path) -> Result<u64> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut total: u64 = 0;
    let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        let mut rd = match fs::read_dir(&path).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        while let Some(entry) = rd.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_file() {
                total = total.saturating_add(meta.len());
            } else if meta.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    Span::current().record("size", total);
    Ok(total)
}

/// Files directly inside `dir` with the given extension (case-insensitive).
pub async fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file()
            && path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case(extension))
        {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Removes a specific child directory if present
pub async fn remove_child_dir_if_exists(parent: &Path, child: &str) -> Result<()> {
    let target = parent.join(child);
    if target.exists() {
        fs::remove_dir_all(&target)
            .await
            .with_context(|| format!("Failed to remove {}", target.display()))?;
    }
    Ok(())
}

/// Canonicalizes `path` and checks that it lives strictly below `root`.
pub async fn ensure_inside(root: &Path, path: &Path, what: &str) -> Result<PathBuf> {
    let canon_root = fs::canonicalize(root)
        .await
        .with_context(|| format!("Failed to resolve {what} directory {}", root.display()))?;
    let canon_req = fs::canonicalize(path)
        .await
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    ensure!(
        canon_req.starts_with(&canon_root) && canon_req != canon_root,
        "Requested path is outside {what} directory"
    );
    Ok(canon_req)
}

/// Checks that a storage root is a writable directory, creating it when missing.
/// Failures are [`EngineError::State`]: nothing stored there can work until the user fixes it.
pub fn check_storage_root(root: &Path, what: &str) -> Result<()> {
    let state_err = |detail: String| {
        anyhow!(EngineError::state(format!("{what} location {} {detail}", root.display())))
    };
    if root.exists() {
        if !root.is_dir() {
            return Err(state_err("is not a directory".into()));
        }
    } else {
        fs_err::create_dir_all(root).map_err(|e| state_err(format!("cannot be created: {e}")))?;
    }
    let scratch = root.join(".write_test");
    fs_err::write(&scratch, b"").map_err(|e| state_err(format!("is not writable: {e}")))?;
    let _ = fs_err::remove_file(&scratch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn dir_helpers_walk_nested_directories() {
        let dir = tempdir().unwrap();
        assert!(!dir_has_any_files(dir.path()).await.unwrap());

        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        assert!(!dir_has_any_files(dir.path()).await.unwrap());

        std::fs::write(nested.join("file.bin"), [0u8; 10]).unwrap();
        std::fs::write(dir.path().join("App.APK"), [0u8; 5]).unwrap();
        assert!(dir_has_any_files(dir.path()).await.unwrap());
        assert_eq!(dir_size(dir.path()).await.unwrap(), 15);
        assert_eq!(files_with_extension(dir.path(), "apk").await.unwrap().len(), 1);
        assert!(first_subdirectory(dir.path()).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ensure_inside_rejects_escapes_and_root() {
        let root = tempdir().unwrap();
        let other = tempdir().unwrap();
        let child = root.path().join("child");
        std::fs::create_dir(&child).unwrap();

        assert!(ensure_inside(root.path(), &child, "backups").await.is_ok());
        assert!(ensure_inside(root.path(), root.path(), "backups").await.is_err());
        let err = ensure_inside(root.path(), other.path(), "backups").await.unwrap_err();
        assert!(format!("{err:#}").contains("outside backups directory"));
    }

    #[test]
    fn storage_root_must_be_a_writable_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nested").join("backups");
        check_storage_root(&missing, "Backups").unwrap();
        assert!(missing.is_dir());
        assert!(!missing.join(".write_test").exists());

        let file = dir.path().join("downloads");
        std::fs::write(&file, "").unwrap();
        let err = check_storage_root(&file, "Downloads").unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(crate::error::ErrorKind::State));
        assert!(format!("{err:#}").contains("is not a directory"));

        let under_file = file.join("backups");
        let err = check_storage_root(&under_file, "Backups").unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(crate::error::ErrorKind::State));
    }

    #[test]
    fn explicit_binary_path_wins() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("adb");
        std::fs::write(&bin, "").unwrap();
        let resolved = resolve_binary_path(Some(bin.to_str().unwrap()), "adb").unwrap();
        assert_eq!(resolved, bin);
        assert!(resolve_binary_path(Some("/definitely/missing/adb"), "adb").is_err());
    }
}
