use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::error::EngineError;

/// Creates a ZIP archive of `src_dir` inside `dest_dir`.
/// The source directory is stored as the top-level folder of the archive.
/// If `archive_name` has no extension, `.zip` is appended.
#[instrument(skip(src_dir, dest_dir, cancel), err, level = "debug")]
pub async fn create_zip_from_dir(
    src_dir: &Path,
    dest_dir: &Path,
    archive_name: &str,
    cancel: Option<CancellationToken>,
) -> Result<PathBuf> {
    ensure!(src_dir.is_dir(), "Source directory does not exist: {}", src_dir.display());

    if !dest_dir.exists() {
        fs::create_dir_all(dest_dir).await.with_context(|| {
            format!("Failed to create destination directory {}", dest_dir.display())
        })?;
    }
    ensure!(dest_dir.is_dir(), "Destination directory is not a directory: {}", dest_dir.display());

    let mut archive_path = dest_dir.join(archive_name);
    if archive_path.extension().is_none() {
        archive_path.set_extension("zip");
    }

    if archive_path.exists() {
        fs::remove_file(&archive_path).await.with_context(|| {
            format!("Failed to remove existing archive {}", archive_path.display())
        })?;
    }

    let result = tokio::task::spawn_blocking({
        let src_dir = src_dir.to_path_buf();
        let archive_path = archive_path.clone();
        let cancel = cancel.clone();
        move || write_zip(&src_dir, &archive_path, cancel.as_ref())
    })
    .await
    .context("Archive task panicked")?;

    if let Err(e) = result {
        if archive_path.exists()
            && let Err(remove_err) = fs::remove_file(&archive_path).await
        {
            warn!(
                error = &remove_err as &dyn std::error::Error,
                path = %archive_path.display(),
                "Failed to remove partial archive"
            );
        }
        return Err(e);
    }

    Ok(archive_path)
}

fn write_zip(src_dir: &Path, archive_path: &Path, cancel: Option<&CancellationToken>) -> Result<()> {
    let root_name = src_dir
        .file_name()
        .and_then(|n| n.to_str())
        .context("Source directory has no valid name")?
        .to_string();

    let file = File::create(archive_path)
        .with_context(|| format!("Failed to create archive {}", archive_path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = 0usize;
    for entry in WalkDir::new(src_dir).sort_by_file_name() {
        if cancel.is_some_and(|t| t.is_cancelled()) {
            return Err(EngineError::cancelled("Archive creation cancelled").into());
        }
        let entry = entry.context("Failed to walk source directory")?;
        let relative = entry.path().strip_prefix(src_dir).context("Entry outside source dir")?;
        let mut name = root_name.clone();
        for component in relative.components() {
            name.push('/');
            name.push_str(&component.as_os_str().to_string_lossy());
        }

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), options)
                .with_context(|| format!("Failed to add directory {name}"))?;
        } else if entry.file_type().is_file() {
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("Failed to add file {name}"))?;
            let mut reader = BufReader::new(
                File::open(entry.path())
                    .with_context(|| format!("Failed to open {}", entry.path().display()))?,
            );
            io::copy(&mut reader, &mut zip).with_context(|| format!("Failed to write {name}"))?;
            files += 1;
        }
    }

    zip.finish().context("Failed to finalize archive")?;
    debug!(files, path = %archive_path.display(), "Archive created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::tempdir;
    use zip::ZipArchive;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn archive_contains_top_level_folder() {
        let src_parent = tempdir().unwrap();
        let src = src_parent.path().join("com.example.game");
        std::fs::create_dir_all(src.join("obb")).unwrap();
        std::fs::write(src.join("com.example.game.apk"), b"apk").unwrap();
        std::fs::write(src.join("obb/main.obb"), b"obb data").unwrap();
        let dest = tempdir().unwrap();

        let archive = create_zip_from_dir(&src, dest.path(), "Example v1", None).await.unwrap();
        assert_eq!(archive.extension().and_then(|e| e.to_str()), Some("zip"));

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut content = String::new();
        zip.by_name("com.example.game/obb/main.obb").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "obb data");
        assert!(zip.by_name("com.example.game/com.example.game.apk").is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_archive_is_removed() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("file"), b"x").unwrap();
        let dest = tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = create_zip_from_dir(src.path(), dest.path(), "out.zip", Some(token))
            .await
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
        assert!(!dest.path().join("out.zip").exists());
    }
}
