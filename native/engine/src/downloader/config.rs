use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use tokio::fs;
use tracing::{debug, instrument};

use crate::{
    error::EngineError,
    models::{ConfigSource, DownloaderConfig, SourceKind},
};

pub const CONFIG_FILE: &str = "downloader.json";

fn is_http_url(value: &str) -> bool {
    let v = value.to_ascii_lowercase();
    v.starts_with("http://") || v.starts_with("https://")
}

/// URL that must answer before `source` may be installed, if any.
///
/// Custom URLs are always probed; presets only when their template names a probe.
pub fn access_probe_url(source: &ConfigSource) -> Option<String> {
    match source {
        ConfigSource::CustomUrl(url) => Some(url.clone()),
        ConfigSource::Preset(kind) => {
            DownloaderConfig::preset(*kind).and_then(|cfg| cfg.access_test_url)
        }
        ConfigSource::LocalFile(_) => None,
    }
}

/// Turns an installation source into a validated config.
#[instrument(level = "debug", skip(client), err)]
pub async fn resolve_config(source: &ConfigSource, client: &reqwest::Client) -> Result<DownloaderConfig> {
    match source {
        ConfigSource::Preset(kind) => DownloaderConfig::preset(*kind).ok_or_else(|| {
            EngineError::validation(format!("{kind:?} is not a preset source")).into()
        }),
        ConfigSource::CustomUrl(url) => {
            ensure!(
                is_http_url(url),
                EngineError::validation("Config URL must start with http:// or https://")
            );
            debug!(url, "Downloading downloader config");
            let response = client
                .get(url)
                .send()
                .await
                .context("Failed to download downloader config")?
                .error_for_status()
                .map_err(|e| EngineError::network(format!("Config download failed: {e}"), false))?;
            let body = response.text().await.context("Failed to read downloader config")?;
            let mut cfg = DownloaderConfig::parse(&body)
                .map_err(|e| EngineError::validation(format!("{e:#}")))?;
            cfg.source_kind = SourceKind::CustomUrl;
            Ok(cfg)
        }
        ConfigSource::LocalFile(path) => {
            ensure!(path.is_file(), EngineError::validation("Source file not found"));
            DownloaderConfig::load_from_path(path)
                .map_err(|e| EngineError::validation(format!("{e:#}")).into())
        }
    }
}

/// Writes `cfg` to `downloader.json` in `app_dir` through a temporary file and a rename.
#[instrument(level = "debug", skip(cfg), fields(id = %cfg.id), err)]
pub async fn write_config(app_dir: &Path, cfg: &DownloaderConfig) -> Result<PathBuf> {
    fs::create_dir_all(app_dir)
        .await
        .with_context(|| format!("Failed to create {}", app_dir.display()))?;
    let dst = app_dir.join(CONFIG_FILE);
    let tmp = app_dir.join(format!("{CONFIG_FILE}.tmp"));
    let content = serde_json::to_string_pretty(cfg)?;
    fs::write(&tmp, content).await.context("Failed to write temporary config file")?;
    fs::rename(&tmp, &dst).await.with_context(|| format!("Failed to replace {}", dst.display()))?;
    debug!(path = %dst.display(), "Installed downloader.json");
    Ok(dst)
}

/// Loads the installed config. `Ok(None)` when nothing is installed.
pub fn load_installed(app_dir: &Path) -> Result<Option<DownloaderConfig>> {
    let path = app_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    DownloaderConfig::load_from_path(&path).map(Some)
}
