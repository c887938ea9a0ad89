use std::{collections::HashMap, fmt, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Where a downloader configuration comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    PresetA,
    PresetB,
    PresetC,
    CustomUrl,
    LocalFile,
}

/// Installation source requested by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Preset(SourceKind),
    CustomUrl(String),
    LocalFile(std::path::PathBuf),
}

impl ConfigSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Preset(kind) => *kind,
            Self::CustomUrl(_) => SourceKind::CustomUrl,
            Self::LocalFile(_) => SourceKind::LocalFile,
        }
    }
}

/// Installed configuration, stored as `downloader.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// ID of the config. Used for cache separation.
    pub id: String,
    pub source_kind: SourceKind,
    /// Overrides the rclone binary from settings.
    #[serde(default)]
    pub rclone_path: Option<RclonePath>,
    #[serde(default)]
    pub rclone_config_path: Option<String>,
    pub remote_name: String,
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_list_path")]
    pub list_path: String,
    /// Probed before installation when the source sits behind restricted networks.
    #[serde(default)]
    pub access_test_url: Option<String>,
    /// Optional remote used for donation uploads.
    #[serde(default)]
    pub donation_remote_name: Option<String>,
    #[serde(default)]
    pub donation_remote_path: Option<String>,
    /// Packages never accepted as donations.
    #[serde(default)]
    pub donation_blacklist: Vec<String>,
    /// Remote file (under `root_dir`) with more blacklisted packages, one per line.
    #[serde(default)]
    pub donation_blacklist_path: Option<String>,
}

fn default_root_dir() -> String {
    "Quest Games".to_string()
}

fn default_list_path() -> String {
    "VRP-GameList.txt".to_string()
}

impl DownloaderConfig {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse downloader.json").inspect_err(|e| {
            error!("Failed to parse downloader.json: {:#}", e);
        })
    }

    pub fn is_donation_configured(&self) -> bool {
        self.donation_remote_name.is_some() && self.donation_remote_path.is_some()
    }

    /// Built-in template for a preset source.
    pub fn preset(kind: SourceKind) -> Option<Self> {
        let (id, remote, access_test_url) = match kind {
            SourceKind::PresetA => ("preset-a", "mirror-a", None),
            SourceKind::PresetB => {
                ("preset-b", "mirror-b", Some("https://mirror-b.vrsrc.net/health".to_string()))
            }
            SourceKind::PresetC => {
                ("preset-c", "mirror-c", Some("https://mirror-c.vrsrc.net/health".to_string()))
            }
            SourceKind::CustomUrl | SourceKind::LocalFile => return None,
        };
        Some(Self {
            id: id.to_string(),
            source_kind: kind,
            rclone_path: None,
            rclone_config_path: None,
            remote_name: remote.to_string(),
            root_dir: default_root_dir(),
            list_path: default_list_path(),
            access_test_url,
            donation_remote_name: None,
            donation_remote_path: None,
            donation_blacklist: Vec::new(),
            donation_blacklist_path: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RclonePath {
    Single(String),
    Map(HashMap<String, String>),
}

#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: &str = "windows";
#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: &str = "linux";
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: &str = "macos";
#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
pub const CURRENT_PLATFORM: &str = "other";

#[cfg(target_arch = "x86_64")]
pub const CURRENT_ARCH: &str = "x64";
#[cfg(target_arch = "aarch64")]
pub const CURRENT_ARCH: &str = "arm64";
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const CURRENT_ARCH: &str = "other";

pub fn current_platform_arch_key() -> String {
    format!("{CURRENT_PLATFORM}-{CURRENT_ARCH}")
}

impl RclonePath {
    pub fn resolve_for_current_platform(&self) -> Result<String> {
        match self {
            RclonePath::Single(s) => Ok(s.clone()),
            RclonePath::Map(map) => {
                if let Some(v) = map.get(&current_platform_arch_key()) {
                    return Ok(v.clone());
                }
                if let Some(v) = map.get(CURRENT_PLATFORM) {
                    return Ok(v.clone());
                }
                let available: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
                Err(anyhow::anyhow!(
                    "rclone_path missing key: '{}' or '{}' (available: {:?})",
                    current_platform_arch_key(),
                    CURRENT_PLATFORM,
                    available
                ))
            }
        }
    }
}

impl fmt::Display for RclonePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve_for_current_platform() {
            Ok(s) => write!(f, "{s}"),
            Err(_) => match self {
                RclonePath::Single(s) => write!(f, "{s}"),
                RclonePath::Map(map) => write!(f, "<map keys={:?}>", map.keys().collect::<Vec<_>>()),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum ConfigState {
    #[default]
    NotConfigured,
    Installing,
    Installed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessTestResult {
    Ok,
    Timeout,
    /// HTTP status code, or 0 when no response was received.
    Error(u16),
}

/// Runtime state of the downloader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloaderStatus {
    pub config_id: Option<String>,
    pub source_kind: Option<SourceKind>,
    pub state: ConfigState,
    pub last_test_result: Option<AccessTestResult>,
    pub donation_configured: bool,
}
