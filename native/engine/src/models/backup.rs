use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPart {
    Apk,
    PrivateData,
    SharedData,
    Obb,
}

impl BackupPart {
    pub const ALL: [BackupPart; 4] =
        [BackupPart::Apk, BackupPart::PrivateData, BackupPart::SharedData, BackupPart::Obb];

    /// Sub-directory holding this part inside a backup; the APK lives at the root.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            Self::Apk => None,
            Self::PrivateData => Some("data_private"),
            Self::SharedData => Some("data"),
            Self::Obb => Some("obb"),
        }
    }
}

impl fmt::Display for BackupPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Apk => "apk",
            Self::PrivateData => "private data",
            Self::SharedData => "shared data",
            Self::Obb => "obb",
        })
    }
}

/// Selected parts of an app backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupParts {
    pub apk: bool,
    pub private_data: bool,
    pub shared_data: bool,
    pub obb: bool,
}

impl BackupParts {
    pub fn all() -> Self {
        Self { apk: true, private_data: true, shared_data: true, obb: true }
    }

    /// Private and shared data only, used before a forced reinstall.
    pub fn data_only() -> Self {
        Self { private_data: true, shared_data: true, ..Self::default() }
    }

    pub fn contains(&self, part: BackupPart) -> bool {
        match part {
            BackupPart::Apk => self.apk,
            BackupPart::PrivateData => self.private_data,
            BackupPart::SharedData => self.shared_data,
            BackupPart::Obb => self.obb,
        }
    }

    pub fn is_empty(&self) -> bool {
        BackupPart::ALL.iter().all(|p| !self.contains(*p))
    }

    pub fn iter(&self) -> impl Iterator<Item = BackupPart> + '_ {
        BackupPart::ALL.into_iter().filter(|p| self.contains(*p))
    }
}

impl fmt::Display for BackupParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        if parts.is_empty() { f.write_str("nothing") } else { f.write_str(&parts.join(", ")) }
    }
}

/// A backup directory found under the backups root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub path: String,
    pub name: String,
    pub timestamp: u64,
    pub total_size: u64,
    pub has_apk: bool,
    pub has_private_data: bool,
    pub has_shared_data: bool,
    pub has_obb: bool,
}

/// Why a requested part did not end up in the backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartFailure {
    pub part: BackupPart,
    pub reason: String,
}

/// Manifest written next to the captured parts as `backup.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: String,
    pub requested: Vec<BackupPart>,
    pub captured: Vec<BackupPart>,
    #[serde(default)]
    pub failed: Vec<PartFailure>,
}

/// Result of a bulk deletion: `removed + skipped` equals the number of entries visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    pub removed: u32,
    pub skipped: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_display_and_emptiness() {
        assert!(BackupParts::default().is_empty());
        let parts = BackupParts { apk: true, obb: true, ..Default::default() };
        assert_eq!(parts.to_string(), "apk, obb");
        assert_eq!(parts.iter().collect::<Vec<_>>(), vec![BackupPart::Apk, BackupPart::Obb]);
        assert_eq!(BackupParts::data_only().iter().count(), 2);
    }
}
