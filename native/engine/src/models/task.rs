use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::BackupParts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Download,
    DownloadInstall,
    InstallApk,
    InstallLocalApp,
    Uninstall,
    BackupApp,
    RestoreBackup,
    DonateApp,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Download => "Download",
            Self::DownloadInstall => "Download & Install",
            Self::InstallApk => "Install APK",
            Self::InstallLocalApp => "Install local app",
            Self::Uninstall => "Uninstall",
            Self::BackupApp => "Backup",
            Self::RestoreBackup => "Restore",
            Self::DonateApp => "Donate",
        }
    }

    /// Kinds that cannot do anything useful without a connected device.
    pub fn needs_device(&self) -> bool {
        !matches!(self, Self::Download)
    }

    /// Kinds that go through the configured remote.
    pub fn needs_downloader(&self) -> bool {
        matches!(self, Self::Download | Self::DownloadInstall | Self::DonateApp)
    }

    /// Kinds that write under the downloads location.
    pub fn needs_downloads_storage(&self) -> bool {
        matches!(self, Self::Download | Self::DownloadInstall | Self::DonateApp)
    }

    /// Kinds that read or write under the backups location.
    pub fn needs_backups_storage(&self) -> bool {
        matches!(self, Self::BackupApp | Self::RestoreBackup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle moving forward.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

/// A request to run a task, one variant per task kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRequest {
    Download {
        full_name: String,
        package_name: String,
    },
    DownloadInstall {
        full_name: String,
        package_name: String,
    },
    InstallApk {
        apk_path: PathBuf,
    },
    InstallLocalApp {
        app_path: PathBuf,
    },
    Uninstall {
        package_name: String,
        display_name: Option<String>,
    },
    BackupApp {
        package_name: String,
        display_name: Option<String>,
        parts: BackupParts,
        name_suffix: Option<String>,
    },
    RestoreBackup {
        path: PathBuf,
    },
    DonateApp {
        package_name: String,
        display_name: Option<String>,
    },
}

impl TaskRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Download { .. } => TaskKind::Download,
            Self::DownloadInstall { .. } => TaskKind::DownloadInstall,
            Self::InstallApk { .. } => TaskKind::InstallApk,
            Self::InstallLocalApp { .. } => TaskKind::InstallLocalApp,
            Self::Uninstall { .. } => TaskKind::Uninstall,
            Self::BackupApp { .. } => TaskKind::BackupApp,
            Self::RestoreBackup { .. } => TaskKind::RestoreBackup,
            Self::DonateApp { .. } => TaskKind::DonateApp,
        }
    }

    /// Human readable name shown next to the task.
    pub fn task_name(&self) -> String {
        fn file_label(path: &std::path::Path) -> String {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        }

        match self {
            Self::Download { full_name, .. } | Self::DownloadInstall { full_name, .. } => {
                full_name.clone()
            }
            Self::InstallApk { apk_path } => file_label(apk_path),
            Self::InstallLocalApp { app_path } => file_label(app_path),
            Self::RestoreBackup { path } => file_label(path),
            Self::Uninstall { package_name, display_name }
            | Self::BackupApp { package_name, display_name, .. }
            | Self::DonateApp { package_name, display_name } => {
                display_name.clone().unwrap_or_else(|| package_name.clone())
            }
        }
    }

    pub fn total_steps(&self) -> u8 {
        match self {
            Self::DownloadInstall { .. } => 2,
            Self::DonateApp { .. } => 3,
            _ => 1,
        }
    }
}

/// Task record kept by the task manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: u64,
    pub kind: TaskKind,
    pub name: String,
    pub status: TaskStatus,
    /// `None` while the current step has no measurable progress.
    pub progress: Option<f32>,
    pub message: String,
    pub current_step: u8,
    pub total_steps: u8,
    pub created_at: u64,
    pub finished_at: Option<u64>,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} ({})", self.id, self.kind.label(), self.name)
    }
}

/// Progress delta published for every task update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: u64,
    pub task_kind: TaskKind,
    pub task_name: String,
    pub status: TaskStatus,
    pub total_progress: Option<f32>,
    pub message: String,
    pub current_step: u8,
    pub total_steps: u8,
    pub step_progress: Option<f32>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use TaskStatus::*;
        assert!(Waiting.can_advance_to(Running));
        assert!(Waiting.can_advance_to(Cancelled));
        assert!(Running.can_advance_to(Running));
        assert!(Running.can_advance_to(Failed));
        assert!(!Running.can_advance_to(Waiting));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Cancelled.can_advance_to(Running));
    }

    #[test]
    fn task_name_prefers_display_name() {
        let request = TaskRequest::Uninstall {
            package_name: "com.example.game".into(),
            display_name: Some("Example Game".into()),
        };
        assert_eq!(request.task_name(), "Example Game");

        let request = TaskRequest::InstallApk { apk_path: PathBuf::from("/tmp/some/app.apk") };
        assert_eq!(request.task_name(), "app.apk");
        assert_eq!(request.kind(), TaskKind::InstallApk);
    }
}
