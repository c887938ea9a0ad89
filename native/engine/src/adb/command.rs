use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adb::PackageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebootMode {
    Normal,
    Bootloader,
    Recovery,
    Fastboot,
    PowerOff,
}

impl RebootMode {
    pub(crate) fn shell_command(&self) -> &'static str {
        match self {
            Self::Normal => "reboot",
            Self::Bootloader => "reboot bootloader",
            Self::Recovery => "reboot recovery",
            Self::Fastboot => "reboot fastboot",
            Self::PowerOff => "reboot -p",
        }
    }
}

/// Ad-hoc device commands executed outside the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdbCommand {
    LaunchApp(String),
    ForceStopApp(String),
    Reboot(RebootMode),
    /// `true` enables the real sensor, `false` fakes it as covered.
    SetProximitySensor(bool),
    SetGuardianPaused(bool),
    GetBatteryDump,
    RefreshDevice,
}

/// Command type, used together with the caller's key to deduplicate in-flight commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    LaunchApp,
    ForceStopApp,
    Reboot,
    ProximitySensorSet,
    GuardianPausedSet,
    BatteryDump,
    RefreshDevice,
}

impl AdbCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::LaunchApp(_) => CommandKind::LaunchApp,
            Self::ForceStopApp(_) => CommandKind::ForceStopApp,
            Self::Reboot(_) => CommandKind::Reboot,
            Self::SetProximitySensor(_) => CommandKind::ProximitySensorSet,
            Self::SetGuardianPaused(_) => CommandKind::GuardianPausedSet,
            Self::GetBatteryDump => CommandKind::BatteryDump,
            Self::RefreshDevice => CommandKind::RefreshDevice,
        }
    }

    /// Rejects malformed arguments before touching the device.
    pub(crate) fn validate(&self) -> Result<(), CommandFailure> {
        match self {
            Self::LaunchApp(package) | Self::ForceStopApp(package) => PackageName::parse(package)
                .map(|_| ())
                .map_err(|e| CommandFailure::Terminal(format!("{e:#}"))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandFailure {
    /// Connection reset, device offline, I/O errors. Retried by the session.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Rejected by the device or invalid. Surfaced immediately.
    #[error("{0}")]
    Terminal(String),
}

impl CommandFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for CommandFailure {
    fn from(err: anyhow::Error) -> Self {
        if crate::error::is_transient(&err) {
            Self::Transient(format!("{err:#}"))
        } else {
            Self::Terminal(format!("{err:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn failures_are_classified_from_error_kind() {
        let offline: CommandFailure =
            anyhow::Error::new(EngineError::Connectivity("device offline".into())).into();
        assert!(offline.is_transient());

        let rejected: CommandFailure =
            anyhow::Error::new(EngineError::Execution("Failure [DELETE_FAILED]".into())).into();
        assert!(!rejected.is_transient());
    }

    #[test]
    fn launch_requires_valid_package() {
        assert!(AdbCommand::LaunchApp("com.example.app".into()).validate().is_ok());
        assert!(matches!(
            AdbCommand::ForceStopApp("not a package".into()).validate(),
            Err(CommandFailure::Terminal(_))
        ));
        assert_eq!(AdbCommand::Reboot(RebootMode::Recovery).kind(), CommandKind::Reboot);
    }
}
