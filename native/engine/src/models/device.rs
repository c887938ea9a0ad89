use anyhow::{Context, Result};
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Connection state of the selected device as reported by `adb devices`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// The last poll failed (adb missing, server down, timeout).
    #[default]
    Unknown,
    Offline,
    NoPermissions,
    Unauthorized,
    Authorizing,
    Bootloader,
    Recovery,
    Sideload,
    Connected,
}

impl DeviceState {
    /// Maps the state column of `adb devices -l`.
    pub fn from_adb(state: &str) -> Self {
        match state.trim() {
            "device" => Self::Connected,
            "offline" | "host" | "disconnected" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "authorizing" | "connecting" => Self::Authorizing,
            "bootloader" => Self::Bootloader,
            "recovery" | "rescue" => Self::Recovery,
            "sideload" => Self::Sideload,
            s if s.starts_with("no permissions") => Self::NoPermissions,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    Usb,
    Wireless,
}

impl ConnectionType {
    /// Wireless transports use `host:port` as serial.
    pub fn from_serial(serial: &str) -> Self {
        if serial.contains(':') { Self::Wireless } else { Self::Usb }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerHand {
    Left,
    Right,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerStatus {
    Active,
    Inactive,
    Searching,
    Disabled,
    #[default]
    Unknown,
}

impl From<&str> for ControllerStatus {
    fn from(value: &str) -> Self {
        match value.trim() {
            "Active" | "CONNECTED_ACTIVE" => Self::Active,
            "Inactive" | "CONNECTED_INACTIVE" => Self::Inactive,
            "Searching" | "SEARCHING" => Self::Searching,
            "Disabled" | "DISABLED" => Self::Disabled,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ControllerInfo {
    pub hand: ControllerHand,
    pub battery_level: Option<u8>,
    pub status: ControllerStatus,
}

/// Preferred command to query controllers.
pub const CONTROLLER_INFO_COMMAND_JSON: &str = "rstest info --json";
/// Fallback for system versions without `rstest`.
pub const CONTROLLER_INFO_COMMAND_DUMPSYS: &str = "dumpsys OVRRemoteService | grep Battery";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RstestControllerItem {
    #[serde(rename = "type")]
    controller_type: String,
    #[serde(default)]
    battery_level: Option<u8>,
    #[serde(default)]
    status: Option<String>,
}

/// Parses `rstest info --json` output.
pub fn parse_controllers_json(json: &str) -> Result<Vec<ControllerInfo>> {
    let items: Vec<RstestControllerItem> =
        serde_json::from_str(json).context("Failed to deserialize rstest output")?;
    let mut controllers = Vec::new();
    for item in items {
        let hand = match item.controller_type.as_str() {
            "LeftHand" | "Left" => ControllerHand::Left,
            "RightHand" | "Right" => ControllerHand::Right,
            other => {
                warn!(controller_type = other, "Unexpected controller type");
                continue;
            }
        };
        controllers.push(ControllerInfo {
            hand,
            battery_level: item.battery_level,
            status: item.status.as_deref().map(ControllerStatus::from).unwrap_or_default(),
        });
    }
    Ok(controllers)
}

/// Parses the `dumpsys OVRRemoteService` battery lines.
pub fn parse_controllers_dumpsys(lines: &str) -> Vec<ControllerInfo> {
    let re = regex!(
        r#"^\s*Paired.+Type:\s*(?<type>\w{4,5}).+Battery:\s*(?<battery>-?\d{1,3})%.+ Status: (?<status>\w+).*$"#m
    );
    re.captures_iter(lines)
        .filter_map(|caps| {
            let hand = match &caps["type"] {
                "Left" => ControllerHand::Left,
                "Right" => ControllerHand::Right,
                _ => return None,
            };
            Some(ControllerInfo {
                hand,
                battery_level: caps["battery"].parse::<u8>().ok(),
                status: ControllerStatus::from(&caps["status"]),
            })
        })
        .collect()
}

/// An app installed on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstalledPackage {
    pub package_name: String,
    pub version_code: u64,
    pub system: bool,
}

/// Parses `pm list packages --show-versioncode` output.
/// `system_packages` is the output of `pm list packages -s`.
pub fn parse_package_list(output: &str, system_packages: &str) -> Vec<InstalledPackage> {
    let system: std::collections::HashSet<&str> = system_packages
        .lines()
        .filter_map(|l| l.trim().strip_prefix("package:"))
        .map(|l| l.split_whitespace().next().unwrap_or(l))
        .collect();

    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("package:")?;
            let mut package_name = None;
            let mut version_code = 0;
            for token in rest.split_whitespace() {
                if let Some(v) = token.strip_prefix("versionCode:") {
                    version_code = v.parse().unwrap_or(0);
                } else if package_name.is_none() {
                    package_name = Some(token.to_string());
                }
            }
            let package_name = package_name?;
            let system = system.contains(package_name.as_str());
            Some(InstalledPackage { package_name, version_code, system })
        })
        .collect()
}

/// Snapshot of the selected device, published by the device session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceConnection {
    pub state: DeviceState,
    pub serial: Option<String>,
    pub product_name: Option<String>,
    /// Manufacturer and model, when the device allowed reading them.
    pub name: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub battery_level: Option<u8>,
    pub controllers: Vec<ControllerInfo>,
    pub installed_packages: Vec<InstalledPackage>,
}

impl DeviceConnection {
    pub fn with_state(state: DeviceState) -> Self {
        Self { state, ..Self::default() }
    }

    pub fn is_connected(&self) -> bool {
        self.state == DeviceState::Connected && self.serial.is_some()
    }

    pub fn installed_package(&self, package_name: &str) -> Option<&InstalledPackage> {
        self.installed_packages.iter().find(|p| p.package_name == package_name)
    }
}
