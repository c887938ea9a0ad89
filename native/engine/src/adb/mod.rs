use std::fmt;

use anyhow::Result;
use lazy_regex::{Lazy, Regex, lazy_regex};

use crate::error::EngineError;

mod bridge;
mod command;
pub mod device;
mod session;

pub use bridge::{AdbBridge, AdbCli, DeviceBrief, parse_devices_output};
#[cfg(test)]
pub(crate) use bridge::FakeBridge;
pub use command::{AdbCommand, CommandFailure, CommandKind, RebootMode};
pub use device::AdbDevice;
pub use session::{DeviceSession, SessionConfig};

pub static PACKAGE_NAME_REGEX: Lazy<Regex> =
    lazy_regex!(r"^(?:[A-Za-z]{1}[\w]*\.)+[A-Za-z][\w]*$");

/// Validated Android package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageName(String);

impl PackageName {
    /// Validates and constructs a `PackageName` from the provided string-like value.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value_ref = value.as_ref();
        if !PACKAGE_NAME_REGEX.is_match(value_ref) {
            return Err(EngineError::validation(format!("Invalid package name: '{value_ref}'")).into());
        }
        Ok(Self(value_ref.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};

    #[test]
    fn package_names_are_validated() {
        assert!(PackageName::parse("com.example.game").is_ok());
        assert!(PackageName::parse("com.Example_1.vr2").is_ok());
        for bad in ["", "nodots", "com..example", "1com.example", "com.example.", "com.ex ample"] {
            let err = PackageName::parse(bad).unwrap_err();
            assert_eq!(kind_of(&err), Some(ErrorKind::Validation), "{bad}");
        }
    }
}
