//! Error taxonomy shared by all engine components.
//!
//! Components return `anyhow::Result` like everywhere else in the crate; an
//! [`EngineError`] is attached at the point where the failure category is known
//! and is recovered later by walking the error chain.

use std::io;

use thiserror::Error;

/// Category of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    Connectivity,
    Execution,
    Validation,
    Network,
    Filesystem,
    State,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Device disconnected, adb server unreachable, command timed out.
    #[error("device connectivity error: {0}")]
    Connectivity(String),
    /// The device or a tool rejected the operation.
    #[error("{0}")]
    Execution(String),
    /// Malformed request, caught before any work starts.
    #[error("{0}")]
    Validation(String),
    #[error("{message}")]
    Network { message: String, transient: bool },
    #[error("{0}")]
    Filesystem(String),
    /// A required component is not in a usable state.
    #[error("{0}")]
    State(String),
    #[error("{0}")]
    Cancelled(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Network { .. } => ErrorKind::Network,
            Self::Filesystem(_) => ErrorKind::Filesystem,
            Self::State(_) => ErrorKind::State,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    pub fn network(message: impl Into<String>, transient: bool) -> Self {
        Self::Network { message: message.into(), transient }
    }
}

/// Returns the outermost [`EngineError`], whether attached as context or as a source.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>().or_else(|| err.chain().find_map(|e| e.downcast_ref()))
}

pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    engine_error(err).map(EngineError::kind)
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    kind_of(err) == Some(ErrorKind::Cancelled)
}

/// Whether retrying the failed operation may succeed.
///
/// Tagged errors decide for themselves. Untagged chains are transient only if they
/// carry an I/O error or a reqwest timeout/connect error.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(tagged) = engine_error(err) {
        return match tagged {
            EngineError::Connectivity(_) => true,
            EngineError::Network { transient, .. } => *transient,
            _ => false,
        };
    }
    err.chain().any(|e| {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return !matches!(
                io_err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            );
        }
        if let Some(http_err) = e.downcast_ref::<reqwest::Error>() {
            return http_err.is_timeout() || http_err.is_connect();
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, Result, anyhow};

    use super::*;

    #[test]
    fn kind_survives_added_context() {
        let err = anyhow::Error::new(EngineError::validation("bad package"))
            .context("Failed to submit task");
        assert_eq!(kind_of(&err), Some(ErrorKind::Validation));
        assert!(!is_transient(&err));
    }

    #[test]
    fn connectivity_and_transient_network_are_retryable() {
        let err = anyhow::Error::new(EngineError::Connectivity("device offline".into()));
        assert!(is_transient(&err));

        let err = anyhow::Error::new(EngineError::network("rclone exit 1", true));
        assert!(is_transient(&err));

        let err = anyhow::Error::new(EngineError::network("remote path not found", false));
        assert!(!is_transient(&err));
    }

    #[test]
    fn io_errors_are_transient_unless_not_found() {
        let reset: Result<()> = Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
        let err = reset.context("transfer").unwrap_err();
        assert!(is_transient(&err));

        let missing: Result<()> = Err(io::Error::from(io::ErrorKind::NotFound).into());
        assert!(!is_transient(&missing.unwrap_err()));

        assert!(!is_transient(&anyhow!("plain failure")));
    }

    #[test]
    fn kind_attached_as_context_is_found() {
        let err = anyhow!("rclone exited with 1").context(EngineError::cancelled("Download cancelled"));
        assert!(is_cancelled(&err));
    }

    #[test]
    fn cancelled_is_detected() {
        let err = anyhow::Error::new(EngineError::cancelled("Task cancelled"))
            .context("Download step failed");
        assert!(is_cancelled(&err));
    }
}
