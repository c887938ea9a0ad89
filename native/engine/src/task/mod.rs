//! Task scheduling: admission, lanes and the per-task state machine.

use crate::models::{BackupParts, TaskStatus};

mod backup;
mod donate;
mod download;
mod install;
mod lanes;
mod manager;

pub use lanes::Lanes;
pub use manager::TaskManager;

macro_rules! acquire_permit_or_cancel {
    ($semaphore:expr, $token:expr, $lane_name:literal) => {{
        if $token.is_cancelled() {
            info!(concat!("Task already cancelled before ", $lane_name, " lane acquisition"));
            return Err($crate::error::EngineError::cancelled(concat!(
                "Task cancelled before ",
                $lane_name,
                " lane"
            ))
            .into());
        }

        debug!(concat!("Waiting for ", $lane_name, " lane"));
        tokio::select! {
            biased;
            _ = $token.cancelled() => {
                info!(concat!("Task cancelled while waiting for ", $lane_name, " lane"));
                return Err($crate::error::EngineError::cancelled(concat!(
                    "Task cancelled while waiting for ",
                    $lane_name,
                    " lane"
                ))
                .into());
            }
            permit = $semaphore.clone().acquire_owned() => {
                permit.map_err(|_| anyhow::anyhow!(concat!($lane_name, " lane closed")))?
            }
        }
    }};
}

use acquire_permit_or_cancel;

struct ProgressUpdate {
    status: TaskStatus,
    step_number: u8,
    step_progress: Option<f32>,
    message: String,
}

/// What a cancel does to a running device step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelMode {
    /// The operation watches the token and cleans up after itself.
    Cooperative,
    /// The operation is dropped as soon as the token fires.
    Abort,
    /// Device mutation that runs to completion; the cancel is honoured afterwards.
    FinishThenCancel,
}

#[derive(Debug)]
struct DeviceStepConfig<'a> {
    step_number: u8,
    waiting_msg: &'a str,
    running_msg: String,
    log_context: &'a str,
    cancel_mode: CancelMode,
}

#[derive(Debug)]
struct InstallStepConfig<'a> {
    step_number: u8,
    log_context: &'a str,
}

#[derive(Debug)]
struct NetworkStepConfig<'a> {
    step_number: u8,
    waiting_msg: &'a str,
    /// Present participle used in progress messages, e.g. "Downloading".
    verb: &'a str,
    log_context: &'a str,
}

#[derive(Debug)]
struct BackupStepConfig {
    package_name: String,
    display_name: Option<String>,
    parts: BackupParts,
    name_suffix: Option<String>,
}

const PARTIALLY_APPLIED: &str = "Task cancelled by user; operation may have been partially applied";
