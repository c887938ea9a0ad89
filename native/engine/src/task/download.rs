use std::{error::Error, future::Future, path::PathBuf, time::Duration};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{
    NetworkStepConfig, ProgressUpdate, TaskManager, acquire_permit_or_cancel, lanes::LaneSlot,
};
use crate::{
    adb::PackageName,
    downloader::RcloneTransferStats,
    error::EngineError,
    models::TaskStatus,
    retry::{RetryPolicy, retry_transient},
};

/// Turns rclone stats into progress messages.
///
/// rclone sometimes reports more bytes than the measured total; from then on only the speed
/// is shown.
struct TransferProgress<'a> {
    verb: &'a str,
    unknown: bool,
    last_log_time: std::time::Instant,
    last_log_progress: f32,
}

impl<'a> TransferProgress<'a> {
    fn new(verb: &'a str) -> Self {
        Self { verb, unknown: false, last_log_time: std::time::Instant::now(), last_log_progress: 0.0 }
    }

    fn update(&mut self, stats: &RcloneTransferStats) -> (Option<f32>, String) {
        let speed = humansize::format_size(stats.speed, humansize::DECIMAL);
        if !self.unknown && (stats.total_bytes == 0 || stats.bytes > stats.total_bytes) {
            warn!(stats.bytes, stats.total_bytes, "Transfer progress is unknown");
            self.unknown = true;
        }
        if self.unknown {
            return (None, format!("{} (Unknown%) - {speed}/s", self.verb));
        }

        let step_progress = stats.bytes as f32 / stats.total_bytes as f32;
        let progress_percent = step_progress * 100.0;

        // Log every 10 seconds or at major milestones
        let now = std::time::Instant::now();
        let at_milestone =
            [0.25_f32, 0.5, 0.75].iter().any(|m| step_progress >= *m && step_progress < m + 0.01);
        if now.duration_since(self.last_log_time) > Duration::from_secs(10)
            || (at_milestone && self.last_log_progress != step_progress)
        {
            debug!(
                bytes = stats.bytes,
                total_bytes = stats.total_bytes,
                speed_bytes_per_sec = stats.speed,
                progress_percent,
                "{} progress",
                self.verb
            );
            self.last_log_time = now;
            self.last_log_progress = step_progress;
        }

        (Some(step_progress), format!("{} ({progress_percent:.1}%) - {speed}/s", self.verb))
    }
}

impl TaskManager {
    /// Waits for a network lane, then runs `op` with transient failures retried.
    ///
    /// `op` gets a fresh stats sender per attempt; its stats become step progress.
    #[instrument(level = "debug", skip(self, lane, update_progress, token, op))]
    pub(super) async fn run_network_step<'a, F, Fut, T>(
        &self,
        cfg: NetworkStepConfig<'a>,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(mpsc::UnboundedSender<RcloneTransferStats>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        lane.release();
        update_progress(ProgressUpdate {
            status: TaskStatus::Waiting,
            step_number: cfg.step_number,
            step_progress: None,
            message: cfg.waiting_msg.into(),
        });

        let permit = acquire_permit_or_cancel!(self.lanes.network, token, "network");
        lane.hold(permit);
        debug!(
            network_permits_remaining = self.lanes.network.available_permits(),
            "Acquired network lane for {}", cfg.log_context
        );

        update_progress(ProgressUpdate {
            status: TaskStatus::Running,
            step_number: cfg.step_number,
            step_progress: None,
            message: format!("{}...", cfg.verb),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<RcloneTransferStats>();
        let policy = RetryPolicy::for_network(&self.settings.borrow());
        let transfer = retry_transient(policy, token, cfg.log_context, |attempt| {
            if attempt > 1 {
                update_progress(ProgressUpdate {
                    status: TaskStatus::Running,
                    step_number: cfg.step_number,
                    step_progress: None,
                    message: format!("{} (attempt {attempt}/{})...", cfg.verb, policy.attempts),
                });
            }
            op(tx.clone())
        });
        tokio::pin!(transfer);

        debug!("Starting {} monitoring", cfg.log_context);
        let mut progress = TransferProgress::new(cfg.verb);
        let result = loop {
            tokio::select! {
                result = &mut transfer => break result,
                Some(stats) = rx.recv() => {
                    let (step_progress, message) = progress.update(&stats);
                    update_progress(ProgressUpdate {
                        status: TaskStatus::Running,
                        step_number: cfg.step_number,
                        step_progress,
                        message,
                    });
                }
            }
        };
        info!(context = cfg.log_context, ok = result.is_ok(), "Network step finished");
        result
    }

    /// Step 1 of download tasks: fetches a release into the downloads directory.
    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn run_download_step(
        &self,
        full_name: &str,
        step_number: u8,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        self.run_network_step(
            NetworkStepConfig {
                step_number,
                waiting_msg: "Waiting to start download...",
                verb: "Downloading",
                log_context: "download",
            },
            lane,
            update_progress,
            token,
            |tx| self.catalog.download_app(full_name, tx, token),
        )
        .await
    }

    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_download(
        &self,
        full_name: &str,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        debug!(
            app_name = full_name,
            network_permits_available = self.lanes.network.available_permits(),
            "Starting download task"
        );
        self.run_download_step(full_name, 1, lane, update_progress, token).await
    }

    #[instrument(skip(self, lane, update_progress, token))]
    pub(super) async fn handle_download_install(
        &self,
        full_name: &str,
        package: PackageName,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(
            app_name = full_name,
            network_permits_available = self.lanes.network.available_permits(),
            device_permits_available = self.lanes.device.available_permits(),
            "Starting download and install task"
        );

        let app_path = self.run_download_step(full_name, 1, lane, update_progress, token).await?;

        if token.is_cancelled() {
            warn!("Task was cancelled after download completion");
            return Err(EngineError::cancelled("Task cancelled after download").into());
        }

        self.install_downloaded_app(&app_path, &package, 2, lane, update_progress, token).await?;

        let policy = self.settings.borrow().cleanup_policy;
        match self.downloads.apply_cleanup_policy(policy, &app_path).await {
            Ok(summary) => debug!(?policy, ?summary, "Applied downloads cleanup policy"),
            Err(e) => error!(
                error = e.as_ref() as &dyn Error,
                "Failed to apply downloads cleanup policy after install"
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: u64, total_bytes: u64) -> RcloneTransferStats {
        RcloneTransferStats { bytes, total_bytes, eta: None, speed: 2_000 }
    }

    #[test]
    fn progress_becomes_unknown_once_bytes_exceed_total() {
        let mut progress = TransferProgress::new("Downloading");

        let (step, message) = progress.update(&stats(50, 200));
        assert_eq!(step, Some(0.25));
        assert_eq!(message, "Downloading (25.0%) - 2 kB/s");

        let (step, message) = progress.update(&stats(300, 200));
        assert_eq!(step, None);
        assert!(message.starts_with("Downloading (Unknown%)"));

        // Stays unknown even if the numbers look sane again
        assert_eq!(progress.update(&stats(10, 200)).0, None);
    }

    #[test]
    fn missing_total_is_unknown() {
        let mut progress = TransferProgress::new("Uploading archive");
        assert_eq!(progress.update(&stats(10, 0)).0, None);
    }
}
