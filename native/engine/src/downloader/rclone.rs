use std::{error::Error, path::PathBuf, process::Stdio};

use anyhow::{Context, Result, anyhow, ensure};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc::UnboundedSender,
};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, info, instrument, trace, warn};

use crate::{error::EngineError, utils::get_sys_proxy};

static CONNECTION_TIMEOUT: &str = "5s";
static IO_IDLE_TIMEOUT: &str = "30s";
/// Lines of rclone's stderr kept for the error message of a failed transfer.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct RcloneSizeOutput {
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RcloneTransferStats {
    pub bytes: u64,
    pub total_bytes: u64,
    pub eta: Option<u64>,
    #[serde(deserialize_with = "deserialize_speed")]
    pub speed: u64,
}

fn deserialize_speed<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let speed = f64::deserialize(deserializer)?;
    Ok(speed as u64)
}

#[derive(Debug, Clone, Deserialize)]
struct RcloneStatLine {
    stats: RcloneTransferStats,
}

#[derive(Debug, Clone, Copy)]
pub enum RcloneTransferOperation {
    Copy,
    Sync,
}

impl RcloneTransferOperation {
    pub fn as_str(&self) -> &str {
        match self {
            RcloneTransferOperation::Copy => "copy",
            RcloneTransferOperation::Sync => "sync",
        }
    }
}

/// Tags an rclone failure. Missing remote paths won't appear on retry, everything else might.
fn rclone_failure(code: Option<i32>, stderr: &str) -> EngineError {
    let lowered = stderr.to_ascii_lowercase();
    let transient = !(lowered.contains("directory not found")
        || lowered.contains("object not found")
        || lowered.contains("didn't find section in config file"));
    EngineError::network(
        format!(
            "rclone failed with exit code {}, stderr: {}",
            code.map_or("unknown".to_string(), |c| c.to_string()),
            stderr.trim()
        ),
        transient,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RcloneClient {
    rclone_path: PathBuf,
    config_path: Option<PathBuf>,
    sys_proxy: Option<String>,
    bandwidth_limit: String,
}

impl RcloneClient {
    #[instrument(level = "debug", fields(sys_proxy))]
    fn new(rclone_path: PathBuf, config_path: Option<PathBuf>, bandwidth_limit: String) -> Self {
        let sys_proxy = get_sys_proxy();
        Span::current().record("sys_proxy", sys_proxy.as_deref());
        Self { rclone_path, config_path, sys_proxy, bandwidth_limit }
    }

    #[instrument(skip(self), level = "trace")]
    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.rclone_path);
        command.kill_on_drop(true);

        #[cfg(target_os = "windows")]
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW

        if let Some(proxy) = &self.sys_proxy {
            trace!(proxy, "Using system proxy");
            command.env("http_proxy", proxy);
            command.env("https_proxy", proxy);
        }

        if let Some(config_path) = &self.config_path {
            command.arg("--config").arg(config_path);
        }
        command.arg("--use-json-log");

        command.args(args);
        trace!(command = ?command, "Constructed rclone command");
        command
    }

    #[instrument(skip(self), level = "trace")]
    async fn run_to_string(&self, args: &[&str]) -> Result<String> {
        let output = self.command(args).output().await.context("Failed to run rclone")?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            trace!(stdout, "rclone command successful");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            error!(code = output.status.code().unwrap_or(-1), stderr, "rclone command failed");
            Err(rclone_failure(output.status.code(), &stderr).into())
        }
    }

    #[instrument(skip(self), ret, err)]
    async fn size(&self, path: &str) -> Result<RcloneSizeOutput> {
        let output = self.run_to_string(&["size", "--fast-list", "--json", path]).await?;
        let size_output: RcloneSizeOutput =
            serde_json::from_str(&output).context("Failed to parse rclone size output")?;
        Ok(size_output)
    }

    /// Runs a transfer, forwarding stats lines to `stats_tx` with `total_bytes` filled in.
    ///
    /// Cancelling `token` kills rclone and returns a `Cancelled` error.
    #[instrument(skip(self, stats_tx, token), err)]
    async fn transfer(
        &self,
        source: &str,
        dest: &str,
        operation: RcloneTransferOperation,
        total_bytes: u64,
        stats_tx: Option<UnboundedSender<RcloneTransferStats>>,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(EngineError::cancelled("Transfer cancelled").into());
        }

        let mut args = vec![
            operation.as_str(),
            "--stats",
            "0.5s",
            "--stats-log-level",
            "NOTICE",
            "--fast-list",
            "--contimeout",
            CONNECTION_TIMEOUT,
            "--timeout",
            IO_IDLE_TIMEOUT,
            "--retries",
            "3",
            "--transfers",
            "8",
        ];

        if !self.bandwidth_limit.is_empty() {
            args.extend_from_slice(&["--bwlimit", &self.bandwidth_limit]);
        }

        args.extend_from_slice(&[source, dest]);

        let mut child = self
            .command(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn rclone")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;
        let mut lines = BufReader::new(stderr).lines();

        let transfer_future = async {
            let mut stats_tx = stats_tx;
            let mut tail: Vec<String> = Vec::new();
            // Stats must be drained even without a receiver or rclone blocks on a full pipe
            while let Some(line) = lines.next_line().await? {
                match serde_json::from_str::<RcloneStatLine>(&line) {
                    Ok(stat_line) => {
                        let mut stats = stat_line.stats;
                        stats.total_bytes = total_bytes;
                        trace!(?stats, "rclone stats");
                        if let Some(tx) = &stats_tx
                            && tx.send(stats).is_err()
                        {
                            warn!("Stats receiver dropped, no longer forwarding stats");
                            stats_tx = None;
                        }
                    }
                    Err(e) => {
                        debug!(line = line, error = &e as &dyn Error, "Non-stats rclone output");
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                }
            }

            let status = child.wait().await?;
            if status.success() {
                Ok(())
            } else {
                let stderr = tail.join("\n");
                error!(code = status.code().unwrap_or(-1), stderr = %stderr, "rclone transfer failed");
                Err(anyhow!(rclone_failure(status.code(), &stderr)))
            }
        };

        tokio::select! {
            res = transfer_future => res,
            _ = token.cancelled() => {
                warn!("rclone transfer cancelled");
                Err(EngineError::cancelled("Transfer cancelled").into())
            }
        }
    }
}

/// An rclone remote rooted at a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcloneStorage {
    client: RcloneClient,
    remote: String,
    root_dir: String,
}

impl RcloneStorage {
    #[instrument(level = "debug")]
    pub fn new(
        rclone_path: PathBuf,
        config_path: Option<PathBuf>,
        remote: String,
        root_dir: String,
        bandwidth_limit: String,
    ) -> Self {
        Self {
            client: RcloneClient::new(rclone_path, config_path, bandwidth_limit),
            remote,
            root_dir,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote
    }

    fn format_remote_path(&self, path: &str) -> String {
        let root = self.root_dir.trim_end_matches(['/', '\\']);
        let path = path.trim_start_matches(['/', '\\']);
        if root.is_empty() {
            format!("{}:{}", self.remote, path)
        } else {
            format!("{}:{}/{}", self.remote, root, path)
        }
    }

    /// Mirrors the remote directory `source` into `dest`.
    #[instrument(skip(self, stats_tx, token), err, ret)]
    pub async fn download_dir_with_stats(
        &self,
        source: &str,
        dest: PathBuf,
        stats_tx: UnboundedSender<RcloneTransferStats>,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        ensure!(dest.parent().is_some(), "destination must have a parent directory");
        let source = self.format_remote_path(source);
        let total_bytes =
            self.client.size(&source).await.context("Failed to get remote dir size")?.bytes;
        self.client
            .transfer(
                &source,
                &dest.display().to_string(),
                RcloneTransferOperation::Sync,
                total_bytes,
                Some(stats_tx),
                token,
            )
            .await
            .map(|_| dest)
    }

    /// Copies a single remote file into the directory `dest`, returning the local file path.
    #[instrument(skip(self, stats_tx, token), err, ret)]
    pub async fn download_file(
        &self,
        source: &str,
        dest: PathBuf,
        stats_tx: Option<UnboundedSender<RcloneTransferStats>>,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        ensure!(dest.is_dir(), "destination must be a directory");
        let source = self.format_remote_path(source);
        let file_name = source
            .rsplit(['/', '\\', ':'])
            .next()
            .filter(|n| !n.is_empty())
            .context("Failed to get source file name")?
            .to_string();
        info!(source = %source, dest = %dest.display(), "Starting file download");
        let total_bytes = match &stats_tx {
            Some(_) => self.client.size(&source).await.map(|s| s.bytes).unwrap_or(0),
            None => 0,
        };
        self.client
            .transfer(
                &source,
                &dest.display().to_string(),
                RcloneTransferOperation::Copy,
                total_bytes,
                stats_tx,
                token,
            )
            .await?;
        Ok(dest.join(file_name))
    }

    /// Copies a local file into `remote_dir` on this remote (relative to the root directory).
    #[instrument(skip(self, stats_tx, token), fields(file = %file.display()), err)]
    pub async fn upload_file(
        &self,
        file: &std::path::Path,
        remote_dir: &str,
        stats_tx: Option<UnboundedSender<RcloneTransferStats>>,
        token: &CancellationToken,
    ) -> Result<()> {
        ensure!(file.is_file(), EngineError::validation("Upload source must be a file"));
        let total_bytes = tokio::fs::metadata(file).await.map(|m| m.len()).unwrap_or(0);
        let dest = self.format_remote_path(remote_dir);
        info!(dest = %dest, total_bytes, "Starting upload");
        self.client
            .transfer(
                &file.display().to_string(),
                &dest,
                RcloneTransferOperation::Copy,
                total_bytes,
                stats_tx,
                token,
            )
            .await
    }
}

#[cfg(all(test, unix))]
pub(crate) mod fake {
    use std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    };

    /// Writes an executable stand-in for rclone.
    ///
    /// `size` prints a fixed size. `copy`/`sync` print one stats line and copy the fixture
    /// named like the last path component of the source into the destination, a directory
    /// by its contents. A source containing `missing` fails like a missing remote directory.
    pub(crate) fn fake_rclone(dir: &Path, fixtures_dir: &Path) -> PathBuf {
        let script = format!(
            r#"#!/bin/sh
for arg in "$@"; do src="$dst"; dst="$arg"; done
case "$*" in
  *" size "*) echo '{{"count":1,"bytes":42}}' ;;
  *) case "$src" in
       *missing*) echo '{{"level":"error","msg":"directory not found"}}' >&2; exit 3 ;;
     esac
     echo '{{"stats":{{"bytes":21,"totalBytes":0,"eta":1,"speed":10.5}}}}' >&2
     name="${{src##*/}}"; name="${{name##*:}}"
     mkdir -p "$dst"
     fixture="{fixtures}/$name"
     if [ -d "$fixture" ]; then cp -R "$fixture/." "$dst/"
     elif [ -e "$fixture" ]; then cp "$fixture" "$dst/"
     else : > "$dst/uploaded-$name"; fi ;;
esac
"#,
            fixtures = fixtures_dir.display()
        );
        let path = dir.join("rclone");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, is_transient, kind_of};

    fn storage(root_dir: &str) -> RcloneStorage {
        RcloneStorage::new(
            PathBuf::from("rclone"),
            None,
            "mirror".into(),
            root_dir.into(),
            String::new(),
        )
    }

    #[test]
    fn remote_paths_join_root_dir() {
        assert_eq!(storage("Quest Games/").format_remote_path("List.txt"), "mirror:Quest Games/List.txt");
        assert_eq!(storage("").format_remote_path("/Uploads"), "mirror:Uploads");
    }

    #[test]
    fn stat_lines_parse_fractional_speed() {
        let line = r#"{"level":"info","stats":{"bytes":100,"totalBytes":0,"eta":3,"speed":12.7}}"#;
        let parsed: RcloneStatLine = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.stats.speed, 12);
        assert_eq!(parsed.stats.bytes, 100);
    }

    #[test]
    fn missing_remote_paths_are_not_transient() {
        let err = anyhow::Error::new(rclone_failure(Some(3), "ERROR : directory not found"));
        assert_eq!(kind_of(&err), Some(ErrorKind::Network));
        assert!(!is_transient(&err));
        let err = anyhow::Error::new(rclone_failure(Some(1), "connection reset by peer"));
        assert!(is_transient(&err));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn download_file_reports_stats_and_local_path() {
        let bin = tempfile::tempdir().unwrap();
        let fixtures = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("List.txt"), "x").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let storage = RcloneStorage::new(
            fake::fake_rclone(bin.path(), fixtures.path()),
            None,
            "mirror".into(),
            "Quest Games".into(),
            String::new(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let path = storage
            .download_file("List.txt", dest.path().to_path_buf(), Some(tx), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, dest.path().join("List.txt"));
        assert!(path.is_file());
        let stats = rx.recv().await.unwrap();
        assert_eq!((stats.bytes, stats.total_bytes), (21, 42));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn failed_transfer_is_tagged() {
        let bin = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let storage = RcloneStorage::new(
            fake::fake_rclone(bin.path(), dest.path()),
            None,
            "mirror".into(),
            String::new(),
            String::new(),
        );
        let err = storage
            .download_file("missing.txt", dest.path().to_path_buf(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Network));
        assert!(!is_transient(&err));
    }
}
