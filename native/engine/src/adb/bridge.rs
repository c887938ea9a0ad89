use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    process::Output,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{
    process::Command,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::{debug, error, info, instrument, trace};

use crate::{
    error::{EngineError, ErrorKind},
    models::Settings,
    utils::resolve_binary_path,
};

/// One entry of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBrief {
    pub serial: String,
    /// Raw state column, e.g. `device`, `unauthorized`, `no permissions`.
    pub state: String,
    /// `key:value` pairs following the state (`product`, `model`, `transport_id`...).
    pub info: HashMap<String, String>,
}

/// Device command-execution capability.
///
/// Failures carry an [`EngineError`]: `Connectivity` for transport problems,
/// `Execution` when the device rejected the operation.
#[async_trait]
pub trait AdbBridge: Send + Sync + std::fmt::Debug {
    async fn devices(&self) -> Result<Vec<DeviceBrief>>;
    /// Runs a shell command and returns its output regardless of the remote exit status.
    async fn shell(&self, serial: &str, command: &str) -> Result<String>;
    async fn install(&self, serial: &str, apk: &Path) -> Result<()>;
    async fn uninstall(&self, serial: &str, package: &str) -> Result<()>;
    /// Same placement rules as `adb push`: pushing into an existing directory nests the source.
    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()>;
    /// Same placement rules as `adb pull`.
    async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<()>;
}

/// Parses the output of `adb devices -l`.
pub fn parse_devices_output(output: &str) -> Vec<DeviceBrief> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|line| {
            let (serial, rest) = line.split_once(char::is_whitespace)?;
            let rest = rest.trim_start();
            if let Some(stripped) = rest.strip_prefix("no permissions") {
                trace!(serial, details = stripped, "Device without permissions");
                return Some(DeviceBrief {
                    serial: serial.to_string(),
                    state: "no permissions".to_string(),
                    info: HashMap::new(),
                });
            }
            let mut tokens = rest.split_whitespace();
            let state = tokens.next()?.to_string();
            let info = tokens
                .filter_map(|t| t.split_once(':'))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Some(DeviceBrief { serial: serial.to_string(), state, info })
        })
        .collect()
}

const CONNECTIVITY_MARKERS: [&str; 8] = [
    "device offline",
    "no devices",
    "device unauthorized",
    "not found",
    "connection reset",
    "closed",
    "cannot connect",
    "failed to connect",
];

/// Maps a failed adb invocation to an engine error.
fn classify_failure(op: &str, output: &str) -> EngineError {
    let lower = output.to_lowercase();
    if lower.contains("failure [") || lower.contains("failed to install") {
        return EngineError::Execution(format!("adb {op} failed: {}", output.trim()));
    }
    if CONNECTIVITY_MARKERS.iter().any(|m| lower.contains(m)) {
        EngineError::Connectivity(format!("adb {op}: {}", output.trim()))
    } else {
        EngineError::Execution(format!("adb {op} failed: {}", output.trim()))
    }
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        stdout.into_owned()
    } else if stdout.trim().is_empty() {
        stderr.into_owned()
    } else {
        format!("{stderr}{stdout}")
    }
}

/// Drives the `adb` binary.
#[derive(Debug)]
pub struct AdbCli {
    settings: watch::Receiver<Settings>,
    server_mutex: Mutex<()>,
    server_started: AtomicBool,
    devices_timeout: Duration,
    shell_timeout: Duration,
    /// Installs and transfers can take very long on big apps.
    transfer_timeout: Duration,
}

impl AdbCli {
    pub fn new(settings: watch::Receiver<Settings>) -> Self {
        Self {
            settings,
            server_mutex: Mutex::new(()),
            server_started: AtomicBool::new(false),
            devices_timeout: Duration::from_secs(5),
            shell_timeout: Duration::from_secs(120),
            transfer_timeout: Duration::from_secs(60 * 60),
        }
    }

    fn adb_path(&self) -> Result<PathBuf> {
        let configured = self.settings.borrow().adb_path.clone();
        resolve_binary_path(Some(&configured), "adb")
            .map_err(|e| EngineError::state(format!("ADB binary not found: {e:#}")).into())
    }

    fn command(&self, adb: &Path, serial: Option<&str>, args: &[OsString]) -> Command {
        let mut command = Command::new(adb);
        command.kill_on_drop(true);

        #[cfg(target_os = "windows")]
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW

        if let Some(serial) = serial {
            command.arg("-s").arg(serial);
        }
        command.args(args);
        trace!(command = ?command, "Constructed adb command");
        command
    }

    #[instrument(level = "trace", skip(self, args))]
    async fn run(
        &self,
        op: &str,
        serial: Option<&str>,
        args: &[OsString],
        limit: Duration,
    ) -> Result<Output> {
        let adb = self.adb_path()?;
        let output = match timeout(limit, self.command(&adb, serial, args).output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(anyhow::Error::new(e)
                    .context(EngineError::Connectivity(format!("Failed to run adb {op}"))));
            }
            Err(_) => {
                return Err(EngineError::Connectivity(format!(
                    "adb {op} timed out after {}s",
                    limit.as_secs()
                ))
                .into());
            }
        };
        Ok(output)
    }

    /// Runs `op` and fails on non-zero exit or a `Failure [...]` report.
    async fn run_checked(
        &self,
        op: &str,
        serial: Option<&str>,
        args: &[OsString],
        limit: Duration,
    ) -> Result<String> {
        let output = self.run(op, serial, args, limit).await?;
        let text = combined_output(&output);
        if !output.status.success() || text.contains("Failure [") {
            error!(op, code = output.status.code().unwrap_or(-1), output = %text.trim(), "adb command failed");
            let err = classify_failure(op, &text);
            if err.kind() == ErrorKind::Connectivity {
                self.server_started.store(false, Ordering::Relaxed);
            }
            return Err(err.into());
        }
        Ok(text)
    }

    /// Starts the adb server once; restarted after connectivity failures.
    #[instrument(level = "debug", skip(self), err)]
    async fn ensure_server_running(&self) -> Result<()> {
        if self.server_started.load(Ordering::Relaxed) {
            return Ok(());
        }
        let _guard = self.server_mutex.lock().await;
        if self.server_started.load(Ordering::Relaxed) {
            return Ok(());
        }
        info!("Starting ADB server");
        self.run_checked("start-server", None, &["start-server".into()], Duration::from_secs(10))
            .await
            .context("Failed to start ADB server")?;
        self.server_started.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl AdbBridge for AdbCli {
    #[instrument(level = "trace", skip(self), err)]
    async fn devices(&self) -> Result<Vec<DeviceBrief>> {
        self.ensure_server_running().await?;
        let output = self
            .run_checked("devices", None, &["devices".into(), "-l".into()], self.devices_timeout)
            .await?;
        Ok(parse_devices_output(&output))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        let output =
            self.run("shell", Some(serial), &["shell".into(), command.into()], self.shell_timeout).await?;
        let text = combined_output(&output);
        // Remote exit codes come back through the shell protocol; only adb's own errors fail.
        if !output.status.success() && (text.starts_with("adb: ") || text.starts_with("error: ")) {
            return Err(classify_failure("shell", &text).into());
        }
        trace!(output = %text, "Shell command executed");
        Ok(text)
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn install(&self, serial: &str, apk: &Path) -> Result<()> {
        let output = self
            .run_checked(
                "install",
                Some(serial),
                &["install".into(), "-r".into(), "-g".into(), apk.as_os_str().to_owned()],
                self.transfer_timeout,
            )
            .await?;
        debug!(output = %output.trim(), "APK installed");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn uninstall(&self, serial: &str, package: &str) -> Result<()> {
        self.run_checked(
            "uninstall",
            Some(serial),
            &["uninstall".into(), package.into()],
            self.shell_timeout,
        )
        .await
        .map(|_| ())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        self.run_checked(
            "push",
            Some(serial),
            &["push".into(), local.as_os_str().to_owned(), remote.into()],
            self.transfer_timeout,
        )
        .await
        .map(|_| ())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<()> {
        self.run_checked(
            "pull",
            Some(serial),
            &["pull".into(), remote.into(), local.as_os_str().to_owned()],
            self.transfer_timeout,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) use fake::FakeBridge;

#[cfg(test)]
mod fake {
    use std::{
        collections::{BTreeMap, VecDeque},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    /// In-memory device used by tests.
    ///
    /// Remote files live in `files` keyed by absolute path. Shell responses are
    /// matched by substring; `test -d` and the exit-code suffix of checked commands
    /// are understood.
    #[derive(Debug, Default)]
    pub(crate) struct FakeBridge {
        pub devices: Mutex<Vec<DeviceBrief>>,
        pub devices_error: Mutex<Option<EngineError>>,
        pub shell_responses: Mutex<Vec<(String, String)>>,
        pub files: Mutex<BTreeMap<String, Vec<u8>>>,
        pub install_failures: Mutex<VecDeque<String>>,
        pub uninstall_failures: Mutex<VecDeque<String>>,
        /// Shell calls failing with a connectivity error before succeeding.
        pub transient_shell_failures: AtomicUsize,
        /// Shell calls containing this pattern panic.
        pub panic_on_shell: Mutex<Option<String>>,
        pub delay: Mutex<Duration>,
        pub shell_log: Mutex<Vec<String>>,
        pub installs: Mutex<Vec<PathBuf>>,
        pub uninstalls: Mutex<Vec<String>>,
        pub pushes: Mutex<Vec<(PathBuf, String)>>,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FakeBridge {
        pub fn connected(serial: &str) -> Self {
            let bridge = Self::default();
            bridge.set_devices(&[(serial, "device")]);
            bridge
        }

        pub fn set_devices(&self, devices: &[(&str, &str)]) {
            *self.devices.lock().unwrap() = devices
                .iter()
                .map(|(serial, state)| DeviceBrief {
                    serial: serial.to_string(),
                    state: state.to_string(),
                    info: HashMap::from([("product".to_string(), "eureka".to_string())]),
                })
                .collect();
        }

        pub fn respond(&self, pattern: &str, output: &str) {
            self.shell_responses.lock().unwrap().push((pattern.to_string(), output.to_string()));
        }

        pub fn add_file(&self, path: &str, content: &[u8]) {
            self.files.lock().unwrap().insert(path.to_string(), content.to_vec());
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }

        pub fn shell_count(&self, pattern: &str) -> usize {
            self.shell_log.lock().unwrap().iter().filter(|c| c.contains(pattern)).count()
        }

        async fn enter(&self) -> InFlight<'_> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            let guard = InFlight(&self.in_flight);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            guard
        }

        fn is_dir(&self, path: &str) -> bool {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            self.files.lock().unwrap().keys().any(|k| k.starts_with(&prefix))
        }
    }

    #[async_trait]
    impl AdbBridge for FakeBridge {
        async fn devices(&self) -> Result<Vec<DeviceBrief>> {
            if let Some(e) = self.devices_error.lock().unwrap().clone() {
                return Err(e.into());
            }
            Ok(self.devices.lock().unwrap().clone())
        }

        async fn shell(&self, _serial: &str, command: &str) -> Result<String> {
            let _guard = self.enter().await;
            let panic_pattern = self.panic_on_shell.lock().unwrap().clone();
            if let Some(pattern) = panic_pattern
                && command.contains(&pattern)
            {
                panic!("fake adb crashed on '{command}'");
            }
            self.shell_log.lock().unwrap().push(command.to_string());
            if self
                .transient_shell_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::Connectivity("connection reset".into()).into());
            }

            let (base, checked) = match command.strip_suffix(" ; printf '\\n%s' $?") {
                Some(base) => (base, true),
                None => (command, false),
            };
            let (output, exit_code) = if let Some(path) =
                base.strip_prefix("test -d '").and_then(|p| p.strip_suffix('\''))
            {
                (String::new(), if self.is_dir(path) { 0 } else { 1 })
            } else {
                let output = self
                    .shell_responses
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|(pattern, _)| base.contains(pattern.as_str()))
                    .map(|(_, output)| output.clone())
                    .unwrap_or_default();
                (output, 0)
            };
            Ok(if checked { format!("{output}\n{exit_code}") } else { output })
        }

        async fn install(&self, _serial: &str, apk: &Path) -> Result<()> {
            let _guard = self.enter().await;
            if let Some(failure) = self.install_failures.lock().unwrap().pop_front() {
                return Err(classify_failure("install", &failure).into());
            }
            self.installs.lock().unwrap().push(apk.to_path_buf());
            Ok(())
        }

        async fn uninstall(&self, _serial: &str, package: &str) -> Result<()> {
            let _guard = self.enter().await;
            if let Some(failure) = self.uninstall_failures.lock().unwrap().pop_front() {
                return Err(classify_failure("uninstall", &failure).into());
            }
            self.uninstalls.lock().unwrap().push(package.to_string());
            Ok(())
        }

        async fn push(&self, _serial: &str, local: &Path, remote: &str) -> Result<()> {
            let _guard = self.enter().await;
            anyhow::ensure!(local.exists(), "local path does not exist: {}", local.display());
            self.pushes.lock().unwrap().push((local.to_path_buf(), remote.to_string()));
            Ok(())
        }

        async fn pull(&self, _serial: &str, remote: &str, local: &Path) -> Result<()> {
            let _guard = self.enter().await;
            let remote = remote.trim_end_matches('/');
            let name = remote.rsplit('/').next().unwrap_or(remote);
            let target = if local.is_dir() { local.join(name) } else { local.to_path_buf() };
            let prefix = format!("{remote}/");
            let entries: Vec<(String, Vec<u8>)> = self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k.as_str() == remote || k.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if entries.is_empty() {
                return Err(EngineError::Execution(format!(
                    "adb pull failed: remote object '{remote}' does not exist"
                ))
                .into());
            }
            for (path, content) in entries {
                let dest = match path.strip_prefix(&prefix) {
                    Some(relative) => target.join(relative),
                    None => target.clone(),
                };
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, content)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_with_details() {
        let output = "List of devices attached\n\
            * daemon started successfully\n\
            1WMHH000M12345         device usb:1-1 product:hollywood model:Quest_2 device:hollywood transport_id:1\n\
            192.168.1.5:5555       unauthorized transport_id:2\n\
            ZZZ123 no permissions (user in plugdev group; are your udev rules wrong?); see [http://developer.android.com/tools/device.html]\n\n";
        let devices = parse_devices_output(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].serial, "1WMHH000M12345");
        assert_eq!(devices[0].state, "device");
        assert_eq!(devices[0].info.get("product").map(String::as_str), Some("hollywood"));
        assert_eq!(devices[1].state, "unauthorized");
        assert_eq!(devices[2].state, "no permissions");
        assert!(devices[2].info.is_empty());
    }

    #[test]
    fn failures_are_classified() {
        assert_eq!(classify_failure("shell", "error: device offline").kind(), ErrorKind::Connectivity);
        assert_eq!(
            classify_failure("install", "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: closed]").kind(),
            ErrorKind::Execution
        );
        assert_eq!(classify_failure("uninstall", "weird output").kind(), ErrorKind::Execution);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fake_bridge_understands_checked_commands() {
        let bridge = FakeBridge::connected("SERIAL");
        bridge.add_file("/sdcard/Android/obb/com.example/main.obb", b"x");
        bridge.respond("getprop ro.product.model", "Quest 3\n");

        let out = bridge.shell("SERIAL", "test -d '/sdcard/Android/obb/com.example' ; printf '\\n%s' $?").await.unwrap();
        assert!(out.ends_with("\n0"));
        let out = bridge.shell("SERIAL", "test -d '/sdcard/Android/obb/other' ; printf '\\n%s' $?").await.unwrap();
        assert!(out.ends_with("\n1"));
        assert_eq!(bridge.shell("SERIAL", "getprop ro.product.model").await.unwrap(), "Quest 3\n");
    }
}
