use std::{
    collections::HashMap,
    error::Error,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use derive_more::Debug;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::{
    sync::{Mutex, mpsc, oneshot, watch},
    time::{MissedTickBehavior, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, trace, warn};

use super::{
    AdbBridge, AdbCommand, AdbDevice, CommandFailure, CommandKind, DeviceBrief, PackageName,
};
use crate::{
    error::EngineError,
    events::{EngineEvent, EventBus},
    models::{ConnectionType, DeviceConnection, DeviceState, Settings},
    retry::{RetryPolicy, retry_transient},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    /// Bound on a single `adb devices` call.
    pub poll_timeout: Duration,
    /// Retries of transient command failures, on top of the first attempt.
    pub command_retry_attempts: u32,
    pub retry_backoff: Duration,
    /// Identity, battery, controllers and packages are re-read at most this often.
    pub details_max_age: Duration,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.device_poll_interval_ms.max(100)),
            poll_timeout: Duration::from_secs(5),
            command_retry_attempts: settings.command_retry_attempts,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            details_max_age: Duration::from_secs(30),
        }
    }
}

type CommandKey = (CommandKind, String);
type SharedCommand = Shared<BoxFuture<'static, Result<String, CommandFailure>>>;

/// Tracks the selected device and runs ad-hoc commands against it.
///
/// The poll loop owns the [`DeviceConnection`]; everyone else reads snapshots
/// from the watch channel and asks for refreshes by message.
#[derive(Debug)]
pub struct DeviceSession {
    #[debug(skip)]
    bridge: Arc<dyn AdbBridge>,
    config: SessionConfig,
    events: EventBus,
    snapshot: watch::Receiver<DeviceConnection>,
    refresh_tx: mpsc::Sender<oneshot::Sender<()>>,
    #[debug(skip)]
    in_flight: Mutex<HashMap<CommandKey, SharedCommand>>,
}

impl DeviceSession {
    /// Starts the poll loop. It stops when `token` is cancelled.
    pub fn start(
        bridge: Arc<dyn AdbBridge>,
        config: SessionConfig,
        events: EventBus,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, snapshot) = watch::channel(DeviceConnection::default());
        let (refresh_tx, refresh_rx) = mpsc::channel(8);
        let poll_loop = PollLoop {
            bridge: bridge.clone(),
            config: config.clone(),
            events: events.clone(),
            state: state_tx,
            refresh_rx,
            details_refreshed_at: None,
        };
        tokio::spawn(poll_loop.run(token).instrument(tracing::info_span!("device_poll")));

        Arc::new(Self {
            bridge,
            config,
            events,
            snapshot,
            refresh_tx,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Latest published snapshot.
    pub fn device(&self) -> DeviceConnection {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceConnection> {
        self.snapshot.clone()
    }

    /// Handle to the connected device, or a `State` error.
    pub fn current_device(&self) -> Result<AdbDevice> {
        let snapshot = self.snapshot.borrow();
        match (&snapshot.serial, snapshot.state) {
            (Some(serial), DeviceState::Connected) => {
                Ok(AdbDevice::new(self.bridge.clone(), serial))
            }
            (_, state) => {
                Err(EngineError::state(format!("No device connected (state: {state:?})")).into())
            }
        }
    }

    /// Asks the poll loop for an immediate poll including device details and waits for it.
    #[instrument(level = "debug", skip(self))]
    pub async fn refresh(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.refresh_tx.send(ack_tx).await.is_err() {
            debug!("Poll loop stopped, refresh ignored");
            return;
        }
        let _ = ack_rx.await;
    }

    /// Runs a device command. An identical command (same kind and key) already in flight is
    /// joined instead of being executed again.
    #[instrument(skip(self), err)]
    pub async fn execute(
        self: &Arc<Self>,
        key: &str,
        command: AdbCommand,
    ) -> Result<String, CommandFailure> {
        command.validate()?;
        let command_key: CommandKey = (command.kind(), key.to_string());

        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&command_key) {
                debug!(?command_key, "Joining in-flight command");
                existing.clone()
            } else {
                // Spawned so the command completes even if every caller goes away.
                // The map lock is held until insertion, so the task's own removal comes after it.
                // A panicking command still removes its entry.
                let handle = {
                    let session = self.clone();
                    let command_key = command_key.clone();
                    tokio::spawn(
                        async move {
                            let result = AssertUnwindSafe(session.run_command(&command))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| {
                                    error!(?command_key, "Device command panicked");
                                    Err(CommandFailure::Terminal("Device command panicked".into()))
                                });
                            session.in_flight.lock().await.remove(&command_key);
                            session.events.publish(EngineEvent::CommandCompleted {
                                command_type: command_key.0,
                                command_key: command_key.1,
                                success: result.is_ok(),
                            });
                            result
                        }
                        .in_current_span(),
                    )
                };
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        error!(error = &e as &dyn Error, "Device command task failed");
                        Err(CommandFailure::Terminal(format!("Command task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                in_flight.insert(command_key, shared.clone());
                shared
            }
        };
        shared.await
    }

    async fn run_command(&self, command: &AdbCommand) -> Result<String, CommandFailure> {
        let device = self.current_device()?;
        let policy = RetryPolicy {
            attempts: self.config.command_retry_attempts.saturating_add(1),
            base_backoff: self.config.retry_backoff,
        };
        // Commands are short; they are not cancelled halfway
        let token = CancellationToken::new();
        let op_name = format!("{:?}", command.kind());
        retry_transient(policy, &token, &op_name, |_| self.dispatch(&device, command))
            .await
            .map_err(CommandFailure::from)
    }

    async fn dispatch(&self, device: &AdbDevice, command: &AdbCommand) -> Result<String> {
        match command {
            AdbCommand::LaunchApp(package) => {
                device.launch(&PackageName::parse(package)?).await?;
                Ok(format!("Launched {package}"))
            }
            AdbCommand::ForceStopApp(package) => {
                device.force_stop(&PackageName::parse(package)?).await?;
                Ok(format!("Stopped {package}"))
            }
            AdbCommand::Reboot(mode) => {
                device.reboot(*mode).await?;
                Ok(String::new())
            }
            AdbCommand::SetProximitySensor(enabled) => {
                device.set_proximity_sensor(*enabled).await?;
                Ok(String::new())
            }
            AdbCommand::SetGuardianPaused(paused) => {
                device.set_guardian_paused(*paused).await?;
                Ok(String::new())
            }
            AdbCommand::GetBatteryDump => device.battery_dump().await,
            AdbCommand::RefreshDevice => {
                self.refresh().await;
                Ok(String::new())
            }
        }
    }
}

/// Owner of the published [`DeviceConnection`].
struct PollLoop {
    bridge: Arc<dyn AdbBridge>,
    config: SessionConfig,
    events: EventBus,
    state: watch::Sender<DeviceConnection>,
    refresh_rx: mpsc::Receiver<oneshot::Sender<()>>,
    details_refreshed_at: Option<Instant>,
}

impl PollLoop {
    async fn run(mut self, token: CancellationToken) {
        info!(interval = ?self.config.poll_interval, "Starting device poll loop");
        self.poll(true).await;
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.poll(false).await,
                request = self.refresh_rx.recv() => match request {
                    Some(ack) => {
                        self.poll(true).await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
            }
        }
        info!("Device poll loop stopped");
    }

    async fn poll(&mut self, force_details: bool) {
        let mut next = match timeout(self.config.poll_timeout, self.bridge.devices()).await {
            Ok(Ok(devices)) => self.select_device(&devices),
            Ok(Err(e)) => {
                debug!(error = e.as_ref() as &dyn Error, "Device poll failed");
                DeviceConnection::with_state(DeviceState::Unknown)
            }
            Err(_) => {
                warn!(timeout = ?self.config.poll_timeout, "Device poll timed out");
                DeviceConnection::with_state(DeviceState::Unknown)
            }
        };

        if next.is_connected() {
            self.fill_details(&mut next, force_details).await;
        } else {
            self.details_refreshed_at = None;
        }

        let changed = self.state.send_if_modified(|current| {
            if *current != next {
                *current = next.clone();
                true
            } else {
                false
            }
        });
        if changed {
            debug!(state = ?next.state, serial = ?next.serial, "Device snapshot changed");
            self.events.publish(EngineEvent::DeviceChanged(Box::new(next)));
        }
    }

    /// Keeps the current device if still listed, otherwise prefers a usable one.
    fn select_device(&self, devices: &[DeviceBrief]) -> DeviceConnection {
        let current_serial = self.state.borrow().serial.clone();
        let selected = devices
            .iter()
            .find(|d| current_serial.as_deref() == Some(d.serial.as_str()))
            .or_else(|| devices.iter().find(|d| d.state == "device"))
            .or_else(|| devices.first());
        let Some(brief) = selected else {
            return DeviceConnection::with_state(DeviceState::Offline);
        };
        trace!(serial = brief.serial, state = brief.state, "Selected device");
        DeviceConnection {
            state: DeviceState::from_adb(&brief.state),
            serial: Some(brief.serial.clone()),
            product_name: brief.info.get("product").cloned(),
            connection_type: Some(ConnectionType::from_serial(&brief.serial)),
            ..Default::default()
        }
    }

    async fn fill_details(&mut self, next: &mut DeviceConnection, force: bool) {
        let current = self.state.borrow().clone();
        let same_device = current.is_connected() && current.serial == next.serial;
        let stale = self
            .details_refreshed_at
            .is_none_or(|at| at.elapsed() >= self.config.details_max_age);
        if same_device && !force && !stale {
            next.name = current.name;
            next.battery_level = current.battery_level;
            next.controllers = current.controllers;
            next.installed_packages = current.installed_packages;
            return;
        }

        let Some(serial) = next.serial.clone() else { return };
        let device = AdbDevice::new(self.bridge.clone(), serial);
        next.name = device
            .query_identity()
            .await
            .inspect_err(|e| warn!(error = e.as_ref() as &dyn Error, "Failed to read device identity"))
            .ok();
        next.battery_level = device
            .battery_level()
            .await
            .inspect_err(|e| warn!(error = e.as_ref() as &dyn Error, "Failed to read battery level"))
            .ok();
        next.controllers = match device.controllers().await {
            Ok(controllers) => controllers,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Failed to read controllers");
                Vec::new()
            }
        };
        next.installed_packages = match device.installed_packages().await {
            Ok(packages) => packages,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Failed to list installed packages");
                if same_device { current.installed_packages } else { Vec::new() }
            }
        };
        self.details_refreshed_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::adb::{FakeBridge, RebootMode};

    fn config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(1),
            command_retry_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            details_max_age: Duration::from_secs(30),
        }
    }

    async fn session(bridge: &Arc<FakeBridge>) -> (Arc<DeviceSession>, CancellationToken) {
        let token = CancellationToken::new();
        let session = DeviceSession::start(bridge.clone(), config(), EventBus::new(), token.clone());
        session.refresh().await;
        (session, token)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn poll_maps_device_list_to_state() {
        let bridge = Arc::new(FakeBridge::default());
        let (session, _token) = session(&bridge).await;
        assert_eq!(session.device().state, DeviceState::Offline);

        bridge.set_devices(&[("192.168.1.5:5555", "unauthorized")]);
        session.refresh().await;
        let snapshot = session.device();
        assert_eq!(snapshot.state, DeviceState::Unauthorized);
        assert_eq!(snapshot.connection_type, Some(ConnectionType::Wireless));
        assert!(session.current_device().is_err());

        *bridge.devices_error.lock().unwrap() =
            Some(EngineError::Connectivity("cannot connect to daemon".into()));
        session.refresh().await;
        assert_eq!(session.device().state, DeviceState::Unknown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connected_device_details_are_read() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        bridge.respond("ro.product.manufacturer", "Oculus");
        bridge.respond("ro.product.model", "Quest 3");
        bridge.respond("dumpsys battery", "  level: 77");
        bridge.respond("--show-versioncode", "package:com.example.app versionCode:12\n");
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let token = CancellationToken::new();
        let session = DeviceSession::start(bridge.clone(), config(), events, token.clone());
        session.refresh().await;

        let snapshot = session.device();
        assert!(snapshot.is_connected());
        assert_eq!(snapshot.product_name.as_deref(), Some("eureka"));
        assert_eq!(snapshot.name.as_deref(), Some("Oculus Quest 3"));
        assert_eq!(snapshot.battery_level, Some(77));
        assert_eq!(snapshot.installed_package("com.example.app").map(|p| p.version_code), Some(12));
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::DeviceChanged(_))));
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_concurrent_commands_run_once() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        let (session, _token) = session(&bridge).await;
        bridge.set_delay(Duration::from_millis(200));

        let command = AdbCommand::LaunchApp("com.example.app".into());
        let (a, b) = tokio::join!(
            session.execute("launch-1", command.clone()),
            session.execute("launch-1", command.clone()),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(bridge.shell_count("monkey -p com.example.app"), 1);

        session.execute("launch-2", command).await.unwrap();
        assert_eq!(bridge.shell_count("monkey -p com.example.app"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_command_does_not_poison_its_key() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        let (session, _token) = session(&bridge).await;
        *bridge.panic_on_shell.lock().unwrap() = Some("am force-stop".into());

        let command = AdbCommand::ForceStopApp("com.example.app".into());
        let err = session.execute("stop", command.clone()).await.unwrap_err();
        assert!(matches!(err, CommandFailure::Terminal(_)));
        assert!(session.in_flight.lock().await.is_empty());

        *bridge.panic_on_shell.lock().unwrap() = None;
        session.execute("stop", command).await.unwrap();
        assert_eq!(bridge.shell_count("am force-stop com.example.app"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failures_are_retried() {
        let bridge = Arc::new(FakeBridge::connected("SERIAL"));
        bridge.respond("dumpsys battery", "  level: 50");
        let (session, _token) = session(&bridge).await;
        bridge.transient_shell_failures.store(2, Ordering::SeqCst);

        let dump = session.execute("battery", AdbCommand::GetBatteryDump).await.unwrap();
        assert!(dump.contains("level: 50"));

        bridge.transient_shell_failures.store(5, Ordering::SeqCst);
        let err = session.execute("battery", AdbCommand::GetBatteryDump).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commands_require_connected_device() {
        let bridge = Arc::new(FakeBridge::default());
        let (session, _token) = session(&bridge).await;
        let err = session
            .execute("reboot", AdbCommand::Reboot(RebootMode::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandFailure::Terminal(_)));
        assert!(bridge.shell_log.lock().unwrap().is_empty());

        let err = session
            .execute("launch", AdbCommand::LaunchApp("bad package".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandFailure::Terminal(_)));
    }
}
