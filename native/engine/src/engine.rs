//! The request surface consumed by the presentation layer.

use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use anyhow::Result;
use derive_more::Debug;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::{
    adb::{AdbBridge, AdbCli, AdbCommand, CommandFailure, DeviceSession, SessionConfig},
    backups::BackupManager,
    downloader::{CatalogSnapshot, CatalogSync},
    downloads_catalog::DownloadsCatalog,
    events::{EngineEvent, EngineHealth, EventBus},
    models::{
        AccessTestResult, BackupEntry, ConfigSource, ConfigState, DeleteSummary, DeviceConnection,
        DeviceState, DownloadEntry, DownloaderStatus, Task, TaskRequest,
    },
    settings::SettingsHandler,
    task::{Lanes, TaskManager},
    utils::check_storage_root,
};

/// Where the engine keeps its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directories {
    pub backups: PathBuf,
    pub downloads: PathBuf,
    pub logs: PathBuf,
}

#[derive(Debug)]
pub struct Engine {
    app_dir: PathBuf,
    settings: Arc<SettingsHandler>,
    #[debug(skip)]
    events: EventBus,
    session: Arc<DeviceSession>,
    catalog: Arc<CatalogSync>,
    backups: BackupManager,
    downloads: DownloadsCatalog,
    tasks: Arc<TaskManager>,
    health: watch::Sender<EngineHealth>,
    token: CancellationToken,
}

impl Engine {
    /// Starts the engine against the `adb` binary from settings.
    pub async fn start(app_dir: PathBuf, settings: Arc<SettingsHandler>, events: EventBus) -> Arc<Self> {
        let bridge = Arc::new(AdbCli::new(settings.subscribe()));
        Self::start_with_bridge(app_dir, settings, events, bridge).await
    }

    #[instrument(skip_all, fields(app_dir = %app_dir.display()))]
    pub async fn start_with_bridge(
        app_dir: PathBuf,
        settings: Arc<SettingsHandler>,
        events: EventBus,
        bridge: Arc<dyn AdbBridge>,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        let current = settings.current();
        let rx = settings.subscribe();

        // Lane sizes are read once
        let lanes = Lanes::from_settings(&current);
        let session = DeviceSession::start(
            bridge,
            SessionConfig::from_settings(&current),
            events.clone(),
            token.child_token(),
        );
        let catalog =
            CatalogSync::new(app_dir.clone(), rx.clone(), events.clone(), lanes.network.clone());
        let backups = BackupManager::new(rx.clone(), events.clone());
        let downloads = DownloadsCatalog::new(rx.clone(), events.clone());
        let tasks = TaskManager::new(
            lanes,
            session.clone(),
            catalog.clone(),
            downloads.clone(),
            backups.clone(),
            rx,
            events.clone(),
        );

        let engine = Arc::new(Self {
            app_dir,
            settings,
            events,
            session,
            catalog,
            backups,
            downloads,
            tasks,
            health: watch::Sender::new(EngineHealth::Healthy),
            token,
        });
        engine.start_health_monitor();

        if let Err(e) = engine.catalog.load_installed().await {
            warn!(error = e.as_ref() as &dyn Error, "Downloader configuration could not be loaded");
        }
        if engine.catalog.is_installed() {
            engine.spawn_catalog_refresh();
        }
        engine.catalog.start_periodic_refresh(engine.token.child_token());

        info!("Engine started");
        engine
    }

    /// Cancels every task and stops background loops.
    pub fn shutdown(&self) {
        info!("Shutting down engine");
        self.tasks.cancel_all();
        self.token.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SettingsHandler {
        &self.settings
    }

    pub async fn submit_task(self: &Arc<Self>, request: TaskRequest) -> Result<u64> {
        self.tasks.submit(request).await
    }

    pub fn cancel_task(&self, task_id: u64) -> bool {
        self.tasks.cancel(task_id)
    }

    pub fn list_active_tasks(&self) -> Vec<Task> {
        self.tasks.list_active()
    }

    pub fn list_recent_tasks(&self) -> Vec<Task> {
        self.tasks.list_recent()
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        self.backups.list_backups().await
    }

    pub async fn delete_backup(&self, path: &Path) -> Result<()> {
        self.backups.delete(path).await
    }

    pub async fn delete_all_backups(&self) -> Result<DeleteSummary> {
        self.backups.delete_all().await
    }

    pub async fn list_downloads(&self) -> Result<Vec<DownloadEntry>> {
        self.downloads.list_downloads().await
    }

    pub async fn delete_download(&self, path: &Path) -> Result<()> {
        self.downloads.delete_download(path).await
    }

    pub async fn delete_all_downloads(&self) -> Result<DeleteSummary> {
        self.downloads.delete_all_downloads().await
    }

    pub fn directories(&self) -> Directories {
        Directories {
            backups: self.backups.backups_location(),
            downloads: self.downloads.downloads_location(),
            logs: self.app_dir.join("logs"),
        }
    }

    /// Installs a downloader configuration and refreshes the catalog in the background.
    pub async fn install_downloader_config(self: &Arc<Self>, source: ConfigSource) -> Result<()> {
        self.catalog.install_config(source).await?;
        self.spawn_catalog_refresh();
        Ok(())
    }

    pub async fn test_downloader_access(&self, source: &ConfigSource) -> AccessTestResult {
        self.catalog.test_access(source).await
    }

    pub fn downloader_status(&self) -> DownloaderStatus {
        self.catalog.status()
    }

    pub fn device(&self) -> DeviceConnection {
        self.session.device()
    }

    pub async fn execute_device_command(
        &self,
        key: &str,
        command: AdbCommand,
    ) -> Result<String, CommandFailure> {
        self.session.execute(key, command).await
    }

    pub async fn refresh_catalog(&self) -> Result<usize> {
        self.catalog.refresh(&self.token).await
    }

    pub async fn catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.catalog().await
    }

    pub fn health(&self) -> EngineHealth {
        self.health.borrow().clone()
    }

    fn spawn_catalog_refresh(&self) {
        let catalog = self.catalog.clone();
        let token = self.token.child_token();
        tokio::spawn(
            async move {
                match catalog.refresh(&token).await {
                    Ok(count) => debug!(count, "Catalog refreshed"),
                    Err(e) => warn!(error = e.as_ref() as &dyn Error, "Catalog refresh failed"),
                }
            }
            .instrument(info_span!("task_catalog_refresh_once")),
        );
    }

    /// Re-evaluates health whenever the device, the downloader, storage or settings change.
    fn start_health_monitor(self: &Arc<Self>) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.events.subscribe();
        let mut settings_rx = self.settings.subscribe();
        let token = self.token.clone();
        tokio::spawn(
            async move {
                loop {
                    let Some(this) = engine.upgrade() else { break };
                    this.update_health();
                    drop(this);

                    // Wait for something that can change the outcome
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            changed = settings_rx.changed() => match changed {
                                Ok(()) => break,
                                Err(_) => return,
                            },
                            event = rx.recv() => match event {
                                Ok(
                                    EngineEvent::DeviceChanged(_)
                                    | EngineEvent::DownloaderStatusChanged(_)
                                    | EngineEvent::BackupsChanged
                                    | EngineEvent::DownloadsChanged,
                                )
                                | Err(broadcast::error::RecvError::Lagged(_)) => break,
                                Ok(_) => {}
                                Err(broadcast::error::RecvError::Closed) => return,
                            },
                        }
                    }
                }
                debug!("Health monitor stopped");
            }
            .instrument(info_span!("task_health_monitor")),
        );
    }

    fn update_health(&self) {
        let storage: Vec<String> = [
            (self.backups.backups_location(), "Backups"),
            (self.downloads.downloads_location(), "Downloads"),
        ]
        .iter()
        .filter_map(|(root, what)| check_storage_root(root, what).err())
        .map(|e| format!("{e:#}"))
        .collect();
        let health = assess_health(&self.session.device(), &self.catalog.status(), &storage);
        let changed = self.health.send_if_modified(|current| {
            if *current == health {
                return false;
            }
            *current = health.clone();
            true
        });
        if changed {
            info!(?health, "Engine health changed");
            self.events.publish(EngineEvent::HealthChanged(health));
        }
    }
}

/// Resource problems that need the user to act. Anything listed here makes requests needing
/// that resource fail admission. `storage` holds the failed storage root checks.
pub fn assess_health(
    device: &DeviceConnection,
    downloader: &DownloaderStatus,
    storage: &[String],
) -> EngineHealth {
    let mut reasons = Vec::new();
    match device.state {
        DeviceState::Unauthorized => reasons
            .push("Device is unauthorized; allow USB debugging on the headset".to_string()),
        DeviceState::NoPermissions => {
            reasons.push("No permission to access the device over USB".to_string())
        }
        _ => {}
    }
    if let ConfigState::Failed(message) = &downloader.state {
        reasons.push(format!("Downloader configuration failed: {message}"));
    }
    reasons.extend(storage.iter().cloned());

    if reasons.is_empty() { EngineHealth::Healthy } else { EngineHealth::Degraded { reasons } }
}
