use std::{
    collections::{HashMap, HashSet},
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use derive_more::Debug;
use futures::StreamExt as _;
use tokio::{
    fs,
    io::AsyncRead,
    sync::{Mutex, RwLock, Semaphore, mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, instrument, warn};

use super::{
    access::test_access,
    config::{access_probe_url, load_installed, resolve_config, write_config},
    metadata::write_download_metadata,
    rclone::{RcloneStorage, RcloneTransferStats},
};
use crate::{
    error::EngineError,
    events::{EngineEvent, EventBus},
    models::{
        AccessTestResult, CatalogApp, ConfigSource, ConfigState, DownloaderConfig,
        DownloaderStatus, Settings,
    },
    retry::{RetryPolicy, retry_transient},
    utils::now_millis,
    version::newest_per_package,
};

/// Immutable view of the catalog. Replaced as a whole on refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub apps: Vec<CatalogApp>,
    /// Newest release per package.
    pub index: HashMap<String, CatalogApp>,
    pub donation_blacklist: HashSet<String>,
    pub refreshed_at: Option<u64>,
}

impl CatalogSnapshot {
    pub fn new(apps: Vec<CatalogApp>, donation_blacklist: HashSet<String>) -> Self {
        let index = newest_per_package(&apps);
        Self { apps, index, donation_blacklist, refreshed_at: Some(now_millis()) }
    }

    pub fn find_by_full_name(&self, full_name: &str) -> Option<&CatalogApp> {
        self.apps.iter().find(|a| a.full_name == full_name)
    }
}

/// Parses a `;`-separated app list. Malformed lines are skipped.
#[instrument(level = "debug", skip(reader), fields(count))]
pub async fn parse_catalog<R>(reader: R) -> Vec<CatalogApp>
where
    R: AsyncRead + Unpin + Send,
{
    let mut deserializer =
        csv_async::AsyncReaderBuilder::new().delimiter(b';').create_deserializer(reader);
    let apps: Vec<CatalogApp> = deserializer
        .deserialize::<CatalogApp>()
        .enumerate()
        .filter_map(|(idx, result)| async move {
            match result {
                Ok(app) => Some(app),
                Err(e) => {
                    warn!(
                        line = idx + 2,
                        error = &e as &dyn Error,
                        "Skipping malformed line in app list"
                    );
                    None
                }
            }
        })
        .collect()
        .await;
    Span::current().record("count", apps.len());
    apps
}

/// Release names map to a single directory under the downloads root.
pub fn is_valid_release_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

fn parse_blacklist(text: &str) -> HashSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

/// Keeps the remote catalog, the downloader configuration and transfers through it.
#[derive(Debug)]
pub struct CatalogSync {
    app_dir: PathBuf,
    #[debug(skip)]
    settings: watch::Receiver<Settings>,
    #[debug(skip)]
    events: EventBus,
    network_lane: Arc<Semaphore>,
    #[debug(skip)]
    http: reqwest::Client,
    config: RwLock<Option<Arc<DownloaderConfig>>>,
    status: watch::Sender<DownloaderStatus>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    refresh_lock: Mutex<()>,
    install_lock: Mutex<()>,
}

impl CatalogSync {
    pub fn new(
        app_dir: PathBuf,
        settings: watch::Receiver<Settings>,
        events: EventBus,
        network_lane: Arc<Semaphore>,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            app_dir,
            settings,
            events,
            network_lane,
            http,
            config: RwLock::new(None),
            status: watch::Sender::new(DownloaderStatus::default()),
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
            refresh_lock: Mutex::new(()),
            install_lock: Mutex::new(()),
        })
    }

    pub fn status(&self) -> DownloaderStatus {
        self.status.borrow().clone()
    }

    pub fn is_installed(&self) -> bool {
        self.status.borrow().state == ConfigState::Installed
    }

    fn update_status(&self, update: impl FnOnce(&mut DownloaderStatus)) {
        let changed = self.status.send_if_modified(|status| {
            let before = status.clone();
            update(status);
            *status != before
        });
        if changed {
            self.events.publish(EngineEvent::DownloaderStatusChanged(self.status()));
        }
    }

    fn init_progress(&self, message: &str, progress: Option<f32>) {
        self.events.publish(EngineEvent::DownloaderInitProgress {
            message: message.to_string(),
            progress,
        });
    }

    /// Loads `downloader.json` from the app directory.
    ///
    /// A missing file leaves the downloader `NotConfigured`. An unreadable one marks it
    /// `Failed` and returns a `State` error.
    #[instrument(skip(self), err)]
    pub async fn load_installed(&self) -> Result<()> {
        match load_installed(&self.app_dir) {
            Ok(Some(cfg)) => {
                info!(id = %cfg.id, "Loaded downloader config");
                self.activate(cfg).await;
                Ok(())
            }
            Ok(None) => {
                info!("No downloader.json found, catalog features disabled");
                self.update_status(|s| *s = DownloaderStatus::default());
                Ok(())
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.update_status(|s| s.state = ConfigState::Failed(message));
                Err(e.context(EngineError::state("Downloader configuration is unreadable")))
            }
        }
    }

    async fn activate(&self, cfg: DownloaderConfig) {
        let status = DownloaderStatus {
            config_id: Some(cfg.id.clone()),
            source_kind: Some(cfg.source_kind),
            state: ConfigState::Installed,
            last_test_result: self.status.borrow().last_test_result,
            donation_configured: cfg.is_donation_configured(),
        };
        *self.config.write().await = Some(Arc::new(cfg));
        self.update_status(|s| *s = status);
    }

    async fn require_config(&self) -> Result<Arc<DownloaderConfig>> {
        ensure!(
            self.is_installed(),
            EngineError::state("Downloader is not configured. Install a configuration first.")
        );
        self.config
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::state("Downloader is not configured").into())
    }

    /// Probes the source's restricted-network endpoint. Sources without one pass.
    #[instrument(skip(self), ret)]
    pub async fn test_access(&self, source: &ConfigSource) -> AccessTestResult {
        let result = match access_probe_url(source) {
            Some(url) => {
                let timeout =
                    Duration::from_millis(self.settings.borrow().access_test_timeout_ms);
                test_access(&url, timeout).await
            }
            None => AccessTestResult::Ok,
        };
        self.update_status(|s| s.last_test_result = Some(result));
        result
    }

    /// Installs a downloader configuration: `Installing`, then `Installed` or `Failed`.
    ///
    /// The previous catalog is dropped once the new config is active.
    #[instrument(skip(self), err)]
    pub async fn install_config(&self, source: ConfigSource) -> Result<()> {
        let _guard = self.install_lock.lock().await;
        self.update_status(|s| {
            s.source_kind = Some(source.kind());
            s.state = ConfigState::Installing;
        });

        let result: Result<DownloaderConfig> = async {
            if access_probe_url(&source).is_some() {
                self.init_progress("Testing access to source", None);
                let result = self.test_access(&source).await;
                ensure!(
                    result == AccessTestResult::Ok,
                    EngineError::network(format!("Access test failed: {result:?}"), false)
                );
            }
            self.init_progress("Fetching configuration", Some(0.33));
            let cfg = resolve_config(&source, &self.http).await?;
            self.init_progress("Saving configuration", Some(0.66));
            write_config(&self.app_dir, &cfg).await?;
            Ok(cfg)
        }
        .await;

        match result {
            Ok(cfg) => {
                info!(id = %cfg.id, "Downloader config installed");
                self.activate(cfg).await;
                *self.snapshot.write().await = Arc::new(CatalogSnapshot::default());
                self.events.publish(EngineEvent::CatalogChanged { app_count: 0 });
                self.init_progress("Downloader ready", Some(1.0));
                Ok(())
            }
            Err(e) => {
                error!(error = e.as_ref() as &dyn Error, "Failed to install downloader config");
                let message = format!("{e:#}");
                self.update_status(|s| s.state = ConfigState::Failed(message));
                Err(e)
            }
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.app_dir.join(super::config::CONFIG_FILE)
    }

    fn cache_dir(&self, cfg: &DownloaderConfig) -> PathBuf {
        self.app_dir.join("downloader_cache").join(sanitize_filename::sanitize(&cfg.id))
    }

    fn storage_for(&self, cfg: &DownloaderConfig, remote: &str, root_dir: &str) -> Result<RcloneStorage> {
        let settings = self.settings.borrow().clone();
        let rclone_path = match &cfg.rclone_path {
            Some(path) => path.resolve_for_current_platform()?,
            None => settings.rclone_path,
        };
        Ok(RcloneStorage::new(
            PathBuf::from(rclone_path),
            cfg.rclone_config_path.as_ref().map(PathBuf::from),
            remote.to_string(),
            root_dir.to_string(),
            settings.bandwidth_limit,
        ))
    }

    /// Forwards transfer stats of a catalog download as events until the sender is dropped.
    fn catalog_progress_sender(&self) -> mpsc::UnboundedSender<RcloneTransferStats> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RcloneTransferStats>();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(stats) = rx.recv().await {
                events.publish(EngineEvent::CatalogDownloadProgress {
                    bytes: stats.bytes,
                    total_bytes: stats.total_bytes,
                });
            }
        });
        tx
    }

    /// Downloads and parses the app list, then swaps the snapshot.
    ///
    /// Holds a network lane permit for the duration and retries transient failures.
    #[instrument(skip(self, token), err)]
    pub async fn refresh(&self, token: &CancellationToken) -> Result<usize> {
        let cfg = self.require_config().await?;
        let _guard = self.refresh_lock.lock().await;

        let _permit = tokio::select! {
            permit = self.network_lane.acquire() => permit.context("Network lane closed")?,
            _ = token.cancelled() => {
                return Err(EngineError::cancelled("Catalog refresh cancelled").into());
            }
        };

        let settings = self.settings.borrow().clone();
        let policy = RetryPolicy::for_network(&settings);
        let storage = self.storage_for(&cfg, &cfg.remote_name, &cfg.root_dir)?;
        let cache_dir = self.cache_dir(&cfg);
        fs::create_dir_all(&cache_dir)
            .await
            .with_context(|| format!("Failed to create {}", cache_dir.display()))?;

        let list_file = retry_transient(policy, token, "catalog refresh", |attempt| {
            debug!(attempt, "Downloading app list");
            let storage = &storage;
            let list_path = cfg.list_path.as_str();
            let cache_dir = cache_dir.clone();
            let progress = self.catalog_progress_sender();
            async move {
                storage
                    .download_file(list_path, cache_dir, Some(progress), token)
                    .await
                    .context("Failed to download app list")
            }
        })
        .await?;

        let file = fs::File::open(&list_file).await.context("Could not open app list file")?;
        let apps = parse_catalog(file).await;

        let mut blacklist: HashSet<String> = cfg.donation_blacklist.iter().cloned().collect();
        if let Some(path) = cfg.donation_blacklist_path.as_deref().filter(|p| !p.is_empty()) {
            blacklist.extend(load_remote_blacklist(&storage, path, &cache_dir, token).await);
        }

        let count = apps.len();
        *self.snapshot.write().await = Arc::new(CatalogSnapshot::new(apps, blacklist));
        info!(count, "Catalog refreshed");
        self.events.publish(EngineEvent::CatalogChanged { app_count: count });
        Ok(count)
    }

    /// Current catalog. Never a partially refreshed one.
    pub async fn catalog(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Refreshes the catalog every `catalog_refresh_interval_secs` while a config is installed.
    pub fn start_periodic_refresh(self: &Arc<Self>, token: CancellationToken) {
        let sync = self.clone();
        tokio::spawn(
            async move {
                loop {
                    let interval = Duration::from_secs(
                        sync.settings.borrow().catalog_refresh_interval_secs.max(60),
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = token.cancelled() => break,
                    }
                    if !sync.is_installed() {
                        continue;
                    }
                    if let Err(e) = sync.refresh(&token).await {
                        warn!(error = e.as_ref() as &dyn Error, "Periodic catalog refresh failed");
                    }
                }
                debug!("Periodic catalog refresh stopped");
            }
            .instrument(info_span!("task_catalog_refresh")),
        );
    }

    /// Downloads a release into the downloads directory and writes its metadata.
    ///
    /// A cancelled download removes the partial directory.
    #[instrument(skip(self, stats_tx, token), err)]
    pub async fn download_app(
        &self,
        full_name: &str,
        stats_tx: mpsc::UnboundedSender<RcloneTransferStats>,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        ensure!(
            is_valid_release_name(full_name),
            EngineError::validation(format!("Invalid release name: {full_name}"))
        );
        let cfg = self.require_config().await?;
        let storage = self.storage_for(&cfg, &cfg.remote_name, &cfg.root_dir)?;
        let settings = self.settings.borrow().clone();
        let dst_dir = settings.downloads_location().join(full_name);
        info!(dest = %dst_dir.display(), "Starting app download");

        let result = storage.download_dir_with_stats(full_name, dst_dir.clone(), stats_tx, token).await;
        if let Err(e) = result {
            if token.is_cancelled() && dst_dir.exists() {
                if let Err(remove_err) = fs::remove_dir_all(&dst_dir).await {
                    warn!(
                        error = &remove_err as &dyn Error,
                        path = %dst_dir.display(),
                        "Failed to remove partial download"
                    );
                }
            }
            return Err(e);
        }

        let snapshot = self.catalog().await;
        write_download_metadata(
            snapshot.find_by_full_name(full_name),
            full_name,
            &dst_dir,
            settings.write_legacy_release_json,
        )
        .await?;
        self.events.publish(EngineEvent::DownloadsChanged);
        Ok(dst_dir)
    }

    /// Uploads a donation archive to the configured donation remote.
    #[instrument(skip(self, stats_tx, token), fields(archive = %archive.display()), err)]
    pub async fn upload_donation_archive(
        &self,
        archive: &Path,
        stats_tx: Option<mpsc::UnboundedSender<RcloneTransferStats>>,
        token: &CancellationToken,
    ) -> Result<()> {
        let cfg = self.require_config().await?;
        let (Some(remote), Some(remote_path)) =
            (cfg.donation_remote_name.as_deref(), cfg.donation_remote_path.as_deref())
        else {
            return Err(EngineError::state("Donation remote is not configured").into());
        };
        let storage = self.storage_for(&cfg, remote, "")?;
        storage.upload_file(archive, remote_path, stats_tx, token).await
    }
}

#[instrument(level = "debug", skip(storage, token), fields(path = %remote_path))]
async fn load_remote_blacklist(
    storage: &RcloneStorage,
    remote_path: &str,
    cache_dir: &Path,
    token: &CancellationToken,
) -> HashSet<String> {
    let path = match storage.download_file(remote_path, cache_dir.to_path_buf(), None, token).await {
        Ok(path) => path,
        Err(e) => {
            warn!(
                error = e.as_ref() as &dyn Error,
                "Failed to download donation blacklist, continuing without it"
            );
            return HashSet::new();
        }
    };
    match fs::read_to_string(&path).await {
        Ok(text) => parse_blacklist(&text),
        Err(e) => {
            warn!(error = &e as &dyn Error, path = %path.display(), "Failed to read donation blacklist");
            HashSet::new()
        }
    }
}
