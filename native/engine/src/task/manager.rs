use std::{
    collections::{BTreeMap, VecDeque},
    error::Error,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Result, anyhow, ensure};
use derive_more::Debug;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use super::{
    BackupStepConfig, ProgressUpdate,
    lanes::{LaneSlot, Lanes},
};
use crate::{
    adb::{DeviceSession, PackageName},
    backups::BackupManager,
    downloader::{CatalogSync, is_valid_release_name},
    downloads_catalog::DownloadsCatalog,
    error::{EngineError, engine_error, is_cancelled},
    events::{EngineEvent, EventBus},
    models::{Settings, Task, TaskProgress, TaskRequest, TaskStatus},
    utils::{check_storage_root, now_millis},
    version::donation_eligibility,
};

struct ActiveTask {
    task: Task,
    token: CancellationToken,
}

#[derive(Default)]
struct TaskTable {
    active: BTreeMap<u64, ActiveTask>,
    /// Finished tasks, newest first.
    recent: VecDeque<Task>,
}

/// Admits task requests and runs them through the device and network lanes.
#[derive(Debug)]
pub struct TaskManager {
    pub(super) lanes: Lanes,
    id_counter: AtomicU64,
    #[debug(skip)]
    tasks: Mutex<TaskTable>,
    pub(super) session: Arc<DeviceSession>,
    pub(super) catalog: Arc<CatalogSync>,
    pub(super) downloads: DownloadsCatalog,
    pub(super) backups: BackupManager,
    #[debug(skip)]
    pub(super) settings: watch::Receiver<Settings>,
    #[debug(skip)]
    events: EventBus,
}

impl TaskManager {
    pub fn new(
        lanes: Lanes,
        session: Arc<DeviceSession>,
        catalog: Arc<CatalogSync>,
        downloads: DownloadsCatalog,
        backups: BackupManager,
        settings: watch::Receiver<Settings>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            lanes,
            id_counter: AtomicU64::new(0),
            tasks: Mutex::new(TaskTable::default()),
            session,
            catalog,
            downloads,
            backups,
            settings,
            events,
        })
    }

    fn lock_tasks(&self) -> MutexGuard<'_, TaskTable> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates `request` and queues it. Nothing is created when admission fails.
    #[instrument(skip(self), fields(kind = ?request.kind()), err)]
    pub async fn submit(self: &Arc<Self>, request: TaskRequest) -> Result<u64> {
        self.admit(&request).await?;

        let id = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let kind = request.kind();
        let task = Task {
            id,
            kind,
            name: request.task_name(),
            status: TaskStatus::Waiting,
            progress: None,
            message: "Queued".into(),
            current_step: 1,
            total_steps: request.total_steps(),
            created_at: now_millis(),
            finished_at: None,
            error: None,
            cancel_requested: false,
        };
        debug!(task_id = id, task = %task, "Creating new task");

        {
            let mut table = self.lock_tasks();
            self.events.publish(EngineEvent::TaskProgress(progress_of(&task, None)));
            table.active.insert(id, ActiveTask { task, token: token.clone() });
            debug!(task_id = id, active_tasks = table.active.len(), "Task added to queue");
        }

        tokio::spawn({
            let handle = self.clone();
            async move {
                Box::pin(handle.process_task(id, request, token)).await;
            }
            .instrument(info_span!("task", id, ?kind))
        });

        Ok(id)
    }

    /// Requests cancellation. Returns `false` for unknown or finished tasks, which are left
    /// untouched.
    #[instrument(level = "debug", skip(self))]
    pub fn cancel(&self, task_id: u64) -> bool {
        let mut table = self.lock_tasks();
        let active_tasks = table.active.len();
        match table.active.get_mut(&task_id) {
            Some(entry) if !entry.task.status.is_terminal() => {
                info!(task_id, task = %entry.task, active_tasks, "Received cancellation request for task");
                entry.task.cancel_requested = true;
                entry.token.cancel();
                true
            }
            _ => {
                warn!(
                    task_id,
                    active_tasks, "Task not found for cancellation - may have already completed"
                );
                false
            }
        }
    }

    /// Cancels every queued or running task.
    pub fn cancel_all(&self) {
        let mut table = self.lock_tasks();
        for entry in table.active.values_mut() {
            entry.task.cancel_requested = true;
            entry.token.cancel();
        }
    }

    pub fn list_active(&self) -> Vec<Task> {
        self.lock_tasks().active.values().map(|e| e.task.clone()).collect()
    }

    /// Finished tasks, newest first, capped at `recent_tasks_limit`.
    pub fn list_recent(&self) -> Vec<Task> {
        self.lock_tasks().recent.iter().cloned().collect()
    }

    async fn admit(&self, request: &TaskRequest) -> Result<()> {
        let kind = request.kind();
        if kind.needs_downloads_storage() {
            check_storage_root(&self.downloads.downloads_location(), "Downloads")?;
        }
        if kind.needs_backups_storage() {
            check_storage_root(&self.backups.backups_location(), "Backups")?;
        }

        match request {
            TaskRequest::Download { full_name, package_name }
            | TaskRequest::DownloadInstall { full_name, package_name } => {
                ensure!(
                    is_valid_release_name(full_name),
                    EngineError::validation(format!("Invalid release name: '{full_name}'"))
                );
                PackageName::parse(package_name)?;
            }
            TaskRequest::InstallApk { apk_path } => {
                let is_apk = apk_path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("apk"));
                ensure!(
                    is_apk && apk_path.is_file(),
                    EngineError::validation(format!("Not an APK file: {}", apk_path.display()))
                );
            }
            TaskRequest::InstallLocalApp { app_path } => {
                ensure!(
                    app_path.is_dir(),
                    EngineError::validation(format!("Not a directory: {}", app_path.display()))
                );
            }
            TaskRequest::Uninstall { package_name, .. }
            | TaskRequest::DonateApp { package_name, .. } => {
                PackageName::parse(package_name)?;
            }
            TaskRequest::BackupApp { package_name, parts, .. } => {
                PackageName::parse(package_name)?;
                ensure!(
                    !parts.is_empty(),
                    EngineError::validation("At least one backup part must be selected")
                );
            }
            TaskRequest::RestoreBackup { path } => {
                self.backups.inspect_backup(path).await?;
            }
        }

        if kind.needs_downloader() {
            let status = self.catalog.status();
            ensure!(
                self.catalog.is_installed(),
                EngineError::state(format!(
                    "{} needs an installed downloader configuration (state: {:?})",
                    kind.label(),
                    status.state
                ))
            );
        }
        let device = self.session.device();
        if kind.needs_device() {
            ensure!(
                device.is_connected(),
                EngineError::state(format!(
                    "{} needs a connected device (state: {:?})",
                    kind.label(),
                    device.state
                ))
            );
        }

        if let TaskRequest::DonateApp { package_name, .. } = request {
            ensure!(
                self.catalog.status().donation_configured,
                EngineError::state("Donation remote is not configured")
            );
            let installed = device.installed_package(package_name).ok_or_else(|| {
                EngineError::validation(format!("{package_name} is not installed on the device"))
            })?;
            let catalog = self.catalog.catalog().await;
            donation_eligibility(installed, &catalog.index, &catalog.donation_blacklist).map_err(
                |reasons| {
                    EngineError::validation(format!(
                        "{package_name} is not eligible for donation: {reasons:?}"
                    ))
                },
            )?;
        }
        Ok(())
    }

    async fn process_task(self: Arc<Self>, id: u64, request: TaskRequest, token: CancellationToken) {
        let start_time = std::time::Instant::now();
        let task_name = request.task_name();
        let lane = LaneSlot::default();
        let update_progress = |u: ProgressUpdate| self.apply_update(id, u);

        debug!(task_id = id, task_name = %task_name, "Starting task processing");

        let result = AssertUnwindSafe(self.run_task(request, &lane, &update_progress, &token))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("Task panicked")));

        let duration = start_time.elapsed();
        match result {
            Ok(()) => {
                info!(
                    task_id = id,
                    task_name = %task_name,
                    duration_secs = duration.as_secs_f64(),
                    "Task completed successfully"
                );
                self.finish(id, TaskStatus::Completed, "Done".into(), None);
            }
            Err(e) if token.is_cancelled() || is_cancelled(&e) => {
                warn!(
                    task_id = id,
                    task_name = %task_name,
                    duration_ms = duration.as_millis(),
                    "Task was cancelled by user"
                );
                let message = match engine_error(&e) {
                    Some(EngineError::Cancelled(message)) => message.clone(),
                    _ => "Task cancelled by user".into(),
                };
                self.finish(id, TaskStatus::Cancelled, message, None);
            }
            Err(e) => {
                error!(
                    task_id = id,
                    task_name = %task_name,
                    duration_ms = duration.as_millis(),
                    error = e.as_ref() as &dyn Error,
                    error_chain = ?e.chain().collect::<Vec<_>>(),
                    "Task failed with error"
                );
                let chain = format!("{e:#}");
                self.finish(id, TaskStatus::Failed, format!("Task failed: {chain}"), Some(chain));
            }
        }
        lane.release();
    }

    async fn run_task(
        &self,
        request: TaskRequest,
        lane: &LaneSlot,
        update_progress: &impl Fn(ProgressUpdate),
        token: &CancellationToken,
    ) -> Result<()> {
        match request {
            TaskRequest::Download { full_name, .. } => {
                info!("Executing download task");
                self.handle_download(&full_name, lane, update_progress, token).await.map(|_| ())
            }
            TaskRequest::DownloadInstall { full_name, package_name } => {
                info!("Executing download and install task");
                let package = PackageName::parse(&package_name)?;
                self.handle_download_install(&full_name, package, lane, update_progress, token)
                    .await
            }
            TaskRequest::InstallApk { apk_path } => {
                info!("Executing APK install task");
                self.handle_install_apk(&apk_path, lane, update_progress, token).await
            }
            TaskRequest::InstallLocalApp { app_path } => {
                info!("Executing local app install task");
                self.handle_install_local_app(&app_path, lane, update_progress, token).await
            }
            TaskRequest::Uninstall { package_name, .. } => {
                info!("Executing uninstall task");
                let package = PackageName::parse(&package_name)?;
                self.handle_uninstall(package, lane, update_progress, token).await
            }
            TaskRequest::BackupApp { package_name, display_name, parts, name_suffix } => {
                info!("Executing backup task");
                self.handle_backup(
                    BackupStepConfig { package_name, display_name, parts, name_suffix },
                    lane,
                    update_progress,
                    token,
                )
                .await
            }
            TaskRequest::RestoreBackup { path } => {
                info!("Executing restore backup task");
                self.handle_restore(&path, lane, update_progress, token).await
            }
            TaskRequest::DonateApp { package_name, display_name } => {
                info!("Executing app donation task");
                let package = PackageName::parse(&package_name)?;
                self.handle_donate_app(package, display_name, lane, update_progress, token).await
            }
        }
    }

    /// Applies a non-terminal update. Updates never move a task backwards: a lane wait
    /// inside a running task only changes the message.
    fn apply_update(&self, id: u64, u: ProgressUpdate) {
        let mut table = self.lock_tasks();
        let Some(entry) = table.active.get_mut(&id) else {
            warn!(task_id = id, "Progress update for unknown task");
            return;
        };
        let task = &mut entry.task;
        if task.status.is_terminal() {
            warn!(task_id = id, status = ?task.status, "Ignoring update of a finished task");
            return;
        }
        if task.status.can_advance_to(u.status) {
            task.status = u.status;
        } else {
            trace!(task_id = id, status = ?task.status, requested = ?u.status, "Keeping status");
        }
        task.current_step = u.step_number.clamp(1, task.total_steps.max(1));
        task.message = u.message;
        let total = task.total_steps.max(1) as f32;
        let completed = task.current_step.saturating_sub(1) as f32;
        task.progress = u.step_progress.map(|sp| (completed + sp.clamp(0.0, 1.0)) / total);
        send_progress(&self.events, progress_of(task, u.step_progress));
    }

    /// Moves a task to its terminal status and into the recent history.
    fn finish(&self, id: u64, status: TaskStatus, message: String, error: Option<String>) {
        let limit = self.settings.borrow().recent_tasks_limit;
        let mut table = self.lock_tasks();
        let Some(ActiveTask { mut task, .. }) = table.active.remove(&id) else {
            warn!(task_id = id, "Finished task is not active");
            return;
        };
        if task.status.can_advance_to(status) {
            task.status = status;
            task.message = message;
            task.error = error;
            task.finished_at = Some(now_millis());
            if status == TaskStatus::Completed {
                task.current_step = task.total_steps;
                task.progress = Some(1.0);
            }
            send_progress(&self.events, progress_of(&task, None));
        } else {
            warn!(task_id = id, status = ?task.status, requested = ?status, "Ignoring repeated terminal transition");
        }
        table.recent.push_front(task);
        table.recent.truncate(limit);
        debug!(task_id = id, remaining_tasks = table.active.len(), "Task removed from queue");
    }
}

fn progress_of(task: &Task, step_progress: Option<f32>) -> TaskProgress {
    TaskProgress {
        task_id: task.id,
        task_kind: task.kind,
        task_name: task.name.clone(),
        status: task.status,
        total_progress: task.progress,
        message: task.message.clone(),
        current_step: task.current_step,
        total_steps: task.total_steps,
        step_progress,
        error: task.error.clone(),
    }
}

fn send_progress(events: &EventBus, progress: TaskProgress) {
    // Status changes only, running updates are too frequent
    if progress.status != TaskStatus::Running || progress.total_progress.is_none() {
        debug!(
            task_id = progress.task_id,
            task_kind = ?progress.task_kind,
            task_name = %progress.task_name,
            status = ?progress.status,
            progress = ?progress.total_progress,
            progress_message = %progress.message,
            "Publishing task progress"
        );
    }
    events.publish(EngineEvent::TaskProgress(progress));
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf, time::Duration};

    use tokio::sync::broadcast;

    use super::*;
    use crate::{
        adb::{FakeBridge, SessionConfig},
        error::{ErrorKind, kind_of},
        models::{BackupParts, ConfigSource},
    };

    struct Harness {
        root: tempfile::TempDir,
        bridge: Arc<FakeBridge>,
        manager: Arc<TaskManager>,
        settings: watch::Sender<Settings>,
        events: EventBus,
    }

    async fn harness(bridge: FakeBridge) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let initial = Settings { retry_backoff_ms: 1, ..Settings::rooted_at(root.path()) };
        let (settings_tx, settings) = watch::channel(initial);
        let events = EventBus::new();
        let bridge = Arc::new(bridge);
        let session = DeviceSession::start(
            bridge.clone(),
            SessionConfig {
                poll_interval: Duration::from_secs(60),
                poll_timeout: Duration::from_secs(1),
                command_retry_attempts: 0,
                retry_backoff: Duration::from_millis(1),
                details_max_age: Duration::from_secs(30),
            },
            events.clone(),
            CancellationToken::new(),
        );
        session.refresh().await;
        let lanes = Lanes::new(2);
        let catalog = CatalogSync::new(
            root.path().join("app"),
            settings.clone(),
            events.clone(),
            lanes.network.clone(),
        );
        let manager = TaskManager::new(
            lanes,
            session,
            catalog,
            DownloadsCatalog::new(settings.clone(), events.clone()),
            BackupManager::new(settings.clone(), events.clone()),
            settings,
            events.clone(),
        );
        Harness { root, bridge, manager, settings: settings_tx, events }
    }

    /// Collects progress events of `ids` until all of them reached a terminal status.
    async fn run_to_end(
        rx: &mut broadcast::Receiver<EngineEvent>,
        ids: &[u64],
    ) -> Vec<TaskProgress> {
        let mut seen = Vec::new();
        let mut done = 0;
        tokio::time::timeout(Duration::from_secs(20), async {
            while done < ids.len() {
                if let EngineEvent::TaskProgress(p) = rx.recv().await.unwrap()
                    && ids.contains(&p.task_id)
                {
                    if p.status.is_terminal() {
                        done += 1;
                    }
                    seen.push(p);
                }
            }
        })
        .await
        .expect("tasks did not finish");
        seen
    }

    async fn wait_for_status(
        rx: &mut broadcast::Receiver<EngineEvent>,
        id: u64,
        status: TaskStatus,
    ) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let EngineEvent::TaskProgress(p) = rx.recv().await.unwrap()
                    && p.task_id == id
                    && p.status == status
                {
                    return;
                }
            }
        })
        .await
        .expect("status not reached");
    }

    fn uninstall(package: &str) -> TaskRequest {
        TaskRequest::Uninstall { package_name: package.into(), display_name: None }
    }

    fn assert_forward_only(updates: &[&TaskProgress]) {
        let mut statuses: Vec<TaskStatus> = updates.iter().map(|p| p.status).collect();
        statuses.dedup();
        let (last, head) = statuses.split_last().unwrap();
        assert!(last.is_terminal(), "{statuses:?}");
        assert!(
            [TaskStatus::Waiting, TaskStatus::Running].starts_with(head),
            "{statuses:?} is not a prefix of Waiting, Running, terminal"
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn device_lane_runs_one_task_at_a_time() {
        let h = harness(FakeBridge::connected("SERIAL")).await;
        h.bridge.set_delay(Duration::from_millis(50));
        let mut rx = h.events.subscribe();

        let mut ids = Vec::new();
        for package in ["com.example.a", "com.example.b", "com.example.c"] {
            ids.push(h.manager.submit(uninstall(package)).await.unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let updates = run_to_end(&mut rx, &ids).await;

        let mut current: HashMap<u64, TaskStatus> = HashMap::new();
        for update in &updates {
            current.insert(update.task_id, update.status);
            let running = current.values().filter(|s| **s == TaskStatus::Running).count();
            assert!(running <= 1, "{running} tasks hold the device lane");
        }
        for id in &ids {
            let own: Vec<&TaskProgress> = updates.iter().filter(|p| p.task_id == *id).collect();
            assert_forward_only(&own);
            assert_eq!(own.last().unwrap().status, TaskStatus::Completed);
        }
        assert_eq!(h.bridge.uninstalls.lock().unwrap().len(), 3);
        assert!(h.manager.list_active().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_on_finished_task_is_a_no_op() {
        let h = harness(FakeBridge::connected("SERIAL")).await;
        let mut rx = h.events.subscribe();
        let id = h.manager.submit(uninstall("com.example.a")).await.unwrap();
        run_to_end(&mut rx, &[id]).await;

        assert!(!h.manager.cancel(id));
        assert!(!h.manager.cancel(9999));
        let recent = h.manager.list_recent();
        assert_eq!(recent[0].id, id);
        assert_eq!(recent[0].status, TaskStatus::Completed);
        assert!(!recent[0].cancel_requested);
        assert!(recent[0].finished_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiting_task_leaves_the_queue_on_cancel() {
        let h = harness(FakeBridge::connected("SERIAL")).await;
        let held = h.manager.lanes.device.clone().acquire_owned().await.unwrap();
        let mut rx = h.events.subscribe();

        let id = h.manager.submit(uninstall("com.example.a")).await.unwrap();
        wait_for_status(&mut rx, id, TaskStatus::Waiting).await;
        assert!(h.manager.cancel(id));
        let updates = run_to_end(&mut rx, &[id]).await;

        assert_eq!(updates.last().unwrap().status, TaskStatus::Cancelled);
        assert!(updates.iter().all(|p| p.status != TaskStatus::Running));
        assert!(h.bridge.uninstalls.lock().unwrap().is_empty());
        assert!(h.manager.list_recent()[0].cancel_requested);
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_destructive_step_runs_to_completion() {
        let h = harness(FakeBridge::connected("SERIAL")).await;
        h.bridge.set_delay(Duration::from_millis(300));
        let mut rx = h.events.subscribe();

        let id = h.manager.submit(uninstall("com.example.a")).await.unwrap();
        wait_for_status(&mut rx, id, TaskStatus::Running).await;
        h.manager.cancel(id);
        let updates = run_to_end(&mut rx, &[id]).await;

        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Cancelled);
        assert!(last.message.contains("partially applied"), "{}", last.message);
        assert_eq!(*h.bridge.uninstalls.lock().unwrap(), vec!["com.example.a".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_keep_the_error_chain() {
        let h = harness(FakeBridge::connected("SERIAL")).await;
        h.bridge
            .uninstall_failures
            .lock()
            .unwrap()
            .push_back("Failure [DELETE_FAILED_INTERNAL_ERROR]".into());
        let mut rx = h.events.subscribe();

        let id = h.manager.submit(uninstall("com.example.gone")).await.unwrap();
        let updates = run_to_end(&mut rx, &[id]).await;

        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Failed);
        let error = last.error.as_deref().unwrap();
        assert!(error.contains("Package not installed"), "{error}");
        assert_eq!(h.manager.list_recent()[0].error.as_deref(), Some(error));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recent_history_is_capped() {
        let h = harness(FakeBridge::connected("SERIAL")).await;
        h.settings.send_modify(|s| s.recent_tasks_limit = 2);
        let mut rx = h.events.subscribe();

        let mut ids = Vec::new();
        for package in ["com.example.a", "com.example.b", "com.example.c"] {
            let id = h.manager.submit(uninstall(package)).await.unwrap();
            run_to_end(&mut rx, &[id]).await;
            ids.push(id);
        }

        let recent: Vec<u64> = h.manager.list_recent().iter().map(|t| t.id).collect();
        assert_eq!(recent, vec![ids[2], ids[1]]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unusable_backups_location_rejects_only_backup_work() {
        let h = harness(FakeBridge::connected("SERIAL")).await;
        std::fs::write(h.root.path().join("backups"), "not a directory").unwrap();

        let backup = TaskRequest::BackupApp {
            package_name: "com.example.a".into(),
            display_name: None,
            parts: BackupParts::all(),
            name_suffix: None,
        };
        let restore = TaskRequest::RestoreBackup { path: h.root.path().join("backups/x") };
        for request in [backup, restore] {
            let err = h.manager.submit(request).await.unwrap_err();
            assert_eq!(kind_of(&err), Some(ErrorKind::State), "{err:#}");
        }
        assert!(h.manager.list_active().is_empty());

        h.manager.submit(uninstall("com.example.a")).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admission_rejects_bad_requests_without_creating_tasks() {
        let h = harness(FakeBridge::default()).await;
        let mut rx = h.events.subscribe();

        let cases = [
            (uninstall("not a package"), ErrorKind::Validation),
            (uninstall("com.example.a"), ErrorKind::State),
            (
                TaskRequest::BackupApp {
                    package_name: "com.example.a".into(),
                    display_name: None,
                    parts: BackupParts::default(),
                    name_suffix: None,
                },
                ErrorKind::Validation,
            ),
            (
                TaskRequest::InstallApk { apk_path: h.root.path().join("missing.apk") },
                ErrorKind::Validation,
            ),
            (
                TaskRequest::InstallLocalApp { app_path: PathBuf::from("/definitely/not/here") },
                ErrorKind::Validation,
            ),
            (TaskRequest::RestoreBackup { path: h.root.path().to_path_buf() }, ErrorKind::Validation),
            (
                TaskRequest::Download {
                    full_name: "Alpha v5+1.0".into(),
                    package_name: "com.example.alpha".into(),
                },
                ErrorKind::State,
            ),
            (
                TaskRequest::Download {
                    full_name: "../../etc".into(),
                    package_name: "com.example.alpha".into(),
                },
                ErrorKind::Validation,
            ),
        ];
        for (request, expected) in cases {
            let err = h.manager.submit(request.clone()).await.unwrap_err();
            assert_eq!(kind_of(&err), Some(expected), "{request:?}: {err:#}");
        }

        assert!(h.manager.list_active().is_empty());
        assert!(h.manager.list_recent().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn donations_must_be_configured_and_eligible() {
        let bridge = FakeBridge::connected("SERIAL");
        bridge.respond(
            "--show-versioncode",
            "package:com.example.fresh versionCode:3\npackage:com.oculus.home versionCode:1\n",
        );
        bridge.respond("pm list packages -s", "package:com.oculus.home\n");
        let h = harness(bridge).await;
        h.manager.session.refresh().await;
        let donate = |package: &str| TaskRequest::DonateApp {
            package_name: package.into(),
            display_name: None,
        };

        let err = h.manager.submit(donate("com.example.fresh")).await.unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::State));

        let config = h.root.path().join("donating.json");
        std::fs::write(
            &config,
            r#"{
                "id": "donating",
                "source_kind": "preset-a",
                "remote_name": "mirror",
                "donation_remote_name": "uploads",
                "donation_remote_path": "Quest"
            }"#,
        )
        .unwrap();
        h.manager.catalog.install_config(ConfigSource::LocalFile(config)).await.unwrap();

        let err = h.manager.submit(donate("com.oculus.home")).await.unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Validation));
        let err = h.manager.submit(donate("com.example.missing")).await.unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Validation));

        let id = h.manager.submit(donate("com.example.fresh")).await.unwrap();
        h.manager.cancel(id);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn download_install_installs_and_cleans_up() {
        use crate::downloader::rclone::fake::fake_rclone;

        let h = harness(FakeBridge::connected("SERIAL")).await;
        let fixtures = tempfile::tempdir().unwrap();
        std::fs::create_dir(fixtures.path().join("Alpha v5+1.0")).unwrap();
        std::fs::write(fixtures.path().join("Alpha v5+1.0/alpha.apk"), b"apk").unwrap();
        let rclone = fake_rclone(h.root.path(), fixtures.path());
        h.settings.send_modify(|s| s.rclone_path = rclone.display().to_string());
        h.manager
            .catalog
            .install_config(ConfigSource::Preset(crate::models::SourceKind::PresetA))
            .await
            .unwrap();
        let mut rx = h.events.subscribe();

        let id = h
            .manager
            .submit(TaskRequest::DownloadInstall {
                full_name: "Alpha v5+1.0".into(),
                package_name: "com.example.alpha".into(),
            })
            .await
            .unwrap();
        let updates = run_to_end(&mut rx, &[id]).await;

        let own: Vec<&TaskProgress> = updates.iter().collect();
        assert_forward_only(&own);
        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Completed, "{:?}", last.error);
        assert!(updates.iter().any(|p| p.current_step == 2 && p.status == TaskStatus::Running));
        assert_eq!(h.bridge.installs.lock().unwrap().len(), 1);
        assert!(!h.root.path().join("downloads/Alpha v5+1.0").exists());
    }
}
