use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{
    adb::CommandKind,
    models::{DeviceConnection, DownloaderStatus, TaskProgress, log::LogEntry},
};

/// Overall health of the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum EngineHealth {
    #[default]
    Healthy,
    /// Some resource is unusable; requests touching it are rejected.
    Degraded { reasons: Vec<String> },
}

/// Everything the engine tells its consumers.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    TaskProgress(TaskProgress),
    BackupsChanged,
    DownloadsChanged,
    DeviceChanged(Box<DeviceConnection>),
    CommandCompleted { command_type: CommandKind, command_key: String, success: bool },
    DownloaderStatusChanged(DownloaderStatus),
    DownloaderInitProgress { message: String, progress: Option<f32> },
    CatalogDownloadProgress { bytes: u64, total_bytes: u64 },
    CatalogChanged { app_count: usize },
    HealthChanged(EngineHealth),
    Log(Vec<LogEntry>),
}

/// Fan-out channel for [`EngineEvent`]s.
///
/// Slow subscribers lose the oldest events instead of slowing the engine down.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    const CAPACITY: usize = 1024;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
