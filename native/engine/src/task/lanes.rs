use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::models::Settings;

/// Concurrency lanes shared by tasks and catalog refreshes.
///
/// tokio semaphores hand out permits in request order, so each lane is FIFO.
#[derive(Debug, Clone)]
pub struct Lanes {
    /// Anything that talks to the device. Always a single permit.
    pub device: Arc<Semaphore>,
    pub network: Arc<Semaphore>,
}

impl Lanes {
    pub fn new(network_permits: usize) -> Self {
        Self {
            device: Arc::new(Semaphore::new(1)),
            network: Arc::new(Semaphore::new(network_permits.max(1))),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.network_lanes())
    }
}

/// The lane permit a task currently holds.
///
/// A task holds at most one lane at a time. The last permit is released only after the
/// task's terminal status was published.
#[derive(Debug, Default)]
pub(super) struct LaneSlot(Mutex<Option<OwnedSemaphorePermit>>);

impl LaneSlot {
    pub(super) fn hold(&self, permit: OwnedSemaphorePermit) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(permit);
    }

    pub(super) fn release(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
