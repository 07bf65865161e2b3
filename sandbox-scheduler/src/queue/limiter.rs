use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many machines may be starting at the same time.
///
/// A permit is taken when a task is matched to a machine and handed to
/// its analysis manager, which drops it once the machine is up.
#[derive(Debug, Clone)]
pub struct StartupLimiter {
    sem: Arc<Semaphore>,
    max: usize,
}

impl StartupLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Whether a permit could be taken right now. Takes nothing.
    pub fn available(&self) -> bool {
        self.sem.available_permits() > 0
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().try_acquire_owned().ok()
    }

    /// Machines currently starting
    pub fn in_use(&self) -> usize {
        self.max.saturating_sub(self.sem.available_permits())
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
