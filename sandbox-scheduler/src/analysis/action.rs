use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

use super::AnalysisStatus;

struct PendingAction {
    status: AnalysisStatus,
    done: oneshot::Sender<()>,
    _permit: OwnedSemaphorePermit,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Single outstanding request from an analysis worker to the scheduler.
///
/// The worker side blocks in [`ActionSlot::request`] until the scheduler
/// has handled the request and called [`ActionSlot::release`]. A second
/// request waits for the first one to be released.
pub struct ActionSlot {
    permit: Arc<Semaphore>,
    pending: Mutex<Option<PendingAction>>,
}

impl Default for ActionSlot {
    fn default() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            pending: Mutex::new(None),
        }
    }
}

impl ActionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the scheduler to act for `status` and wait until it has
    pub async fn request(&self, status: AnalysisStatus) {
        let permit = match self.permit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match self.permit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let (done, wait) = oneshot::channel();
        *lock(&self.pending) = Some(PendingAction {
            status,
            done,
            _permit: permit,
        });
        let _ = wait.await;
    }

    /// Status of the outstanding request, if any
    pub fn requested(&self) -> Option<AnalysisStatus> {
        lock(&self.pending).as_ref().map(|p| p.status)
    }

    /// Complete the outstanding request; false when there was none
    pub fn release(&self) -> bool {
        match lock(&self.pending).take() {
            Some(pending) => {
                let _ = pending.done.send(());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_request(slot: &ActionSlot) -> AnalysisStatus {
        loop {
            if let Some(status) = slot.requested() {
                return status;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_blocks_until_released() {
        let slot = Arc::new(ActionSlot::new());
        let worker = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.request(AnalysisStatus::Starting).await })
        };

        assert_eq!(wait_for_request(&slot).await, AnalysisStatus::Starting);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!worker.is_finished());

        assert!(slot.release());
        worker.await.unwrap();
        assert!(slot.requested().is_none());
        assert!(!slot.release());
    }

    #[tokio::test]
    async fn test_second_request_waits_for_first() {
        let slot = Arc::new(ActionSlot::new());
        let first = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.request(AnalysisStatus::NewUrlBlock).await })
        };
        assert_eq!(wait_for_request(&slot).await, AnalysisStatus::NewUrlBlock);

        let second = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.request(AnalysisStatus::Aborted).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Still the first request; the second one has not taken the slot
        assert_eq!(slot.requested(), Some(AnalysisStatus::NewUrlBlock));

        assert!(slot.release());
        first.await.unwrap();

        assert_eq!(wait_for_request(&slot).await, AnalysisStatus::Aborted);
        assert!(slot.release());
        second.await.unwrap();
    }
}
