//! Concurrency slots shared by every execution unit.
//!
//! A unit holds one slot from before metadata resolution until its final
//! state is recorded, so the number of jobs in an active state never exceeds
//! the limit fixed at construction.

use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub(crate) struct SlotGate {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl SlotGate {
    /// A limit of 0 is raised to 1.
    pub(crate) fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.limit.saturating_sub(self.available())
    }

    /// Waits for a free slot. The permit gives the slot back when dropped,
    /// including on unwind.
    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire_owned().await
    }
}
