//! Fixed pool of concurrent job slots.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting pool shared between the dispatcher and running jobs.
#[derive(Debug, Clone)]
pub struct Capacity {
    semaphore: Arc<Semaphore>,
    total: usize,
}

/// One held slot. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct CapacitySlot {
    _permit: OwnedSemaphorePermit,
}

impl Capacity {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    /// Wait for a free slot. `None` only if the pool has been closed.
    pub async fn acquire(&self) -> Option<CapacitySlot> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| CapacitySlot { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn in_use(&self) -> usize {
        self.total - self.available()
    }
}
