//! Bounded execution slots.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::RuntimeError;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Executions allowed to run at once.
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Semaphore bounding concurrent executions.
///
/// Clones share the same slots.
#[derive(Debug, Clone)]
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a free slot. The slot is released when the permit drops.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once [`Scheduler::drain_and_close`] has run.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, RuntimeError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RuntimeError::ShuttingDown)
    }

    /// Waits until every in-flight execution has released its slot.
    pub async fn drain(&self) {
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        if let Ok(permits) = self.semaphore.acquire_many(all).await {
            drop(permits);
        }
    }

    /// Drains, then refuses new executions. Waiters queued behind the drain
    /// get `ShuttingDown`.
    pub async fn drain_and_close(&self) {
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        let permits = self.semaphore.acquire_many(all).await;
        self.semaphore.close();
        drop(permits);
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
