//! Execution metrics for the sandbox.
//!
//! Lock-free atomics recorded from concurrent executions. Use
//! [`MetricsSnapshot`] for a copyable view.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bastion_types::ExecutionStatus;
use serde::Serialize;

/// Shared execution counters.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    total_executions: AtomicU64,
    rejected_requests: AtomicU64,
    isolation_fallbacks: AtomicU64,
    total_execution_ms: AtomicU64,
    files_created: AtomicU64,
    by_status: [AtomicU64; ExecutionStatus::ALL.len()],
}

/// A point-in-time snapshot of [`ExecutionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Executions that reached the sandbox.
    pub total_executions: u64,
    /// Requests refused before reaching the sandbox.
    pub rejected_requests: u64,
    /// Runs that fell back from container to process isolation.
    pub isolation_fallbacks: u64,
    /// Wall time summed over all executions.
    pub total_execution_ms: u64,
    /// Files payloads left behind in their working directories.
    pub files_created: u64,
    /// Finished executions keyed by status name (`SUCCESS`, `TIMEOUT`, ...).
    pub by_status: BTreeMap<String, u64>,
}

fn status_index(status: ExecutionStatus) -> usize {
    ExecutionStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or(0)
}

impl ExecutionMetrics {
    /// Creates zeroed metrics wrapped in an [`Arc`].
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records one execution entering the sandbox.
    pub fn record_attempt(&self) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request refused during validation.
    pub fn record_rejection(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a container-to-process fallback.
    pub fn record_fallback(&self) {
        self.isolation_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished execution.
    pub fn record_outcome(&self, status: ExecutionStatus, execution_time_ms: u64) {
        self.by_status[status_index(status)].fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    /// Records files a payload created.
    pub fn record_files_created(&self, count: u64) {
        self.files_created.fetch_add(count, Ordering::Relaxed);
    }

    /// Finished executions with `status`.
    pub fn count(&self, status: ExecutionStatus) -> u64 {
        self.by_status[status_index(status)].load(Ordering::Relaxed)
    }

    /// Returns a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_executions: self.total_executions.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            isolation_fallbacks: self.isolation_fallbacks.load(Ordering::Relaxed),
            total_execution_ms: self.total_execution_ms.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            by_status: ExecutionStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), self.count(*s)))
                .collect(),
        }
    }
}
