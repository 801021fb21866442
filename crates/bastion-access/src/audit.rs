//! Append-only, thread-safe audit log.
//!
//! Every controller decision lands here, allowed or not. Entries are also
//! emitted as `tracing` events on the `bastion::audit` target so they reach
//! whatever subscriber the host installed.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bastion_types::{AuditLogEntry, AuditOperation, AuditResult};
use serde::{Deserialize, Serialize};

/// Cumulative counters over everything ever recorded.
///
/// Counters survive eviction, so they stay accurate when the log is
/// capacity-bounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    /// Entries recorded.
    pub total: u64,
    /// `ALLOWED` entries.
    pub allowed: u64,
    /// `DENIED` entries.
    pub denied: u64,
    /// `RESTRICTED` entries.
    pub restricted: u64,
    /// `ERROR` entries.
    pub errors: u64,
    /// Entries evicted by the capacity bound.
    pub dropped: u64,
}

/// Thread-safe append-only audit log.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    max_entries: Option<usize>,
    total: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    restricted: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

impl AuditLog {
    /// Creates an unbounded log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unbounded log behind an `Arc`, ready to share.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Creates a log retaining at most `max_entries`; the oldest go first.
    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::default()
        }
    }

    /// Appends an entry.
    pub fn record(&self, entry: AuditLogEntry) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match entry.result {
            AuditResult::Allowed => &self.allowed,
            AuditResult::Denied => &self.denied,
            AuditResult::Restricted => &self.restricted,
            AuditResult::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        emit(&entry);

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        if let Some(max) = self.max_entries {
            while entries.len() > max {
                entries.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns a copy of all retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    /// Returns the most recent entry.
    pub fn last(&self) -> Option<AuditLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.back().cloned()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained entries with the given result.
    pub fn filter_by_result(&self, result: AuditResult) -> Vec<AuditLogEntry> {
        self.filter(|e| e.result == result)
    }

    /// Retained entries for one operation kind.
    pub fn filter_by_operation(&self, operation: AuditOperation) -> Vec<AuditLogEntry> {
        self.filter(|e| e.operation == operation)
    }

    /// Retained entries tagged with `execution_id`.
    pub fn for_execution(&self, execution_id: &str) -> Vec<AuditLogEntry> {
        self.filter(|e| e.execution_id.as_deref() == Some(execution_id))
    }

    fn filter(&self, pred: impl Fn(&AuditLogEntry) -> bool) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|e| pred(e)).cloned().collect()
    }

    /// Cumulative counters.
    pub fn summary(&self) -> AuditSummary {
        AuditSummary {
            total: self.total.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            restricted: self.restricted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Serializes the retained entries as a pretty JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries())
    }

    /// Writes the retained entries to `path` as JSON. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns any serialization or write failure.
    pub fn export_json(&self, path: impl AsRef<Path>) -> std::io::Result<usize> {
        let entries = self.entries();
        let json = serde_json::to_string_pretty(&entries)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json)?;
        Ok(entries.len())
    }
}

fn emit(entry: &AuditLogEntry) {
    let execution_id = entry.execution_id.as_deref().unwrap_or("-");
    let reason = entry.error_message.as_deref().unwrap_or("");
    match entry.result {
        AuditResult::Denied => tracing::warn!(
            target: "bastion::audit",
            operation = %entry.operation,
            target_path = %entry.target,
            execution_id,
            reason,
            "DENIED"
        ),
        AuditResult::Error => tracing::error!(
            target: "bastion::audit",
            operation = %entry.operation,
            target_path = %entry.target,
            execution_id,
            reason,
            "ERROR"
        ),
        AuditResult::Restricted => tracing::info!(
            target: "bastion::audit",
            operation = %entry.operation,
            target_path = %entry.target,
            execution_id,
            reason,
            "RESTRICTED"
        ),
        AuditResult::Allowed => tracing::debug!(
            target: "bastion::audit",
            operation = %entry.operation,
            target_path = %entry.target,
            execution_id,
            duration_ms = entry.duration_ms,
            "ALLOWED"
        ),
    }
}
