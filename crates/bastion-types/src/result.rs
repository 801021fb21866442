//! Execution outcomes and the sandbox lifecycle.

use serde::{Deserialize, Serialize};

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Ran to completion with exit code 0.
    Success,
    /// Ran to completion with a non-zero exit code.
    Failure,
    /// Killed by the watchdog.
    Timeout,
    /// Killed by the resource monitor (or the kernel OOM killer).
    ResourceLimit,
    /// The sandbox itself failed (staging, install, spawn, ...).
    Error,
    /// Aborted by the caller.
    Cancelled,
}

impl ExecutionStatus {
    /// All statuses, in declaration order.
    pub const ALL: [ExecutionStatus; 6] = [
        Self::Success,
        Self::Failure,
        Self::Timeout,
        Self::ResourceLimit,
        Self::Error,
        Self::Cancelled,
    ];

    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::ResourceLimit => "RESOURCE_LIMIT",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Isolation strategy actually used for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Kernel namespaces/cgroups via a container runtime.
    Container,
    /// Best-effort OS limits on a plain child process tree.
    Process,
}

/// Lifecycle of one sandboxed execution.
///
/// `Pending -> Preparing -> Running -> {Completed | TimedOut |
/// ResourceExceeded | Errored} -> CleanedUp`. Preparing may also fail
/// straight into `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Pending,
    Preparing,
    Running,
    Completed,
    TimedOut,
    ResourceExceeded,
    Errored,
    CleanedUp,
}

impl SandboxState {
    /// Whether the transition `self -> next` is legal.
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Pending, Errored)
                | (Preparing, Running)
                | (Preparing, Errored)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, ResourceExceeded)
                | (Running, Errored)
                | (Completed, CleanedUp)
                | (TimedOut, CleanedUp)
                | (ResourceExceeded, CleanedUp)
                | (Errored, CleanedUp)
        )
    }

    /// Whether the run has left `Running` for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::ResourceExceeded | Self::Errored | Self::CleanedUp
        )
    }
}

/// Structured outcome of one execution. Produced exactly once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Correlates the result with audit entries.
    pub execution_id: String,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
    /// Process exit code; `None` when killed by a signal or never started.
    pub exit_code: Option<i32>,
    /// Wall time of the RUNNING phase.
    pub execution_time_ms: u64,
    /// Highest sampled memory use of the process tree.
    #[serde(rename = "peakMemoryMB")]
    pub peak_memory_mb: f64,
    /// Highest sampled CPU use, percent of one core.
    #[serde(rename = "peakCPUPercent")]
    pub peak_cpu_percent: f64,
    /// Files the payload created, relative to the working directory.
    pub files_created: Vec<String>,
    /// Pre-existing files the payload changed.
    pub files_modified: Vec<String>,
    /// Payload output refused by the filesystem policy and removed.
    pub files_rejected: Vec<String>,
    /// Set for every non-success status.
    pub error_message: Option<String>,
    /// Isolation that was actually used.
    pub isolation: Option<IsolationMode>,
    /// Whether stdout hit the capture limit.
    pub stdout_truncated: bool,
    /// Whether stderr hit the capture limit.
    pub stderr_truncated: bool,
    /// Non-fatal notices (isolation fallback, ...).
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// An empty result for `execution_id` with the given status.
    pub fn new(execution_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            execution_id: execution_id.into(),
            status,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            execution_time_ms: 0,
            peak_memory_mb: 0.0,
            peak_cpu_percent: 0.0,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            files_rejected: Vec::new(),
            error_message: None,
            isolation: None,
            stdout_truncated: false,
            stderr_truncated: false,
            warnings: Vec::new(),
        }
    }

    /// A result for a run that failed before or outside the payload.
    pub fn error(execution_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::new(execution_id, ExecutionStatus::Error);
        result.error_message = Some(message.into());
        result
    }

    /// Whether the payload ran and exited 0.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&ExecutionStatus::ResourceLimit).expect("json");
        assert_eq!(json, "\"RESOURCE_LIMIT\"");
        assert_eq!(ExecutionStatus::ResourceLimit.as_str(), "RESOURCE_LIMIT");
    }

    #[test]
    fn legal_lifecycle_transitions() {
        use SandboxState::*;
        assert!(Pending.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Running));
        assert!(Running.can_transition_to(TimedOut));
        assert!(TimedOut.can_transition_to(CleanedUp));
        assert!(Preparing.can_transition_to(Errored));
    }

    #[test]
    fn illegal_lifecycle_transitions() {
        use SandboxState::*;
        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(CleanedUp));
        assert!(!CleanedUp.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
    }

    #[test]
    fn error_result_carries_message() {
        let r = ExecutionResult::error("exec-1", "spawn failed");
        assert_eq!(r.status, ExecutionStatus::Error);
        assert_eq!(r.error_message.as_deref(), Some("spawn failed"));
        assert!(!r.is_success());
    }

    #[test]
    fn result_json_field_names() {
        let r = ExecutionResult::new("exec-2", ExecutionStatus::Success);
        let json = serde_json::to_value(&r).expect("json");
        assert_eq!(json["status"], "SUCCESS");
        assert!(json.get("peakMemoryMB").is_some());
        assert!(json.get("filesCreated").is_some());
    }
}
