//! Audit log entries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Read,
    Write,
    Append,
    Copy,
    Move,
    Delete,
    Open,
    ListDir,
    CreateTempDir,
    CleanupTempDir,
    /// Validate-only check (no I/O performed).
    Check,
    /// Staging a request file into a working directory.
    Stage,
    HttpGet,
    HttpPost,
    HttpPut,
    HttpDelete,
    DnsLookup,
    SocketConnect,
    /// Connection brokered by the egress proxy for a running payload.
    ProxyConnect,
    /// A sandboxed execution.
    Exec,
    InstallRequirements,
    /// Container isolation unavailable; process isolation used instead.
    IsolationFallback,
}

impl AuditOperation {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Append => "append",
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Open => "open",
            Self::ListDir => "list_dir",
            Self::CreateTempDir => "create_temp_dir",
            Self::CleanupTempDir => "cleanup_temp_dir",
            Self::Check => "check",
            Self::Stage => "stage",
            Self::HttpGet => "http_get",
            Self::HttpPost => "http_post",
            Self::HttpPut => "http_put",
            Self::HttpDelete => "http_delete",
            Self::DnsLookup => "dns_lookup",
            Self::SocketConnect => "socket_connect",
            Self::ProxyConnect => "proxy_connect",
            Self::Exec => "exec",
            Self::InstallRequirements => "install_requirements",
            Self::IsolationFallback => "isolation_fallback",
        }
    }

    /// Whether the operation belongs to the network controller.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::HttpGet
                | Self::HttpPost
                | Self::HttpPut
                | Self::HttpDelete
                | Self::DnsLookup
                | Self::SocketConnect
                | Self::ProxyConnect
        )
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    /// Passed policy and completed.
    Allowed,
    /// Refused by policy before any I/O.
    Denied,
    /// Allowed but cut short or weakened (size cap, isolation fallback).
    Restricted,
    /// Passed policy but the I/O itself failed.
    Error,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// What was attempted.
    pub operation: AuditOperation,
    /// Path, URL or host.
    pub target: String,
    /// Decision.
    pub result: AuditResult,
    /// Reason for DENIED/ERROR/RESTRICTED.
    pub error_message: Option<String>,
    /// Time spent on validation plus I/O.
    pub duration_ms: u64,
    /// Checksums, byte counts, rule names, ...
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Execution this entry belongs to, if any.
    pub execution_id: Option<String>,
}

impl AuditLogEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(operation: AuditOperation, target: impl Into<String>, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            target: target.into(),
            result,
            error_message: None,
            duration_ms: 0,
            metadata: BTreeMap::new(),
            execution_id: None,
        }
    }

    /// Sets the error message.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Sets the duration.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Adds one metadata field.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tags the entry with an execution id.
    pub fn with_execution_id(mut self, execution_id: Option<String>) -> Self {
        self.execution_id = execution_id;
        self
    }
}
