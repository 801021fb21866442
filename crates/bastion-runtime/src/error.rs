//! Runtime-specific error types.

use bastion_access::AccessError;
use bastion_config::ConfigError;
use bastion_types::{BastionError, DiagnosticError, ErrorKind, IsolationMode};
use thiserror::Error;

/// Errors from the execution sandbox and the manager.
///
/// Timeouts and resource limits are not errors: they are reported as an
/// [`bastion_types::ExecutionStatus`] on the result.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The request failed validation.
    #[error("invalid execution request: {reason}")]
    InvalidRequest { reason: String },
    /// A per-request limit asks for more than the session allows.
    #[error("{limit} of {requested} exceeds the session ceiling of {ceiling}")]
    LimitAboveCeiling {
        limit: &'static str,
        requested: u64,
        ceiling: u64,
    },
    /// Access controller refused or failed an operation.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The requested isolation primitive cannot be used.
    #[error("{mode:?} isolation unavailable: {reason}")]
    IsolationUnavailable { mode: IsolationMode, reason: String },
    /// The payload could not be started.
    #[error("failed to launch payload: {reason}")]
    Launch { reason: String },
    /// Requirement installation failed or timed out.
    #[error("requirement installation failed: {reason}")]
    Install { reason: String },
    /// Host-side I/O failed while preparing or cleaning up.
    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// The caller cancelled the execution before the payload started.
    #[error("execution cancelled")]
    Cancelled,
    /// The manager is shutting down and accepts no new executions.
    #[error("execution slots closed: shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<BastionError> for RuntimeError {
    fn from(e: BastionError) -> Self {
        Self::InvalidRequest { reason: e.message }
    }
}

impl From<RuntimeError> for BastionError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Access(inner) => inner.into(),
            RuntimeError::Config(inner) => inner.into(),
            other => {
                let kind = match &other {
                    RuntimeError::InvalidRequest { .. } => ErrorKind::InvalidInput,
                    RuntimeError::LimitAboveCeiling { .. } => ErrorKind::PolicyViolation,
                    RuntimeError::IsolationUnavailable { .. } => ErrorKind::IsolationUnavailable,
                    _ => ErrorKind::Internal,
                };
                BastionError::new(kind, other.to_string())
            }
        }
    }
}

impl DiagnosticError for RuntimeError {
    fn hint(&self) -> Option<String> {
        match self {
            Self::LimitAboveCeiling { limit, .. } => Some(format!(
                "Requests may only narrow the session limits; {limit} asks for more."
            )),
            Self::IsolationUnavailable {
                mode: IsolationMode::Container,
                ..
            } => Some("The container runtime is not installed or not reachable.".into()),
            Self::IsolationUnavailable { .. } => {
                Some("The interpreter for this language is not on PATH.".into())
            }
            Self::Install { .. } => Some(
                "A package index lookup or build step failed inside the isolated dependency dir."
                    .into(),
            ),
            Self::ShuttingDown => Some("shutdown() was called on this manager.".into()),
            Self::Access(e) => e.hint(),
            Self::Config(e) => e.hint(),
            _ => None,
        }
    }

    fn fix(&self) -> Option<String> {
        match self {
            Self::LimitAboveCeiling { limit, .. } => Some(format!(
                "Lower the request's {limit} or raise it under [limits] in the config."
            )),
            Self::IsolationUnavailable {
                mode: IsolationMode::Container,
                ..
            } => Some(
                "Install docker, set sandbox.container_runtime, or set sandbox.isolation = \"auto\"."
                    .into(),
            ),
            Self::Install { .. } => Some(
                "Pin the requirement to a published version, or raise \
                 sandbox.install_timeout_seconds."
                    .into(),
            ),
            Self::Access(e) => e.fix(),
            Self::Config(e) => e.fix(),
            _ => None,
        }
    }
}
