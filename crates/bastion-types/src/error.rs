//! Unified error types for the bastion domain layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of domain errors.
///
/// The variants follow the failure taxonomy every component reports into:
/// callers match on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A path, domain, extension, port or limit was refused by policy.
    /// Recoverable with different input, never retried automatically.
    PolicyViolation,
    /// Memory, CPU or wall-time limit hit. Terminal for that execution.
    ResourceExceeded,
    /// The requested isolation primitive is not available on this host.
    IsolationUnavailable,
    /// DNS or connect failure. Surfaced, never retried internally.
    TransientNetwork,
    /// Malformed request or configuration.
    InvalidInput,
    /// Referenced resource does not exist.
    NotFound,
    /// Bug or unexpected host failure inside the sandbox itself.
    Internal,
}

/// Domain-level error with structured context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BastionError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional context.
    pub context: Option<String>,
}

impl BastionError {
    /// Creates a new `BastionError`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Adds context to the error.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Creates a policy-violation error.
    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyViolation, message)
    }

    /// Creates an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Returns `true` when the caller may retry with different input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::PolicyViolation | ErrorKind::InvalidInput | ErrorKind::TransientNetwork
        )
    }
}

impl fmt::Display for BastionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(ctx) = &self.context {
            write!(f, " ({})", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for BastionError {}

/// Transforms technical errors into user-actionable diagnostics.
///
/// Implementors provide optional `hint` (cause explanation) and `fix`
/// (concrete remediation step) for each error variant.
pub trait DiagnosticError {
    /// A human-readable explanation of the likely cause.
    fn hint(&self) -> Option<String> {
        None
    }
    /// A concrete fix the user can apply (e.g. a config change).
    fn fix(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_without_context() {
        let err = BastionError::new(ErrorKind::NotFound, "file not found");
        assert_eq!(err.to_string(), "[NotFound] file not found");
    }

    #[test]
    fn error_display_with_context() {
        let err = BastionError::policy_violation("denied").with_context("path: /etc/passwd");
        assert!(err.to_string().contains("/etc/passwd"));
    }

    #[test]
    fn error_serialization_roundtrip() {
        let err = BastionError::new(ErrorKind::ResourceExceeded, "memory limit");
        let json = serde_json::to_string(&err).expect("serialize");
        assert!(json.contains("resource_exceeded"));
        let back: BastionError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, ErrorKind::ResourceExceeded);
        assert_eq!(back.message, "memory limit");
    }

    #[test]
    fn recoverable_kinds() {
        assert!(BastionError::policy_violation("x").is_recoverable());
        assert!(BastionError::invalid_input("x").is_recoverable());
        assert!(!BastionError::internal("x").is_recoverable());
        assert!(!BastionError::new(ErrorKind::ResourceExceeded, "x").is_recoverable());
    }

    #[test]
    fn diagnostic_trait_defaults_to_none() {
        struct Dummy;
        impl DiagnosticError for Dummy {}
        let d = Dummy;
        assert!(d.hint().is_none());
        assert!(d.fix().is_none());
    }
}
