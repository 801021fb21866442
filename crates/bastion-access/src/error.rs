//! Access-layer error types.

use bastion_types::{BastionError, Denial, DenialRule, DiagnosticError, ErrorKind};
use thiserror::Error;

/// Errors from the filesystem and network access controllers.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Refused by policy. Raised before any I/O touches the target.
    #[error("policy violation: {0}")]
    PolicyViolation(Denial),
    /// The operation passed policy but the filesystem call failed.
    #[error("{operation} failed for {path}: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// DNS, connect or transfer failure. Never retried here.
    #[error("network error for {target}: {reason}")]
    Network { target: String, reason: String },
    /// A policy failed validation.
    #[error("invalid policy: {reason}")]
    InvalidConfig { reason: String },
}

impl AccessError {
    /// Shorthand for a policy violation.
    pub fn denied(rule: DenialRule, target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PolicyViolation(Denial::new(rule, target, detail))
    }

    /// Returns the denial when this is a policy violation.
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::PolicyViolation(denial) => Some(denial),
            _ => None,
        }
    }

    /// Whether this is a policy violation.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation(_))
    }
}

impl From<Denial> for AccessError {
    fn from(denial: Denial) -> Self {
        Self::PolicyViolation(denial)
    }
}

impl From<AccessError> for BastionError {
    fn from(e: AccessError) -> Self {
        let kind = match &e {
            AccessError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            AccessError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            AccessError::Io { .. } => ErrorKind::Internal,
            AccessError::Network { .. } => ErrorKind::TransientNetwork,
            AccessError::InvalidConfig { .. } => ErrorKind::InvalidInput,
        };
        let context = e.denial().map(|d| format!("rule: {}", d.rule));
        let err = BastionError::new(kind, e.to_string());
        match context {
            Some(ctx) => err.with_context(ctx),
            None => err,
        }
    }
}

impl DiagnosticError for AccessError {
    fn hint(&self) -> Option<String> {
        match self {
            Self::PolicyViolation(denial) => Some(match denial.rule {
                DenialRule::OutsideRoot => format!(
                    "'{}' resolves outside the repository root.",
                    denial.target
                ),
                DenialRule::SystemPath => {
                    format!("'{}' is a protected system location.", denial.target)
                }
                DenialRule::RateLimited => format!(
                    "Too many requests to '{}' in the current rate window.",
                    denial.target
                ),
                DenialRule::DomainNotAllowed | DenialRule::IpNotAllowed => format!(
                    "Network access is deny-by-default and '{}' is not allow-listed.",
                    denial.target
                ),
                _ => format!("Access to '{}' was refused: {}.", denial.target, denial.rule),
            }),
            Self::Network { target, .. } => Some(format!(
                "The request to '{target}' passed policy but the network call failed."
            )),
            Self::Io { path, .. } => Some(format!(
                "The filesystem call on '{path}' passed policy but failed."
            )),
            Self::InvalidConfig { .. } => {
                Some("The access policy configuration has invalid values.".into())
            }
        }
    }

    fn fix(&self) -> Option<String> {
        let Self::PolicyViolation(denial) = self else {
            return match self {
                Self::Network { .. } => {
                    Some("Retry from the calling layer; bastion never retries.".into())
                }
                _ => None,
            };
        };
        match denial.rule {
            DenialRule::DomainNotAllowed => Some(format!(
                "Add to the config:\n  [network]\n  allowed_domains = [\"{}\"]",
                denial.target
            )),
            DenialRule::DeniedExtension | DenialRule::ExtensionNotAllowed => Some(
                "Adjust [filesystem] allowed_extensions / denied_extensions.".into(),
            ),
            DenialRule::FileTooLarge => {
                Some("Raise [filesystem] max_file_size_bytes.".into())
            }
            DenialRule::TooManyFiles => Some("Raise [filesystem] max_files_created.".into()),
            DenialRule::RateLimited => Some(
                "Wait for the window to slide, or raise [network] rate_limit.".into(),
            ),
            DenialRule::OutsideRoot => Some(
                "Use a path inside the repository root, or set [filesystem] restrict_to_root = false."
                    .into(),
            ),
            _ => None,
        }
    }
}
