//! # bastion-types
//!
//! Domain types for the bastion execution sandbox.
//! Pure data: requests, results, policies, audit entries and the error
//! taxonomy. No I/O happens in this crate.

pub mod audit;
pub mod denial;
pub mod error;
pub mod policy;
pub mod request;
pub mod result;

// Re-exports for convenience.
pub use audit::{AuditLogEntry, AuditOperation, AuditResult};
pub use denial::{Denial, DenialRule};
pub use error::{BastionError, DiagnosticError, ErrorKind};
pub use policy::{
    default_denied_networks, FilesystemPolicy, IsolationPreference, NetworkPolicy, RateLimitMode,
    ResourceLimits, SandboxSettings, SYSTEM_PATHS,
};
pub use request::{ExecutionRequest, Language};
pub use result::{ExecutionResult, ExecutionStatus, IsolationMode, SandboxState};
