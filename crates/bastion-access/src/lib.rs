//! # bastion-access
//!
//! Policy-enforcing access controllers for bastion.
//!
//! [`FilesystemAccessController`] and [`NetworkAccessController`] validate
//! every operation against an immutable policy before any I/O, and record
//! each decision in the shared [`AuditLog`].

pub mod audit;
pub mod error;
pub mod filesystem;
pub mod fs_backend;
pub mod net_backend;
pub mod net_controller;
pub mod network;
pub mod policy;
pub mod rate_limiter;

pub use audit::{AuditLog, AuditSummary};
pub use error::AccessError;
pub use filesystem::{FileOperation, FilesystemAccessController, FsStats, ScopedFile, WriteReceipt};
pub use fs_backend::{FileMeta, FileSystem, OpenMode, OsFileSystem};
pub use net_backend::{BackendError, HttpMethod, HttpRequest, HttpResponse, NetworkBackend, ReqwestBackend};
pub use net_controller::{NetStats, NetworkAccessController, ScopedSocket};
pub use network::{is_host_allowed, is_ip_in, matches_domain, normalize_host, validate_domain_patterns, Target};
pub use policy::{validate_filesystem_policy, validate_network_policy, KNOWN_PROTOCOLS};
pub use rate_limiter::RateLimiter;
