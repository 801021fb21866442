//! One-time policy validation.
//!
//! Run once when a policy is built; the controllers assume a valid policy.

use bastion_types::{FilesystemPolicy, NetworkPolicy};

use crate::error::AccessError;
use crate::network::validate_domain_patterns;

/// Protocol names the network controller understands.
pub const KNOWN_PROTOCOLS: &[&str] = &["http", "https", "tcp", "dns"];

fn invalid(reason: impl Into<String>) -> AccessError {
    AccessError::InvalidConfig {
        reason: reason.into(),
    }
}

/// Validates a filesystem policy.
///
/// # Errors
///
/// Returns `InvalidConfig` for an empty root, zero size limit or
/// malformed extensions.
pub fn validate_filesystem_policy(policy: &FilesystemPolicy) -> Result<(), AccessError> {
    if policy.repo_root.as_os_str().is_empty() {
        return Err(invalid("filesystem.repo_root is empty"));
    }
    if policy.max_file_size_bytes == 0 {
        return Err(invalid("filesystem.max_file_size_bytes must be > 0"));
    }
    let extensions = policy
        .allowed_extensions
        .iter()
        .chain(policy.denied_extensions.iter());
    for ext in extensions {
        let ext = ext.trim().trim_start_matches('.');
        if ext.is_empty() || ext.contains(['/', '\\', '*']) {
            return Err(invalid(format!("invalid extension: {ext:?}")));
        }
    }
    if policy
        .allowed_paths
        .iter()
        .chain(policy.denied_paths.iter())
        .any(|p| p.as_os_str().is_empty())
    {
        return Err(invalid("empty path prefix"));
    }
    Ok(())
}

/// Validates a network policy.
///
/// # Errors
///
/// Returns `InvalidConfig` for malformed domain patterns, a zero rate
/// window with a non-zero rate limit, a zero request timeout, or an
/// unknown protocol name.
pub fn validate_network_policy(policy: &NetworkPolicy) -> Result<(), AccessError> {
    validate_domain_patterns(&policy.allowed_domains)
        .map_err(|e| invalid(format!("network.allowed_domains: {e}")))?;
    validate_domain_patterns(&policy.denied_domains)
        .map_err(|e| invalid(format!("network.denied_domains: {e}")))?;
    if policy.rate_limit > 0 && policy.rate_window_seconds == 0 {
        return Err(invalid(
            "network.rate_window_seconds must be > 0 when rate_limit is set",
        ));
    }
    if policy.request_timeout_seconds == 0 {
        return Err(invalid("network.request_timeout_seconds must be > 0"));
    }
    if let Some(unknown) = policy
        .allowed_protocols
        .iter()
        .find(|p| !KNOWN_PROTOCOLS.contains(&p.as_str()))
    {
        return Err(invalid(format!(
            "unknown protocol {unknown:?}; expected one of {KNOWN_PROTOCOLS:?}"
        )));
    }
    if policy.allowed_ports.contains(&0) || policy.denied_ports.contains(&0) {
        return Err(invalid("port 0 is not a valid port"));
    }
    Ok(())
}
