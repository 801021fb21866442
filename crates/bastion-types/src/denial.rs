//! Structured reasons for policy denials.
//!
//! A denial always names the rule that fired so audits can tell
//! "outside the repository" apart from "extension not allowed".

use serde::{Deserialize, Serialize};
use std::fmt;

/// The specific policy rule that rejected an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialRule {
    /// Path escapes the repository root (and any controller temp dir).
    OutsideRoot,
    /// Path matches a `denied_paths` prefix.
    DeniedPath,
    /// Path is inside a protected system location.
    SystemPath,
    /// `allowed_paths` is non-empty and the path matches none of them.
    NotInAllowedPaths,
    /// Extension is in `denied_extensions`.
    DeniedExtension,
    /// `allowed_extensions` is non-empty and the extension is not listed.
    ExtensionNotAllowed,
    /// Resulting file would exceed `max_file_size_bytes`.
    FileTooLarge,
    /// Creating the file would exceed `max_files_created`.
    TooManyFiles,
    /// Host matches a `denied_domains` pattern.
    DeniedDomain,
    /// Default-deny is on and the host matches no allowed domain or IP.
    DomainNotAllowed,
    /// Resolved or literal IP is inside a denied CIDR.
    DeniedIp,
    /// Default-deny is on and the IP is in no allowed CIDR.
    IpNotAllowed,
    /// Port is in `denied_ports`.
    DeniedPort,
    /// `allowed_ports` is non-empty and the port is not listed.
    PortNotAllowed,
    /// Scheme/protocol is not in `allowed_protocols`.
    ProtocolNotAllowed,
    /// Per-host sliding window is full.
    RateLimited,
    /// Response body exceeded `max_response_size_bytes`.
    ResponseTooLarge,
    /// Too many redirects, or a redirect hop failed policy.
    RedirectRefused,
    /// Host is outside the request-scoped `allowed_hosts`.
    HostNotInRequest,
    /// Requested resource limit exceeds the session ceiling.
    LimitAboveCeiling,
    /// Target could not be parsed into something the policy can judge.
    InvalidTarget,
}

impl DenialRule {
    /// Stable snake_case identifier used in logs and audit metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutsideRoot => "outside_root",
            Self::DeniedPath => "denied_path",
            Self::SystemPath => "system_path",
            Self::NotInAllowedPaths => "not_in_allowed_paths",
            Self::DeniedExtension => "denied_extension",
            Self::ExtensionNotAllowed => "extension_not_allowed",
            Self::FileTooLarge => "file_too_large",
            Self::TooManyFiles => "too_many_files",
            Self::DeniedDomain => "denied_domain",
            Self::DomainNotAllowed => "domain_not_allowed",
            Self::DeniedIp => "denied_ip",
            Self::IpNotAllowed => "ip_not_allowed",
            Self::DeniedPort => "denied_port",
            Self::PortNotAllowed => "port_not_allowed",
            Self::ProtocolNotAllowed => "protocol_not_allowed",
            Self::RateLimited => "rate_limited",
            Self::ResponseTooLarge => "response_too_large",
            Self::RedirectRefused => "redirect_refused",
            Self::HostNotInRequest => "host_not_in_request",
            Self::LimitAboveCeiling => "limit_above_ceiling",
            Self::InvalidTarget => "invalid_target",
        }
    }
}

impl fmt::Display for DenialRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy decision that refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    /// The rule that fired.
    pub rule: DenialRule,
    /// The path, host or URL that was judged.
    pub target: String,
    /// Free-form detail (matching pattern, limit value, ...).
    pub detail: String,
}

impl Denial {
    /// Creates a new denial.
    pub fn new(rule: DenialRule, target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            rule,
            target: target.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{} ({})", self.target, self.rule)
        } else {
            write!(f, "{} ({}: {})", self.target, self.rule, self.detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_display_includes_rule_and_detail() {
        let d = Denial::new(DenialRule::FileTooLarge, "out.bin", "limit 1024 bytes");
        assert_eq!(d.to_string(), "out.bin (file_too_large: limit 1024 bytes)");
    }

    #[test]
    fn rule_serializes_snake_case() {
        let json = serde_json::to_string(&DenialRule::NotInAllowedPaths).expect("json");
        assert_eq!(json, "\"not_in_allowed_paths\"");
        assert_eq!(DenialRule::NotInAllowedPaths.as_str(), "not_in_allowed_paths");
    }
}
