//! Host, IP and URL matching for the network policy.
//!
//! Domain patterns are exact hosts or leading-wildcard `*.suffix`. A
//! wildcard matches strict subdomains only, never the apex. Domain patterns
//! never match IP literals, so an allow-listed name cannot be bypassed by
//! connecting to a bare address.

use std::net::IpAddr;

use ipnet::IpNet;
use url::Url;

/// Lowercases a host and strips a trailing dot and IPv6 brackets.
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Parses `host` as an IP literal.
pub fn parse_ip(host: &str) -> Option<IpAddr> {
    normalize_host(host).parse().ok()
}

/// Checks one host against one pattern.
pub fn matches_domain(host: &str, pattern: &str) -> bool {
    let host = normalize_host(host);
    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        return false;
    }
    let pattern = normalize_host(pattern);
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            host.len() > suffix.len() + 1
                && host.ends_with(suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
        }
        None => host == pattern,
    }
}

/// Checks if `host` matches any pattern in `patterns`.
pub fn is_host_allowed(host: &str, patterns: &[String]) -> bool {
    first_matching_pattern(host, patterns).is_some()
}

/// Returns the first pattern matching `host`.
pub fn first_matching_pattern<'a>(host: &str, patterns: &'a [String]) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| matches_domain(host, p))
        .map(String::as_str)
}

/// Returns the first network containing `ip`.
///
/// IPv4-mapped IPv6 addresses are compared in their IPv4 form.
pub fn matching_network(ip: IpAddr, networks: &[IpNet]) -> Option<IpNet> {
    let ip = canonical_ip(ip);
    networks.iter().copied().find(|net| net.contains(&ip))
}

/// Whether `ip` is inside any of `networks`.
pub fn is_ip_in(ip: IpAddr, networks: &[IpNet]) -> bool {
    matching_network(ip, networks).is_some()
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// A URL broken down into what the policy judges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Lowercase scheme (`http`, `https`).
    pub scheme: String,
    /// Normalized host.
    pub host: String,
    /// Explicit or scheme-default port.
    pub port: u16,
    /// The parsed URL.
    pub url: Url,
}

impl Target {
    /// Parses an absolute URL. Returns a reason on failure.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = Url::parse(raw).map_err(|e| format!("malformed url: {e}"))?;
        Self::from_url(url)
    }

    /// Breaks down an already parsed URL.
    pub fn from_url(url: Url) -> Result<Self, String> {
        let host = url
            .host_str()
            .map(normalize_host)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| "url has no host".to_string())?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| format!("no port for scheme {}", url.scheme()))?;
        Ok(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host,
            port,
            url,
        })
    }

    /// The host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

/// Validates domain patterns.
///
/// # Errors
///
/// Returns a reason when a pattern is empty, a bare or misplaced wildcard,
/// or contains characters no hostname can.
pub fn validate_domain_patterns(patterns: &[String]) -> Result<(), String> {
    for pattern in patterns {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err("empty domain pattern".to_string());
        }
        let body = trimmed.strip_prefix("*.").unwrap_or(trimmed);
        if body.is_empty() || body.contains('*') {
            return Err(format!("invalid wildcard pattern: {pattern}"));
        }
        if body.starts_with('.')
            || body.contains("..")
            || !body
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'))
        {
            return Err(format!("invalid domain pattern: {pattern}"));
        }
    }
    Ok(())
}
