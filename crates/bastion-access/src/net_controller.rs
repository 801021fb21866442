//! Network access controller.
//!
//! Checks run in a fixed order and stop at the first denial:
//!
//! 1. denied domain, denied IP literal, denied port
//! 2. protocol and port allow-lists
//! 3. request scope (`allowed_hosts` of an execution)
//! 4. default-deny on the name or literal, before any DNS query
//! 5. DNS resolution, then every resolved address against the IP rules
//! 6. per-host rate limit
//!
//! Only then does the backend see the request, pinned to the addresses that
//! passed step 5. Redirects re-enter the pipeline from step 1.

use std::net::{IpAddr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bastion_types::{AuditLogEntry, AuditOperation, AuditResult, Denial, DenialRule, NetworkPolicy};
use serde::Serialize;
use tokio::net::TcpStream;

use crate::audit::AuditLog;
use crate::error::AccessError;
use crate::net_backend::{BackendError, HttpMethod, HttpRequest, HttpResponse, NetworkBackend, ReqwestBackend};
use crate::network::{first_matching_pattern, is_host_allowed, matches_domain, matching_network, normalize_host, parse_ip, Target};
use crate::rate_limiter::RateLimiter;

/// Headers dropped when a redirect crosses to another origin.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

/// Counters shared by a controller and its scoped children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetStats {
    pub requests: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    bytes: AtomicU64,
}

/// A TCP connection opened through the controller.
#[derive(Debug)]
pub struct ScopedSocket {
    stream: TcpStream,
    host: String,
    peer: SocketAddr,
}

impl ScopedSocket {
    /// Host the caller asked for.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Address actually connected to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Releases the underlying stream.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl Deref for ScopedSocket {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        &self.stream
    }
}

impl DerefMut for ScopedSocket {
    fn deref_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// What is being authorized.
struct Probe<'a> {
    op: AuditOperation,
    target: &'a str,
    protocol: Option<&'a str>,
    host: &'a str,
    port: Option<u16>,
    rate_limited: bool,
}

/// Mediates HTTP, DNS and TCP against a [`NetworkPolicy`].
#[derive(Debug, Clone)]
pub struct NetworkAccessController {
    policy: Arc<NetworkPolicy>,
    audit: Arc<AuditLog>,
    limiter: Arc<RateLimiter>,
    backend: Arc<dyn NetworkBackend>,
    scope: Option<Arc<Vec<String>>>,
    execution_id: Option<String>,
    counters: Arc<Counters>,
}

impl NetworkAccessController {
    /// Creates a controller using the production backend.
    pub fn new(policy: Arc<NetworkPolicy>, audit: Arc<AuditLog>) -> Self {
        Self::with_backend(policy, audit, Arc::new(ReqwestBackend))
    }

    /// Creates a controller with a custom backend.
    pub fn with_backend(
        policy: Arc<NetworkPolicy>,
        audit: Arc<AuditLog>,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_policy(&policy));
        Self {
            policy,
            audit,
            limiter,
            backend,
            scope: None,
            execution_id: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Derives a controller narrowed to `hosts` for one execution.
    ///
    /// The child shares the rate limiter, audit log and counters. A host
    /// must pass both the ambient policy and the scope.
    pub fn scoped(
        &self,
        hosts: impl IntoIterator<Item = impl Into<String>>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            scope: Some(Arc::new(hosts.into_iter().map(Into::into).collect())),
            execution_id: Some(execution_id.into()),
            ..self.clone()
        }
    }

    /// Tags audit entries with `execution_id` without narrowing the policy.
    pub fn with_execution_id(&self, execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            ..self.clone()
        }
    }

    /// The enforced policy.
    pub fn policy(&self) -> &NetworkPolicy {
        &self.policy
    }

    /// The shared audit log.
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Request and byte counters.
    pub fn stats(&self) -> NetStats {
        NetStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            bytes_transferred: self.counters.bytes.load(Ordering::Relaxed),
        }
    }

    /// `GET url`.
    pub async fn get(&self, url: &str) -> Result<HttpResponse, AccessError> {
        self.request(HttpMethod::Get, url, Vec::new(), None).await
    }

    /// `POST url` with `body`.
    pub async fn post(&self, url: &str, body: impl Into<Vec<u8>>) -> Result<HttpResponse, AccessError> {
        self.request(HttpMethod::Post, url, Vec::new(), Some(body.into()))
            .await
    }

    /// `PUT url` with `body`.
    pub async fn put(&self, url: &str, body: impl Into<Vec<u8>>) -> Result<HttpResponse, AccessError> {
        self.request(HttpMethod::Put, url, Vec::new(), Some(body.into()))
            .await
    }

    /// `DELETE url`.
    pub async fn delete(&self, url: &str) -> Result<HttpResponse, AccessError> {
        self.request(HttpMethod::Delete, url, Vec::new(), None).await
    }

    /// Sends a request, following redirects up to `max_redirects` with every
    /// hop re-authorized.
    #[tracing::instrument(skip(self, headers, body), fields(execution_id = self.execution_id.as_deref()))]
    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        mut headers: Vec<(String, String)>,
        mut body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, AccessError> {
        let started = Instant::now();
        let mut method = method;
        let mut target = match Target::parse(url) {
            Ok(t) => t,
            Err(reason) => {
                return Err(self.deny(
                    method.audit_operation(),
                    url,
                    started,
                    Denial::new(DenialRule::InvalidTarget, url, reason),
                ))
            }
        };
        let mut hops = 0u32;
        loop {
            let op = method.audit_operation();
            let target_str = target.url.to_string();
            let resolved = self
                .admit(
                    &Probe {
                        op,
                        target: &target_str,
                        protocol: Some(&target.scheme),
                        host: &target.host,
                        port: Some(target.port),
                        rate_limited: true,
                    },
                    started,
                )
                .await?;
            let sent = body.as_ref().map_or(0, |b| b.len() as u64);
            let request = HttpRequest {
                method,
                url: target.url.clone(),
                headers: headers.clone(),
                body: body.clone(),
                resolved,
                timeout: self.policy.request_timeout(),
                max_response_bytes: self.policy.max_response_size_bytes,
                verify_ssl: self.policy.verify_ssl,
                user_agent: self.policy.user_agent.clone(),
            };
            self.counters.requests.fetch_add(1, Ordering::Relaxed);
            let response = match self.backend.send(request).await {
                Ok(r) => r,
                Err(BackendError::TooLarge { limit }) => {
                    return Err(self.response_too_large(op, &target_str, limit, started));
                }
                Err(BackendError::Transport(reason)) => {
                    return Err(self.network_error(op, &target_str, started, reason));
                }
            };
            self.counters
                .bytes
                .fetch_add(sent + response.size, Ordering::Relaxed);
            self.record(
                op,
                &target_str,
                AuditResult::Allowed,
                started,
                None,
                vec![
                    ("status", response.status_code.into()),
                    ("bytes", response.size.into()),
                    ("redirects", hops.into()),
                ],
            );

            let location = match response.header("location") {
                Some(loc) if response.is_redirect() => loc.to_string(),
                _ => return Ok(response),
            };
            if hops >= self.policy.max_redirects {
                return Err(self.deny(
                    op,
                    &target_str,
                    started,
                    Denial::new(
                        DenialRule::RedirectRefused,
                        &target_str,
                        format!("more than {} redirects", self.policy.max_redirects),
                    ),
                ));
            }
            let next = match target.url.join(&location).map_err(|e| e.to_string()).and_then(Target::from_url) {
                Ok(next) => next,
                Err(reason) => {
                    return Err(self.deny(
                        op,
                        &location,
                        started,
                        Denial::new(DenialRule::RedirectRefused, &location, reason),
                    ))
                }
            };
            hops += 1;
            if response.status_code == 303
                || (matches!(response.status_code, 301 | 302) && method == HttpMethod::Post)
            {
                method = HttpMethod::Get;
                body = None;
            }
            if next.host != target.host || next.port != target.port {
                headers.retain(|(k, _)| {
                    !SENSITIVE_HEADERS.iter().any(|s| k.eq_ignore_ascii_case(s))
                });
            }
            tracing::debug!(from = %target.url, to = %next.url, status = response.status_code, "following redirect");
            target = next;
        }
    }

    /// Resolves `host` after checking it against the policy. Returns the
    /// first address.
    pub async fn dns_lookup(&self, host: &str) -> Result<IpAddr, AccessError> {
        let addrs = self.dns_lookup_all(host).await?;
        addrs.first().copied().ok_or_else(|| AccessError::Network {
            target: host.to_string(),
            reason: "no addresses".into(),
        })
    }

    /// Resolves `host` after checking it against the policy. Requires `dns`
    /// in `allowed_protocols`.
    pub async fn dns_lookup_all(&self, host: &str) -> Result<Vec<IpAddr>, AccessError> {
        let started = Instant::now();
        let host = normalize_host(host);
        let addrs = self
            .admit(
                &Probe {
                    op: AuditOperation::DnsLookup,
                    target: &host,
                    protocol: Some("dns"),
                    host: &host,
                    port: None,
                    rate_limited: false,
                },
                started,
            )
            .await?;
        let ips: Vec<IpAddr> = addrs.iter().map(SocketAddr::ip).collect();
        self.record(
            AuditOperation::DnsLookup,
            &host,
            AuditResult::Allowed,
            started,
            None,
            vec![(
                "addresses",
                ips.iter().map(ToString::to_string).collect::<Vec<_>>().into(),
            )],
        );
        Ok(ips)
    }

    /// Opens a TCP connection. Requires `tcp` in `allowed_protocols`.
    pub async fn open_socket(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<ScopedSocket, AccessError> {
        let started = Instant::now();
        let host = normalize_host(host);
        let target = format!("{host}:{port}");
        let op = AuditOperation::SocketConnect;
        let addrs = self
            .admit(
                &Probe {
                    op,
                    target: &target,
                    protocol: Some("tcp"),
                    host: &host,
                    port: Some(port),
                    rate_limited: true,
                },
                started,
            )
            .await?;
        let stream = match self.backend.connect(&addrs, timeout).await {
            Ok(s) => s,
            Err(e) => return Err(self.network_error(op, &target, started, e.to_string())),
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => return Err(self.network_error(op, &target, started, e.to_string())),
        };
        self.record(
            op,
            &target,
            AuditResult::Allowed,
            started,
            None,
            vec![("peer", peer.to_string().into())],
        );
        Ok(ScopedSocket { stream, host, peer })
    }

    /// Authorizes a connection brokered for a running payload and returns
    /// the addresses to connect to. The caller performs the connect.
    pub async fn authorize(
        &self,
        host: &str,
        port: u16,
        scheme: &str,
    ) -> Result<Vec<SocketAddr>, AccessError> {
        let started = Instant::now();
        let host = normalize_host(host);
        let target = format!("{scheme}://{host}:{port}");
        let op = AuditOperation::ProxyConnect;
        let addrs = self
            .admit(
                &Probe {
                    op,
                    target: &target,
                    protocol: Some(scheme),
                    host: &host,
                    port: Some(port),
                    rate_limited: true,
                },
                started,
            )
            .await?;
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.record(op, &target, AuditResult::Allowed, started, None, Vec::new());
        Ok(addrs)
    }

    /// Adds bytes moved on behalf of this controller (egress proxy tunnels).
    pub fn add_transferred(&self, bytes: u64) {
        self.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a response cut off at `limit` bytes as RESTRICTED and returns
    /// the matching violation.
    pub fn response_too_large(
        &self,
        op: AuditOperation,
        target: &str,
        limit: u64,
        started: Instant,
    ) -> AccessError {
        let denial = Denial::new(DenialRule::ResponseTooLarge, target, format!("limit {limit} bytes"));
        tracing::info!(target, limit, "response cut off at size limit");
        self.record(
            op,
            target,
            AuditResult::Restricted,
            started,
            Some(denial.to_string()),
            vec![("rule", denial.rule.as_str().into())],
        );
        AccessError::PolicyViolation(denial)
    }

    /// Validates a URL against the DNS-free part of the policy. No network
    /// I/O and no rate-limit slot is consumed.
    pub fn check_url(&self, url: &str) -> Result<(), AccessError> {
        let started = Instant::now();
        let op = AuditOperation::Check;
        let target = Target::parse(url).map_err(|reason| {
            self.deny(op, url, started, Denial::new(DenialRule::InvalidTarget, url, reason))
        })?;
        let probe = Probe {
            op,
            target: url,
            protocol: Some(&target.scheme),
            host: &target.host,
            port: Some(target.port),
            rate_limited: false,
        };
        if let Err(denial) = self.check_static(&probe) {
            return Err(self.deny(op, url, started, denial));
        }
        self.record(op, url, AuditResult::Allowed, started, None, Vec::new());
        Ok(())
    }

    /// Runs every check for `probe` and resolves it. Denials and DNS
    /// failures are audited here.
    async fn admit(&self, probe: &Probe<'_>, started: Instant) -> Result<Vec<SocketAddr>, AccessError> {
        if let Err(denial) = self.check_static(probe) {
            return Err(self.deny(probe.op, probe.target, started, denial));
        }
        let port = probe.port.unwrap_or(0);
        let addrs = match parse_ip(probe.host) {
            Some(ip) => vec![SocketAddr::new(ip, port)],
            None => match self.backend.resolve(probe.host, port).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    return Err(self.network_error(
                        probe.op,
                        probe.target,
                        started,
                        format!("dns resolution failed: {e}"),
                    ))
                }
            },
        };
        if let Err(denial) = self.check_resolved(probe.host, &addrs) {
            return Err(self.deny(probe.op, probe.target, started, denial));
        }
        if probe.rate_limited {
            if let Err(retry_after) = self.limiter.acquire(probe.host).await {
                let denial = Denial::new(
                    DenialRule::RateLimited,
                    probe.host,
                    format!(
                        "{} requests per {}s, retry in {}ms",
                        self.policy.rate_limit,
                        self.policy.rate_window_seconds,
                        retry_after.as_millis()
                    ),
                );
                return Err(self.deny(probe.op, probe.target, started, denial));
            }
        }
        Ok(addrs)
    }

    fn check_static(&self, probe: &Probe<'_>) -> Result<(), Denial> {
        let policy = &self.policy;
        let host = probe.host;
        let literal = parse_ip(host);
        if literal.is_none() {
            if let Some(pattern) = first_matching_pattern(host, &policy.denied_domains) {
                return Err(Denial::new(
                    DenialRule::DeniedDomain,
                    host,
                    format!("matches {pattern}"),
                ));
            }
        }
        if let Some(ip) = literal {
            if let Some(net) = matching_network(ip, &policy.denied_ips) {
                return Err(Denial::new(DenialRule::DeniedIp, host, format!("in {net}")));
            }
        }
        if let Some(port) = probe.port {
            if policy.denied_ports.contains(&port) {
                return Err(Denial::new(DenialRule::DeniedPort, host, format!("port {port}")));
            }
        }
        if let Some(protocol) = probe.protocol {
            if !policy.allowed_protocols.contains(protocol) {
                return Err(Denial::new(
                    DenialRule::ProtocolNotAllowed,
                    host,
                    format!("protocol {protocol}"),
                ));
            }
        }
        if let Some(port) = probe.port {
            if !policy.allowed_ports.is_empty() && !policy.allowed_ports.contains(&port) {
                return Err(Denial::new(
                    DenialRule::PortNotAllowed,
                    host,
                    format!("port {port}"),
                ));
            }
        }
        if let Some(scope) = &self.scope {
            let in_scope = scope
                .iter()
                .any(|p| matches_domain(host, p) || normalize_host(p) == host);
            if !in_scope {
                return Err(Denial::new(
                    DenialRule::HostNotInRequest,
                    host,
                    "not in the execution's allowed hosts",
                ));
            }
        }
        if policy.default_deny {
            match literal {
                Some(ip) => {
                    if matching_network(ip, &policy.allowed_ips).is_none() {
                        return Err(Denial::new(DenialRule::IpNotAllowed, host, ""));
                    }
                }
                None => {
                    if !is_host_allowed(host, &policy.allowed_domains)
                        && policy.allowed_ips.is_empty()
                    {
                        return Err(Denial::new(DenialRule::DomainNotAllowed, host, ""));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_resolved(&self, host: &str, addrs: &[SocketAddr]) -> Result<(), Denial> {
        let policy = &self.policy;
        for addr in addrs {
            if let Some(net) = matching_network(addr.ip(), &policy.denied_ips) {
                return Err(Denial::new(
                    DenialRule::DeniedIp,
                    host,
                    format!("resolves to {} in {net}", addr.ip()),
                ));
            }
        }
        let name_allowed = parse_ip(host).is_some() || is_host_allowed(host, &policy.allowed_domains);
        if policy.default_deny && !name_allowed {
            if let Some(addr) = addrs
                .iter()
                .find(|a| matching_network(a.ip(), &policy.allowed_ips).is_none())
            {
                return Err(Denial::new(
                    DenialRule::IpNotAllowed,
                    host,
                    format!("resolves to {}", addr.ip()),
                ));
            }
        }
        Ok(())
    }

    fn deny(&self, op: AuditOperation, target: &str, started: Instant, denial: Denial) -> AccessError {
        tracing::debug!(rule = %denial.rule, target = %denial.target, "network access denied");
        self.record(
            op,
            target,
            AuditResult::Denied,
            started,
            Some(denial.to_string()),
            vec![("rule", denial.rule.as_str().into())],
        );
        AccessError::PolicyViolation(denial)
    }

    fn network_error(&self, op: AuditOperation, target: &str, started: Instant, reason: String) -> AccessError {
        self.record(
            op,
            target,
            AuditResult::Error,
            started,
            Some(reason.clone()),
            Vec::new(),
        );
        AccessError::Network {
            target: target.to_string(),
            reason,
        }
    }

    fn record(
        &self,
        op: AuditOperation,
        target: &str,
        result: AuditResult,
        started: Instant,
        error: Option<String>,
        metadata: Vec<(&'static str, serde_json::Value)>,
    ) {
        if !self.policy.audit_enabled {
            return;
        }
        let mut entry = AuditLogEntry::new(op, target, result)
            .with_duration_ms(started.elapsed().as_millis() as u64)
            .with_execution_id(self.execution_id.clone());
        if let Some(message) = error {
            entry = entry.with_error(message);
        }
        for (key, value) in metadata {
            entry = entry.with_metadata(key, value);
        }
        self.audit.record(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(policy: NetworkPolicy) -> NetworkAccessController {
        NetworkAccessController::new(Arc::new(policy), AuditLog::new_shared())
    }

    fn probe<'a>(host: &'a str, port: u16, protocol: &'a str) -> Probe<'a> {
        Probe {
            op: AuditOperation::Check,
            target: host,
            protocol: Some(protocol),
            host,
            port: Some(port),
            rate_limited: false,
        }
    }

    fn rule(result: Result<(), Denial>) -> Option<DenialRule> {
        result.err().map(|d| d.rule)
    }

    #[test]
    fn static_checks_order() {
        let ctl = controller(NetworkPolicy {
            allowed_domains: vec!["*.example.com".into()],
            denied_domains: vec!["bad.example.com".into()],
            denied_ports: [8443].into_iter().collect(),
            ..NetworkPolicy::default()
        });
        assert_eq!(rule(ctl.check_static(&probe("bad.example.com", 443, "https"))), Some(DenialRule::DeniedDomain));
        assert_eq!(rule(ctl.check_static(&probe("a.example.com", 8443, "https"))), Some(DenialRule::DeniedPort));
        assert_eq!(rule(ctl.check_static(&probe("a.example.com", 443, "ftp"))), Some(DenialRule::ProtocolNotAllowed));
        assert_eq!(rule(ctl.check_static(&probe("a.example.com", 8080, "http"))), Some(DenialRule::PortNotAllowed));
        assert_eq!(rule(ctl.check_static(&probe("example.com", 443, "https"))), Some(DenialRule::DomainNotAllowed));
        assert_eq!(rule(ctl.check_static(&probe("127.0.0.1", 443, "https"))), Some(DenialRule::DeniedIp));
        assert_eq!(rule(ctl.check_static(&probe("8.8.8.8", 443, "https"))), Some(DenialRule::IpNotAllowed));
        assert!(ctl.check_static(&probe("a.example.com", 443, "https")).is_ok());
    }

    #[test]
    fn scope_narrows_policy() {
        let ctl = controller(NetworkPolicy {
            allowed_domains: vec!["*.example.com".into()],
            ..NetworkPolicy::default()
        })
        .scoped(["api.example.com"], "exec-1");
        assert!(ctl.check_static(&probe("api.example.com", 443, "https")).is_ok());
        assert_eq!(rule(ctl.check_static(&probe("cdn.example.com", 443, "https"))), Some(DenialRule::HostNotInRequest));
    }

    #[test]
    fn scope_never_widens() {
        let ctl = controller(NetworkPolicy::default()).scoped(["api.github.com"], "exec-2");
        assert_eq!(rule(ctl.check_static(&probe("api.github.com", 443, "https"))), Some(DenialRule::DomainNotAllowed));
    }

    #[test]
    fn resolved_private_address_is_denied() {
        let ctl = controller(NetworkPolicy {
            allowed_domains: vec!["internal.example.com".into()],
            ..NetworkPolicy::default()
        });
        let addrs = vec!["10.1.2.3:443".parse().expect("addr")];
        let denial = ctl.check_resolved("internal.example.com", &addrs).expect_err("private");
        assert_eq!(denial.rule, DenialRule::DeniedIp);
    }

    #[test]
    fn check_url_is_audited() {
        let ctl = controller(NetworkPolicy::default());
        assert!(ctl.check_url("https://api.github.com/").is_err());
        let last = ctl.audit_log().last().expect("entry");
        assert_eq!(last.result, AuditResult::Denied);
        assert_eq!(last.operation, AuditOperation::Check);
    }
}
