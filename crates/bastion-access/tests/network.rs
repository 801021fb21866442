//! Integration tests for `NetworkAccessController` against a scripted
//! transport.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bastion_access::{AccessError, AuditLog, BackendError, HttpMethod, NetworkAccessController};
use bastion_types::{AuditOperation, AuditResult, DenialRule, NetworkPolicy, RateLimitMode};
use common::{ok, redirect, response, ScriptedBackend};

fn policy(domains: &[&str]) -> NetworkPolicy {
    NetworkPolicy {
        allowed_domains: domains.iter().map(|d| d.to_string()).collect(),
        ..NetworkPolicy::default()
    }
}

fn setup(policy: NetworkPolicy, backend: ScriptedBackend) -> (Arc<ScriptedBackend>, NetworkAccessController) {
    let backend = Arc::new(backend);
    let ctl = NetworkAccessController::with_backend(Arc::new(policy), AuditLog::new_shared(), backend.clone());
    (backend, ctl)
}

fn rule_of(err: &AccessError) -> Option<DenialRule> {
    err.denial().map(|d| d.rule)
}

// ---------------------------------------------------------------------------
// Default deny
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unlisted_host_is_denied_before_dns() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    let err = ctl.get("https://evil.example/").await.expect_err("denied");
    assert_eq!(rule_of(&err), Some(DenialRule::DomainNotAllowed));
    assert_eq!(backend.resolves(), 0);
    assert!(backend.sent().is_empty());

    let last = ctl.audit_log().last().expect("audited");
    assert_eq!(last.result, AuditResult::Denied);
    assert_eq!(last.operation, AuditOperation::HttpGet);
    assert_eq!(last.target, "https://evil.example/");
}

#[tokio::test]
async fn allowed_host_is_fetched_with_pinned_addresses() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    backend.push_response(Ok(ok("{\"ok\":true}")));
    let resp = ctl.get("https://api.github.com/repos").await.expect("fetch");
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.text(), "{\"ok\":true}");

    let sent = backend.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, HttpMethod::Get);
    assert_eq!(sent[0].resolved, vec!["93.184.216.34:443".parse().expect("addr")]);

    let last = ctl.audit_log().last().expect("audited");
    assert_eq!(last.result, AuditResult::Allowed);
    assert_eq!(last.metadata.get("status"), Some(&serde_json::json!(200)));
    assert_eq!(ctl.stats().requests, 1);
}

#[tokio::test]
async fn wildcard_allows_subdomains_only() {
    let (backend, ctl) = setup(policy(&["*.example.com"]), ScriptedBackend::public());
    assert!(ctl.get("https://cdn.example.com/a.js").await.is_ok());
    let err = ctl.get("https://example.com/").await.expect_err("apex");
    assert_eq!(rule_of(&err), Some(DenialRule::DomainNotAllowed));
    assert_eq!(backend.resolves(), 1);
}

#[tokio::test]
async fn private_resolution_is_denied() {
    let backend = ScriptedBackend {
        addrs: vec!["169.254.169.254:80".parse().expect("addr")],
        ..ScriptedBackend::default()
    };
    let (backend, ctl) = setup(policy(&["metadata.example.com"]), backend);
    let err = ctl.get("http://metadata.example.com/latest").await.expect_err("rebind");
    assert_eq!(rule_of(&err), Some(DenialRule::DeniedIp));
    assert!(backend.sent().is_empty());
}

#[tokio::test]
async fn literal_ips_need_an_allowed_network() {
    let mut p = policy(&[]);
    let (_, ctl) = setup(p.clone(), ScriptedBackend::public());
    let err = ctl.get("https://93.184.216.34/").await.expect_err("no cidr");
    assert_eq!(rule_of(&err), Some(DenialRule::IpNotAllowed));

    p.allowed_ips = vec!["93.184.216.0/24".parse().expect("cidr")];
    let (backend, ctl) = setup(p, ScriptedBackend::public());
    ctl.get("https://93.184.216.34/").await.expect("allowed");
    assert_eq!(backend.resolves(), 0);
}

#[tokio::test]
async fn dns_failure_is_an_audited_error() {
    let backend = ScriptedBackend {
        dns_fails: true,
        ..ScriptedBackend::public()
    };
    let (_, ctl) = setup(policy(&["api.github.com"]), backend);
    let err = ctl.get("https://api.github.com/").await.expect_err("dns");
    assert!(matches!(err, AccessError::Network { .. }));
    assert_eq!(ctl.audit_log().last().map(|e| e.result), Some(AuditResult::Error));
}

#[tokio::test]
async fn invalid_url_is_denied() {
    let (_, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    let err = ctl.get("not a url").await.expect_err("invalid");
    assert_eq!(rule_of(&err), Some(DenialRule::InvalidTarget));
}

// ---------------------------------------------------------------------------
// Redirects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redirect_to_denied_host_is_refused() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    backend.push_response(Ok(redirect(302, "https://evil.example/steal")));
    let err = ctl.get("https://api.github.com/start").await.expect_err("hop denied");
    assert_eq!(rule_of(&err), Some(DenialRule::DomainNotAllowed));
    assert_eq!(backend.sent().len(), 1);

    let entries = ctl.audit_log().entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].result, AuditResult::Allowed);
    assert_eq!(entries[1].result, AuditResult::Denied);
    assert_eq!(entries[1].target, "https://evil.example/steal");
}

#[tokio::test]
async fn redirects_are_capped() {
    let p = NetworkPolicy {
        max_redirects: 2,
        ..policy(&["api.github.com"])
    };
    let (backend, ctl) = setup(p, ScriptedBackend::public());
    for _ in 0..3 {
        backend.push_response(Ok(redirect(301, "/again")));
    }
    let err = ctl.get("https://api.github.com/").await.expect_err("loop");
    assert_eq!(rule_of(&err), Some(DenialRule::RedirectRefused));
    assert_eq!(backend.sent().len(), 3);
}

#[tokio::test]
async fn see_other_turns_post_into_get() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    backend.push_response(Ok(redirect(303, "/result")));
    backend.push_response(Ok(ok("done")));
    let resp = ctl.post("https://api.github.com/submit", b"payload".to_vec()).await.expect("post");
    assert_eq!(resp.url, "https://api.github.com/result");

    let sent = backend.sent();
    assert_eq!(sent[0].method, HttpMethod::Post);
    assert_eq!(sent[1].method, HttpMethod::Get);
    assert!(sent[1].body.is_none());
}

#[tokio::test]
async fn temporary_redirect_keeps_method_and_body() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    backend.push_response(Ok(redirect(307, "/v2/submit")));
    ctl.put("https://api.github.com/submit", b"data".to_vec()).await.expect("put");
    let sent = backend.sent();
    assert_eq!(sent[1].method, HttpMethod::Put);
    assert_eq!(sent[1].body.as_deref(), Some(&b"data"[..]));
}

#[tokio::test]
async fn cross_origin_redirect_strips_credentials() {
    let (backend, ctl) = setup(
        policy(&["api.github.com", "objects.githubusercontent.com"]),
        ScriptedBackend::public(),
    );
    backend.push_response(Ok(redirect(302, "https://objects.githubusercontent.com/blob")));
    let headers = vec![
        ("Authorization".to_string(), "Bearer secret".to_string()),
        ("Accept".to_string(), "application/json".to_string()),
    ];
    ctl.request(HttpMethod::Get, "https://api.github.com/download", headers, None)
        .await
        .expect("fetch");
    let sent = backend.sent();
    assert!(sent[0].headers.iter().any(|(k, _)| k == "Authorization"));
    assert_eq!(sent[1].headers, vec![("Accept".to_string(), "application/json".to_string())]);
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_rejects_past_the_window() {
    let p = NetworkPolicy {
        rate_limit: 3,
        ..policy(&["api.github.com", "example.org"])
    };
    let (_, ctl) = setup(p, ScriptedBackend::public());
    for _ in 0..3 {
        ctl.get("https://api.github.com/").await.expect("within limit");
    }
    let err = ctl.get("https://api.github.com/").await.expect_err("limited");
    assert_eq!(rule_of(&err), Some(DenialRule::RateLimited));
    ctl.get("https://example.org/").await.expect("other host");
}

#[tokio::test]
async fn rate_limit_wait_mode_blocks_until_the_window_slides() {
    let p = NetworkPolicy {
        rate_limit: 1,
        rate_window_seconds: 1,
        rate_limit_mode: RateLimitMode::Wait,
        ..policy(&["api.github.com"])
    };
    let (_, ctl) = setup(p, ScriptedBackend::public());
    let started = Instant::now();
    ctl.get("https://api.github.com/").await.expect("first");
    ctl.get("https://api.github.com/").await.expect("second waits");
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn oversized_response_is_restricted() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    backend.push_response(Err(BackendError::TooLarge { limit: 16 }));
    let err = ctl.get("https://api.github.com/huge").await.expect_err("too large");
    assert_eq!(rule_of(&err), Some(DenialRule::ResponseTooLarge));
    assert_eq!(ctl.audit_log().last().map(|e| e.result), Some(AuditResult::Restricted));
}

#[tokio::test]
async fn transport_failure_is_a_network_error() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    backend.push_response(Err(BackendError::Transport("connection reset".into())));
    let err = ctl.get("https://api.github.com/").await.expect_err("reset");
    assert!(matches!(err, AccessError::Network { ref reason, .. } if reason.contains("reset")));
}

#[tokio::test]
async fn bytes_are_counted() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    backend.push_response(Ok(response(201, Vec::new(), "created")));
    ctl.post("https://api.github.com/", b"abc".to_vec()).await.expect("post");
    assert_eq!(ctl.stats().bytes_transferred, 3 + 7);
}

// ---------------------------------------------------------------------------
// Scoping, DNS, sockets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scoped_controller_shares_audit_and_narrows_hosts() {
    let (_, parent) = setup(policy(&["api.github.com", "pypi.org"]), ScriptedBackend::public());
    let child = parent.scoped(["pypi.org"], "exec-42");
    child.get("https://pypi.org/simple/").await.expect("in scope");
    let err = child.get("https://api.github.com/").await.expect_err("out of scope");
    assert_eq!(rule_of(&err), Some(DenialRule::HostNotInRequest));

    let entries = parent.audit_log().for_execution("exec-42");
    assert_eq!(entries.len(), 2);
    assert_eq!(parent.stats().requests, 1);
}

#[tokio::test]
async fn dns_lookup_checks_policy_first() {
    let (backend, ctl) = setup(policy(&["api.github.com"]), ScriptedBackend::public());
    let ip = ctl.dns_lookup("API.GitHub.com.").await.expect("lookup");
    assert_eq!(ip, "93.184.216.34".parse::<std::net::IpAddr>().expect("ip"));
    assert!(ctl.dns_lookup("evil.example").await.is_err());
    assert_eq!(backend.resolves(), 1);
    assert_eq!(ctl.audit_log().filter_by_operation(AuditOperation::DnsLookup).len(), 2);
}

#[tokio::test]
async fn dns_lookup_requires_dns_protocol() {
    let mut p = policy(&["api.github.com"]);
    p.allowed_protocols.remove("dns");
    let (backend, ctl) = setup(p, ScriptedBackend::public());
    let err = ctl.dns_lookup("api.github.com").await.expect_err("no dns");
    assert_eq!(rule_of(&err), Some(DenialRule::ProtocolNotAllowed));
    assert_eq!(backend.resolves(), 0);
    let last = ctl.audit_log().last().expect("audited");
    assert_eq!(last.operation, AuditOperation::DnsLookup);
    assert_eq!(last.result, AuditResult::Denied);
}

#[tokio::test]
async fn sockets_require_tcp_protocol() {
    let (backend, ctl) = setup(policy(&["db.example.com"]), ScriptedBackend::public());
    let err = ctl
        .open_socket("db.example.com", 443, Duration::from_secs(1))
        .await
        .expect_err("no tcp");
    assert_eq!(rule_of(&err), Some(DenialRule::ProtocolNotAllowed));
    assert_eq!(backend.connects(), 0);

    let mut p = policy(&["db.example.com"]);
    p.allowed_protocols.insert("tcp".into());
    p.allowed_ports.insert(5432);
    let (backend, ctl) = setup(p, ScriptedBackend::public());
    let err = ctl
        .open_socket("db.example.com", 5432, Duration::from_secs(1))
        .await
        .expect_err("scripted refusal");
    assert!(matches!(err, AccessError::Network { .. }));
    assert_eq!(backend.connects(), 1);
}

#[tokio::test]
async fn authorize_returns_checked_addresses() {
    let (_, ctl) = setup(policy(&["pypi.org"]), ScriptedBackend::public());
    let addrs = ctl.authorize("pypi.org", 443, "https").await.expect("authorized");
    assert_eq!(addrs, vec!["93.184.216.34:443".parse().expect("addr")]);
    let last = ctl.audit_log().last().expect("audited");
    assert_eq!(last.operation, AuditOperation::ProxyConnect);

    let err = ctl.authorize("pypi.org", 22, "https").await.expect_err("port");
    assert_eq!(rule_of(&err), Some(DenialRule::PortNotAllowed));
}
