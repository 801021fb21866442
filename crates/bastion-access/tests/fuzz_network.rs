//! Property-based tests for host matching and default-deny.
//!
//! Generates hostnames outside the allow-list and checks that no request
//! for them gets as far as DNS or a connection.

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;

use bastion_access::{matches_domain, AuditLog, NetworkAccessController};
use bastion_types::NetworkPolicy;
use common::ScriptedBackend;
use proptest::prelude::*;

fn label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,10}[a-z0-9]"
}

fn hostname() -> impl Strategy<Value = String> {
    prop::collection::vec(label(), 1..4).prop_map(|labels| format!("{}.test", labels.join(".")))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    /// Unlisted hosts are denied with no resolution and nothing sent.
    #[test]
    fn unlisted_hosts_never_reach_the_network(host in hostname(), path in "[a-z/]{0,16}") {
        let backend = Arc::new(ScriptedBackend::public());
        let policy = NetworkPolicy {
            allowed_domains: vec!["api.github.com".into(), "*.pypi.org".into()],
            ..NetworkPolicy::default()
        };
        let ctl = NetworkAccessController::with_backend(Arc::new(policy), AuditLog::new_shared(), backend.clone());
        let url = format!("https://{host}/{path}");
        let result = runtime().block_on(ctl.get(&url));
        prop_assert!(result.is_err(), "allowed {url}");
        prop_assert!(result.err().is_some_and(|e| e.is_policy_violation()));
        prop_assert_eq!(backend.resolves(), 0);
        prop_assert_eq!(backend.connects(), 0);
        prop_assert!(backend.sent().is_empty());
    }

    /// A wildcard matches any strict subdomain.
    #[test]
    fn wildcard_matches_subdomains(sub in label(), base in hostname()) {
        let pattern = format!("*.{base}");
        let sub_host = format!("{sub}.{base}");
        prop_assert!(matches_domain(&sub_host, &pattern));
        prop_assert!(!matches_domain(&base, &pattern));
    }

    /// A wildcard never matches a host that merely ends with the suffix text.
    #[test]
    fn wildcard_respects_label_boundaries(prefix in "[a-z]{1,8}", base in hostname()) {
        let pattern = format!("*.{base}");
        let glued = format!("{prefix}{base}");
        prop_assert!(!matches_domain(&glued, &pattern));
    }

    /// IP literals never match domain patterns.
    #[test]
    fn ip_literals_never_match_patterns(a: u8, b: u8, c: u8, d: u8) {
        let ip = Ipv4Addr::new(a, b, c, d).to_string();
        prop_assert!(!matches_domain(&ip, "*"));
        prop_assert!(!matches_domain(&ip, &ip));
        let pattern = format!("*.{b}.{c}.{d}");
        prop_assert!(!matches_domain(&ip, &pattern));
    }
}
