//! Property-based tests for the egress proxy's request-head parsing.
//!
//! Arbitrary client bytes must never panic the parser, and well-formed
//! heads must survive parsing with method and target intact.

use bastion_runtime::proxy::{parse_head, split_authority};
use proptest::prelude::*;

fn token() -> impl Strategy<Value = String> {
    "[A-Za-z0-9._~/-]{1,24}"
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(raw in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = parse_head(&raw);
    }

    #[test]
    fn well_formed_heads_parse(
        method in "[A-Z]{3,7}",
        target in token(),
        headers in prop::collection::vec(("[A-Za-z-]{1,16}", "[a-zA-Z0-9 ;=/]{0,32}"), 0..6),
    ) {
        let mut raw = format!("{method} {target} HTTP/1.1\r\n");
        for (name, value) in &headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        let head = parse_head(raw.as_bytes()).expect("well-formed head");
        prop_assert_eq!(head.method, method);
        prop_assert_eq!(head.target, target);
        prop_assert_eq!(head.headers.len(), headers.len());
    }

    #[test]
    fn authorities_round_trip(host in "[a-z][a-z0-9.-]{0,30}", port in any::<u16>()) {
        let parsed = split_authority(&format!("{host}:{port}"));
        prop_assert_eq!(parsed, Some((host, port)));
    }

    #[test]
    fn authority_without_port_is_rejected(host in "[a-z][a-z0-9.-]{0,30}") {
        prop_assert_eq!(split_authority(&host), None);
    }
}
