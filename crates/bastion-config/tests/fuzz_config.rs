//! Property-based tests for configuration extraction.
//!
//! Arbitrary input must never panic, and in-range values must always load.

use bastion_config::{BastionConfig, ConfigLoader};
use figment::providers::{Format, Toml};
use figment::Figment;
use proptest::prelude::*;

fn extract(toml: &str) -> Result<BastionConfig, figment::Error> {
    Figment::from(figment::providers::Serialized::defaults(BastionConfig::default()))
        .merge(Toml::string(toml))
        .extract()
}

proptest! {
    /// Arbitrary strings never cause a panic.
    #[test]
    fn no_panic_on_arbitrary_input(input in "\\PC{0,256}") {
        if let Ok(config) = extract(&input) {
            let _ = config.validate();
        }
    }

    /// In-range numeric settings always pass validation.
    #[test]
    fn sane_values_always_validate(
        rate_limit in 0u32..10_000,
        window in 1u64..3600,
        timeout in 1u64..600,
        memory in 1u64..65_536,
    ) {
        let toml = format!(
            "[network]\nrate_limit = {rate_limit}\nrate_window_seconds = {window}\n\
             [limits]\ntimeout_seconds = {timeout}\nmax_memory_mb = {memory}\n"
        );
        let config = extract(&toml).expect("extract");
        prop_assert!(config.validate().is_ok(), "rejected {toml}");
    }

    /// Explicit overrides always win.
    #[test]
    fn overrides_take_precedence(limit in 1u32..1000) {
        let config = ConfigLoader::new()
            .without_env()
            .set("network.rate_limit", limit)
            .load()
            .expect("load");
        prop_assert_eq!(config.network.rate_limit, limit);
    }
}
