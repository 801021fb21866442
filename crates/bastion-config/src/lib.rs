//! # bastion-config
//!
//! Configuration management for bastion.
//! Supports layered config: defaults -> file -> env vars -> explicit overrides.
//! Validated once at load time and converted into immutable policies.

pub mod loader;
pub mod schema;

pub use loader::{load_config, ConfigError, ConfigLoader, ENV_PREFIX};
pub use schema::{
    parse_networks, BastionConfig, FilesystemConfig, LimitsConfig, LogFormat, LoggingConfig,
    NetworkConfig, SandboxConfig, SessionPolicy,
};
