//! Configuration schema types.
//!
//! Every section rejects unknown keys. Missing keys take the defaults of
//! the matching policy type in `bastion-types`.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;

use bastion_types::{
    default_denied_networks, FilesystemPolicy, IsolationPreference, NetworkPolicy, RateLimitMode,
    ResourceLimits, SandboxSettings,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::loader::ConfigError;

/// Top-level bastion configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BastionConfig {
    /// Filesystem access policy.
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    /// Network access policy.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Resource ceilings for executions.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Isolation and runtime settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The immutable values a session is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
    pub limits: ResourceLimits,
    pub sandbox: SandboxSettings,
}

impl BastionConfig {
    /// Checks the whole configuration once.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_policies().map(|_| ())
    }

    /// Validates and converts into policy values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for malformed CIDRs, domain patterns,
    /// zero limits or unknown protocols.
    pub fn to_policies(&self) -> Result<SessionPolicy, ConfigError> {
        let filesystem = self.filesystem.to_policy();
        bastion_access::validate_filesystem_policy(&filesystem)
            .map_err(|e| ConfigError::invalid("filesystem", e))?;
        let network = self.network.to_policy()?;
        bastion_access::validate_network_policy(&network)
            .map_err(|e| ConfigError::invalid("network", e))?;
        let limits = self.limits.to_limits()?;
        let sandbox = self.sandbox.to_settings()?;
        Ok(SessionPolicy {
            filesystem,
            network,
            limits,
            sandbox,
        })
    }
}

// ---------------------------------------------------------------------------
// [filesystem]
// ---------------------------------------------------------------------------

/// `[filesystem]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesystemConfig {
    #[serde(alias = "restrict_to_repo")]
    pub restrict_to_root: bool,
    #[serde(alias = "repo_path")]
    pub repo_root: PathBuf,
    pub allowed_paths: Vec<PathBuf>,
    pub denied_paths: Vec<PathBuf>,
    pub allowed_extensions: BTreeSet<String>,
    pub denied_extensions: BTreeSet<String>,
    pub max_file_size_bytes: u64,
    pub max_files_created: u64,
    pub temp_dir_access: bool,
    pub system_access: bool,
    pub audit_enabled: bool,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        let p = FilesystemPolicy::default();
        Self {
            restrict_to_root: p.restrict_to_root,
            repo_root: p.repo_root,
            allowed_paths: p.allowed_paths,
            denied_paths: p.denied_paths,
            allowed_extensions: p.allowed_extensions,
            denied_extensions: p.denied_extensions,
            max_file_size_bytes: p.max_file_size_bytes,
            max_files_created: p.max_files_created,
            temp_dir_access: p.temp_dir_access,
            system_access: p.system_access,
            audit_enabled: p.audit_enabled,
        }
    }
}

impl FilesystemConfig {
    /// Builds the policy. Extensions are stored lowercase without the dot.
    pub fn to_policy(&self) -> FilesystemPolicy {
        FilesystemPolicy {
            restrict_to_root: self.restrict_to_root,
            repo_root: self.repo_root.clone(),
            allowed_paths: self.allowed_paths.clone(),
            denied_paths: self.denied_paths.clone(),
            allowed_extensions: normalize_extensions(&self.allowed_extensions),
            denied_extensions: normalize_extensions(&self.denied_extensions),
            max_file_size_bytes: self.max_file_size_bytes,
            max_files_created: self.max_files_created,
            temp_dir_access: self.temp_dir_access,
            system_access: self.system_access,
            audit_enabled: self.audit_enabled,
        }
    }
}

fn normalize_extensions(exts: &BTreeSet<String>) -> BTreeSet<String> {
    exts.iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// [network]
// ---------------------------------------------------------------------------

/// `[network]` section. IP entries accept CIDR notation or bare addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub default_deny: bool,
    pub allowed_domains: Vec<String>,
    pub denied_domains: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub denied_ips: Vec<String>,
    pub allowed_ports: BTreeSet<u16>,
    pub denied_ports: BTreeSet<u16>,
    pub allowed_protocols: BTreeSet<String>,
    #[serde(alias = "timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(alias = "max_response_size")]
    pub max_response_size_bytes: u64,
    pub max_redirects: u32,
    pub verify_ssl: bool,
    pub rate_limit: u32,
    pub rate_window_seconds: u64,
    pub rate_limit_mode: RateLimitMode,
    pub user_agent: String,
    pub audit_enabled: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let p = NetworkPolicy::default();
        Self {
            default_deny: p.default_deny,
            allowed_domains: p.allowed_domains,
            denied_domains: p.denied_domains,
            allowed_ips: Vec::new(),
            denied_ips: default_denied_networks()
                .iter()
                .map(ToString::to_string)
                .collect(),
            allowed_ports: p.allowed_ports,
            denied_ports: p.denied_ports,
            allowed_protocols: p.allowed_protocols,
            request_timeout_seconds: p.request_timeout_seconds,
            max_response_size_bytes: p.max_response_size_bytes,
            max_redirects: p.max_redirects,
            verify_ssl: p.verify_ssl,
            rate_limit: p.rate_limit,
            rate_window_seconds: p.rate_window_seconds,
            rate_limit_mode: p.rate_limit_mode,
            user_agent: p.user_agent,
            audit_enabled: p.audit_enabled,
        }
    }
}

impl NetworkConfig {
    /// Builds the policy, parsing every IP entry.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an entry that is neither a CIDR
    /// nor an address.
    pub fn to_policy(&self) -> Result<NetworkPolicy, ConfigError> {
        Ok(NetworkPolicy {
            default_deny: self.default_deny,
            allowed_domains: self.allowed_domains.clone(),
            denied_domains: self.denied_domains.clone(),
            allowed_ips: parse_networks("network.allowed_ips", &self.allowed_ips)?,
            denied_ips: parse_networks("network.denied_ips", &self.denied_ips)?,
            allowed_ports: self.allowed_ports.clone(),
            denied_ports: self.denied_ports.clone(),
            allowed_protocols: self
                .allowed_protocols
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            request_timeout_seconds: self.request_timeout_seconds,
            max_response_size_bytes: self.max_response_size_bytes,
            max_redirects: self.max_redirects,
            verify_ssl: self.verify_ssl,
            rate_limit: self.rate_limit,
            rate_window_seconds: self.rate_window_seconds,
            rate_limit_mode: self.rate_limit_mode,
            user_agent: self.user_agent.clone(),
            audit_enabled: self.audit_enabled,
        })
    }
}

/// Parses CIDR strings; a bare address becomes a single-host network.
pub fn parse_networks(key: &str, entries: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    entries
        .iter()
        .map(|raw| {
            let s = raw.trim();
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("'{raw}' is not a CIDR or IP address"),
                })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// [limits]
// ---------------------------------------------------------------------------

/// `[limits]` section: the ceilings a request may not exceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub timeout_seconds: u64,
    pub max_memory_mb: u64,
    pub max_cpu_percent: u32,
    pub max_output_bytes: u64,
    pub max_processes: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let l = ResourceLimits::default();
        Self {
            timeout_seconds: l.timeout_seconds,
            max_memory_mb: l.max_memory_mb,
            max_cpu_percent: l.max_cpu_percent,
            max_output_bytes: l.max_output_bytes,
            max_processes: l.max_processes,
        }
    }
}

impl LimitsConfig {
    fn to_limits(&self) -> Result<ResourceLimits, ConfigError> {
        for (key, value) in [
            ("limits.timeout_seconds", self.timeout_seconds),
            ("limits.max_memory_mb", self.max_memory_mb),
            ("limits.max_output_bytes", self.max_output_bytes),
            ("limits.max_processes", u64::from(self.max_processes)),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.into(),
                    reason: "must be greater than 0".into(),
                });
            }
        }
        Ok(ResourceLimits {
            timeout_seconds: self.timeout_seconds,
            max_memory_mb: self.max_memory_mb,
            max_cpu_percent: self.max_cpu_percent,
            max_output_bytes: self.max_output_bytes,
            max_processes: self.max_processes,
        })
    }
}

// ---------------------------------------------------------------------------
// [sandbox]
// ---------------------------------------------------------------------------

/// `[sandbox]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub isolation: IsolationPreference,
    pub container_runtime: String,
    pub python_image: String,
    pub node_image: String,
    pub shell_image: String,
    pub ruby_image: String,
    pub work_root: Option<PathBuf>,
    pub sample_interval_ms: u64,
    pub cpu_grace_samples: u32,
    pub install_timeout_seconds: u64,
    pub max_concurrent: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let s = SandboxSettings::default();
        Self {
            isolation: s.isolation,
            container_runtime: s.container_runtime,
            python_image: s.python_image,
            node_image: s.node_image,
            shell_image: s.shell_image,
            ruby_image: s.ruby_image,
            work_root: s.work_root,
            sample_interval_ms: s.sample_interval_ms,
            cpu_grace_samples: s.cpu_grace_samples,
            install_timeout_seconds: s.install_timeout_seconds,
            max_concurrent: s.max_concurrent,
        }
    }
}

impl SandboxConfig {
    fn to_settings(&self) -> Result<SandboxSettings, ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "sandbox.max_concurrent".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.container_runtime.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "sandbox.container_runtime".into(),
                reason: "must name a runtime binary".into(),
            });
        }
        Ok(SandboxSettings {
            isolation: self.isolation,
            container_runtime: self.container_runtime.clone(),
            python_image: self.python_image.clone(),
            node_image: self.node_image.clone(),
            shell_image: self.shell_image.clone(),
            ruby_image: self.ruby_image.clone(),
            work_root: self.work_root.clone(),
            sample_interval_ms: self.sample_interval_ms,
            cpu_grace_samples: self.cpu_grace_samples.max(1),
            install_timeout_seconds: self.install_timeout_seconds,
            max_concurrent: self.max_concurrent,
        })
    }
}

// ---------------------------------------------------------------------------
// [logging]
// ---------------------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "bastion::audit=debug").
    pub level: String,
    pub format: LogFormat,
    /// Retain at most this many audit entries; unbounded when unset.
    pub audit_max_entries: Option<usize>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
            audit_max_entries: None,
        }
    }
}
