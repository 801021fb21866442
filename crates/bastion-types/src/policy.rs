//! Access policies and resource limits.
//!
//! Policies are plain data: built once (normally by `bastion-config`),
//! then shared read-only between every controller and execution.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Locations that are refused when `system_access` is off.
pub const SYSTEM_PATHS: &[&str] = &[
    "/etc",
    "/proc",
    "/sys",
    "/dev",
    "/boot",
    "/root",
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/var/run",
    "/private/etc",
    "/System",
    "C:\\Windows",
    "C:\\Program Files",
];

/// Filesystem policy enforced by the filesystem access controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Require every path to live under `repo_root` (or a controller temp dir).
    pub restrict_to_root: bool,
    /// Repository root; relative request paths are resolved against it.
    pub repo_root: PathBuf,
    /// Path prefixes that are permitted. Empty = no extra narrowing.
    pub allowed_paths: Vec<PathBuf>,
    /// Path prefixes that are always refused.
    pub denied_paths: Vec<PathBuf>,
    /// Extensions (without the dot, lowercase) that are permitted. Empty = any.
    pub allowed_extensions: BTreeSet<String>,
    /// Extensions that are always refused.
    pub denied_extensions: BTreeSet<String>,
    /// Maximum size of any written file.
    pub max_file_size_bytes: u64,
    /// Maximum number of new files a controller may create.
    pub max_files_created: u64,
    /// Whether controller-created temp dirs are accessible.
    pub temp_dir_access: bool,
    /// Whether system locations (see [`SYSTEM_PATHS`]) are accessible.
    pub system_access: bool,
    /// Whether decisions are written to the audit log.
    pub audit_enabled: bool,
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        Self {
            restrict_to_root: true,
            repo_root: PathBuf::from("."),
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            allowed_extensions: BTreeSet::new(),
            denied_extensions: ["exe", "dll", "so", "dylib", "bat", "cmd"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files_created: 100,
            temp_dir_access: true,
            system_access: false,
            audit_enabled: true,
        }
    }
}

impl FilesystemPolicy {
    /// Derives a policy jailed to `root`, keeping this policy's extension,
    /// size and count rules. Used for per-execution working directories.
    pub fn scoped_to(&self, root: impl AsRef<Path>) -> Self {
        Self {
            restrict_to_root: true,
            repo_root: root.as_ref().to_path_buf(),
            allowed_paths: Vec::new(),
            temp_dir_access: false,
            ..self.clone()
        }
    }
}

/// How the rate limiter reacts to a full window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Deny the request with a `RateLimited` denial.
    #[default]
    Reject,
    /// Block until the window slides far enough to admit the request.
    Wait,
}

/// Network policy enforced by the network access controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Require an explicit allow match on domain or IP.
    pub default_deny: bool,
    /// Exact hosts or leading-wildcard `*.suffix` patterns.
    pub allowed_domains: Vec<String>,
    /// Patterns that are always refused.
    pub denied_domains: Vec<String>,
    /// Allowed networks.
    pub allowed_ips: Vec<IpNet>,
    /// Refused networks; checked against literal and resolved addresses.
    pub denied_ips: Vec<IpNet>,
    /// Permitted ports. Empty = any port not denied.
    pub allowed_ports: BTreeSet<u16>,
    /// Refused ports.
    pub denied_ports: BTreeSet<u16>,
    /// Permitted protocols (`http`, `https`, `tcp`, `dns`).
    pub allowed_protocols: BTreeSet<String>,
    /// Per-request timeout.
    pub request_timeout_seconds: u64,
    /// Response bodies larger than this are cut off and refused.
    pub max_response_size_bytes: u64,
    /// Maximum redirect hops followed.
    pub max_redirects: u32,
    /// Whether TLS certificates are verified.
    pub verify_ssl: bool,
    /// Requests per host per window. 0 = unlimited.
    pub rate_limit: u32,
    /// Sliding window length.
    pub rate_window_seconds: u64,
    /// Behaviour when the window is full.
    pub rate_limit_mode: RateLimitMode,
    /// User-Agent header sent on every request.
    pub user_agent: String,
    /// Whether decisions are written to the audit log.
    pub audit_enabled: bool,
}

/// Networks refused by default: loopback, link-local (cloud metadata),
/// private and unspecified ranges.
pub fn default_denied_networks() -> Vec<IpNet> {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .filter_map(|cidr| cidr.parse().ok())
    .collect()
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            default_deny: true,
            allowed_domains: Vec::new(),
            denied_domains: Vec::new(),
            allowed_ips: Vec::new(),
            denied_ips: default_denied_networks(),
            allowed_ports: [80, 443].into_iter().collect(),
            denied_ports: BTreeSet::new(),
            allowed_protocols: ["http", "https", "dns"].into_iter().map(String::from).collect(),
            request_timeout_seconds: 30,
            max_response_size_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
            verify_ssl: true,
            rate_limit: 60,
            rate_window_seconds: 60,
            rate_limit_mode: RateLimitMode::Reject,
            user_agent: concat!("bastion/", env!("CARGO_PKG_VERSION")).to_string(),
            audit_enabled: true,
        }
    }
}

impl NetworkPolicy {
    /// Returns the request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Returns the rate window as a `Duration`.
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_seconds)
    }
}

/// Resource ceilings for executions in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock limit in seconds.
    pub timeout_seconds: u64,
    /// Memory limit in megabytes.
    pub max_memory_mb: u64,
    /// CPU limit in percent of one core. 0 = unlimited.
    pub max_cpu_percent: u32,
    /// Captured bytes per output stream.
    pub max_output_bytes: u64,
    /// Process (pid) limit inside the isolation boundary.
    pub max_processes: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_memory_mb: 512,
            max_cpu_percent: 100,
            max_output_bytes: 1024 * 1024,
            max_processes: 64,
        }
    }
}

impl ResourceLimits {
    /// Returns the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Memory limit in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Which isolation strategy a session asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationPreference {
    /// Container when available, otherwise process (with a recorded warning).
    #[default]
    Auto,
    /// Container only; fail if unavailable.
    Container,
    /// Process isolation only.
    Process,
}

/// Sandbox-level settings that are not access policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Requested isolation strategy.
    pub isolation: IsolationPreference,
    /// Container runtime binary (docker-compatible CLI).
    pub container_runtime: String,
    /// Image for Python payloads.
    pub python_image: String,
    /// Image for JavaScript payloads.
    pub node_image: String,
    /// Image for shell payloads.
    pub shell_image: String,
    /// Image for Ruby payloads.
    pub ruby_image: String,
    /// Parent directory for per-execution working dirs. `None` = system temp.
    pub work_root: Option<PathBuf>,
    /// Resource monitor sampling interval.
    pub sample_interval_ms: u64,
    /// Consecutive over-limit CPU samples tolerated before a kill.
    pub cpu_grace_samples: u32,
    /// Time allowed for installing requirements.
    pub install_timeout_seconds: u64,
    /// Maximum concurrent executions per manager.
    pub max_concurrent: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            isolation: IsolationPreference::Auto,
            container_runtime: "docker".to_string(),
            python_image: "python:3.12-slim".to_string(),
            node_image: "node:20-slim".to_string(),
            shell_image: "busybox:1.36".to_string(),
            ruby_image: "ruby:3.3-slim".to_string(),
            work_root: None,
            sample_interval_ms: 200,
            cpu_grace_samples: 3,
            install_timeout_seconds: 300,
            max_concurrent: 4,
        }
    }
}

impl SandboxSettings {
    /// Returns the sampling interval as a `Duration`.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(10))
    }

    /// Returns the requirement install timeout as a `Duration`.
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_seconds)
    }
}
