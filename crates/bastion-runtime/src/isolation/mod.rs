//! Isolation backends.
//!
//! A backend launches one payload, exposes a [`ResourceProbe`] for it, and
//! can kill and tear it down. [`ContainerBackend`] gives kernel-level
//! isolation through a container runtime; [`ProcessBackend`] is the weaker
//! fallback built from a process group, rlimits and a scrubbed environment.

pub mod container;
pub mod process;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bastion_types::{IsolationMode, Language, ResourceLimits};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::probe::ResourceProbe;

pub use container::ContainerBackend;
pub use process::ProcessBackend;

/// Directory inside the workdir receiving installed requirements.
pub const DEPS_DIR: &str = ".bastion_deps";
/// Scratch directory inside the workdir for process-isolated payloads.
pub const TMP_DIR: &str = ".bastion_tmp";
/// Workdir entries with this prefix belong to the sandbox, not the payload.
pub const RESERVED_PREFIX: &str = ".bastion_";
/// Unix socket inside the workdir where the egress proxy listens.
pub const PROXY_SOCKET: &str = ".bastion_proxy.sock";

/// Everything a backend needs to start one payload.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub execution_id: String,
    pub language: Language,
    /// Host path of the working directory.
    pub workdir: PathBuf,
    /// Entry file, relative to `workdir`.
    pub entry: String,
    pub limits: ResourceLimits,
    pub max_file_size_bytes: u64,
    /// Host path of the egress proxy socket when network is enabled. The
    /// proxy must be the payload's only route out.
    pub proxy_socket: Option<PathBuf>,
    /// Whether `DEPS_DIR` holds installed requirements.
    pub with_deps: bool,
}

/// Identifies a launched payload to its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadHandle {
    /// Session leader of a process-isolated payload, and the egress
    /// forwarder running beside it when networked.
    Process { pid: u32, forwarder: Option<u32> },
    /// Named container.
    Container { name: String },
}

/// A started payload.
#[derive(Debug)]
pub struct Launched {
    /// The supervised child; its stdout and stderr are piped.
    pub child: Child,
    pub handle: PayloadHandle,
    /// Isolation the backend could not apply. Each is audited as
    /// RESTRICTED and surfaced as a warning.
    pub weakened: Vec<String>,
}

/// Runs payloads under one isolation primitive.
#[async_trait]
pub trait IsolationBackend: Send + Sync + fmt::Debug {
    /// The isolation this backend provides.
    fn mode(&self) -> IsolationMode;

    /// Fails with `IsolationUnavailable` when `language` cannot run here.
    async fn check_available(&self, language: Language) -> Result<(), RuntimeError>;

    /// Whether a networked payload can be confined so the egress proxy is
    /// its only route out.
    fn brokers_egress(&self) -> bool {
        false
    }

    /// Installs `requirements` into the plan's `DEPS_DIR`.
    async fn install(
        &self,
        plan: &LaunchPlan,
        requirements: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError>;

    /// Starts the payload.
    async fn launch(&self, plan: &LaunchPlan) -> Result<Launched, RuntimeError>;

    /// Resource probe for a launched payload.
    fn probe(&self, handle: &PayloadHandle) -> Arc<dyn ResourceProbe>;

    /// Hard-kills everything the payload started.
    async fn kill(&self, handle: &PayloadHandle);

    /// Whether the kernel OOM killer ended the payload.
    async fn oom_killed(&self, _handle: &PayloadHandle) -> bool {
        false
    }

    /// Removes everything the backend created for the payload. Idempotent.
    async fn teardown(&self, handle: &PayloadHandle);

    /// Best-effort synchronous teardown for when supervision is dropped
    /// mid-flight.
    fn abandon(&self, handle: &PayloadHandle);
}

/// Interpreter settings every payload of `language` gets.
pub fn language_env(language: Language) -> Vec<(String, String)> {
    match language {
        Language::Python => vec![
            ("PYTHONUNBUFFERED".into(), "1".into()),
            ("PYTHONDONTWRITEBYTECODE".into(), "1".into()),
            ("PYTHONNOUSERSITE".into(), "1".into()),
        ],
        Language::JavaScript => vec![("NPM_CONFIG_UPDATE_NOTIFIER".into(), "false".into())],
        Language::Ruby | Language::Shell => Vec::new(),
    }
}

/// Proxy variables pointing proxy-aware clients at `proxy_url`.
pub fn proxy_env(proxy_url: &str) -> Vec<(String, String)> {
    ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"]
        .into_iter()
        .map(|k| (k.to_string(), proxy_url.to_string()))
        .chain([
            ("NO_PROXY".to_string(), String::new()),
            ("no_proxy".to_string(), String::new()),
        ])
        .collect()
}

/// Deadline and cancellation for an installer run.
pub(crate) enum InstallEnd {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Waits for an installer child under `timeout` and `cancel`.
pub(crate) async fn wait_installer(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
) -> InstallEnd {
    tokio::select! {
        status = child.wait() => InstallEnd::Exited(status),
        () = tokio::time::sleep(timeout) => InstallEnd::TimedOut,
        () = cancel.cancelled() => InstallEnd::Cancelled,
    }
}
