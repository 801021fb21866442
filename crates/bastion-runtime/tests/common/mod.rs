//! Shared helpers for bastion-runtime integration tests.

#![allow(dead_code)]

use std::path::Path;

use bastion_runtime::SafetyManager;
use bastion_types::{
    FilesystemPolicy, IsolationPreference, Language, ResourceLimits, SandboxSettings,
};

/// Settings for process isolation with workspaces under `work_root`.
pub fn process_settings(work_root: &Path) -> SandboxSettings {
    SandboxSettings {
        isolation: IsolationPreference::Process,
        work_root: Some(work_root.to_path_buf()),
        sample_interval_ms: 50,
        cpu_grace_samples: 2,
        ..SandboxSettings::default()
    }
}

/// A process-isolated manager rooted at `root`.
pub fn process_manager(root: &Path, work_root: &Path, limits: ResourceLimits) -> SafetyManager {
    SafetyManager::builder()
        .filesystem_policy(FilesystemPolicy {
            repo_root: root.to_path_buf(),
            ..FilesystemPolicy::default()
        })
        .sandbox_settings(process_settings(work_root))
        .limits(limits)
        .build()
        .expect("manager")
}

/// Short session limits for tests.
pub fn quick_limits() -> ResourceLimits {
    ResourceLimits {
        timeout_seconds: 10,
        ..ResourceLimits::default()
    }
}

/// Whether the interpreter for `language` is installed on this host.
pub fn has_interpreter(language: Language) -> bool {
    which::which(language.interpreter()).is_ok()
}

/// Entries left directly under `dir`.
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |rd| rd.count())
}

/// Network backend that counts lookups and never touches the network.
#[derive(Debug, Default)]
pub struct CountingNet {
    resolves: std::sync::atomic::AtomicUsize,
}

impl CountingNet {
    pub fn resolves(&self) -> usize {
        self.resolves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl bastion_access::NetworkBackend for CountingNet {
    async fn resolve(&self, _host: &str, port: u16) -> std::io::Result<Vec<std::net::SocketAddr>> {
        self.resolves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(vec![std::net::SocketAddr::from(([93, 184, 216, 34], port))])
    }

    async fn send(
        &self,
        request: bastion_access::HttpRequest,
    ) -> Result<bastion_access::HttpResponse, bastion_access::BackendError> {
        Ok(bastion_access::HttpResponse {
            status_code: 200,
            headers: Vec::new(),
            body: b"ok".to_vec(),
            url: request.url.to_string(),
            size: 2,
        })
    }

    async fn connect(
        &self,
        _addrs: &[std::net::SocketAddr],
        _timeout: std::time::Duration,
    ) -> std::io::Result<tokio::net::TcpStream> {
        Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
    }
}
