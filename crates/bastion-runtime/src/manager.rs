//! The `SafetyManager` facade.
//!
//! Builds the filesystem controller, network controller and execution
//! sandbox from one immutable session policy, and exposes `execute`,
//! `file_op` and `net_op` plus aggregated statistics.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bastion_access::{
    validate_filesystem_policy, validate_network_policy, AuditLog, FileOperation, FileSystem,
    FilesystemAccessController, HttpMethod, HttpResponse, NetworkAccessController,
    NetworkBackend, ScopedSocket, WriteReceipt,
};
use bastion_config::{BastionConfig, SessionPolicy};
use bastion_types::{
    AuditLogEntry, AuditOperation, AuditResult, ExecutionRequest, ExecutionResult,
    FilesystemPolicy, NetworkPolicy, ResourceLimits, SandboxSettings,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::isolation::{ContainerBackend, IsolationBackend, ProcessBackend};
use crate::metrics::ExecutionMetrics;
use crate::sandbox::ExecutionSandbox;
use crate::scheduler::{Scheduler, SchedulerConfig};

/// A mediated filesystem operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Read { path: PathBuf },
    Write { path: PathBuf, data: Vec<u8>, append: bool },
    Copy { src: PathBuf, dst: PathBuf },
    Move { src: PathBuf, dst: PathBuf },
    Delete { path: PathBuf },
    List { path: PathBuf },
    Exists { path: PathBuf },
    /// Validate only; no I/O on the target.
    Check { path: PathBuf, operation: FileOperation },
    CreateTempDir { prefix: String },
    CleanupTempDirs,
}

/// What a [`FileOp`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOpOutput {
    Data(Vec<u8>),
    Written(WriteReceipt),
    Copied(u64),
    Done,
    Entries(Vec<PathBuf>),
    Exists(bool),
    Checked(PathBuf),
    TempDir(PathBuf),
    Removed(usize),
}

/// A mediated network operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetOp {
    Request {
        method: HttpMethod,
        url: String,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    Get { url: String },
    DnsLookup { host: String },
    /// Validate only; no DNS and no connection.
    CheckUrl { url: String },
    OpenSocket { host: String, port: u16, timeout: Option<Duration> },
}

/// What a [`NetOp`] produced.
#[derive(Debug)]
pub enum NetOpOutput {
    Response(HttpResponse),
    Addresses(Vec<IpAddr>),
    Allowed,
    Socket(ScopedSocket),
}

/// Aggregated counters for a manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Audited operations of every kind.
    pub total_ops: u64,
    pub allowed: u64,
    pub denied: u64,
    pub restricted: u64,
    pub errors: u64,
    /// Files created through `file_op` plus files payloads left behind.
    pub files_created: u64,
    pub bytes_transferred: u64,
    /// Executions that reached the sandbox.
    pub executions: u64,
    /// Executions refused before the sandbox.
    pub rejected_executions: u64,
    pub executions_by_status: BTreeMap<String, u64>,
    pub isolation_fallbacks: u64,
    /// Audit entries evicted by the capacity bound.
    pub audit_dropped: u64,
}

/// Builder for [`SafetyManager`]. Unset parts take their defaults.
#[derive(Default)]
pub struct SafetyManagerBuilder {
    filesystem: Option<FilesystemPolicy>,
    network: Option<NetworkPolicy>,
    limits: Option<ResourceLimits>,
    sandbox: Option<SandboxSettings>,
    audit: Option<Arc<AuditLog>>,
    fs_backend: Option<Arc<dyn FileSystem>>,
    net_backend: Option<Arc<dyn NetworkBackend>>,
    container: Option<Arc<dyn IsolationBackend>>,
    process: Option<Arc<dyn IsolationBackend>>,
}

impl SafetyManagerBuilder {
    pub fn policies(mut self, policy: SessionPolicy) -> Self {
        self.filesystem = Some(policy.filesystem);
        self.network = Some(policy.network);
        self.limits = Some(policy.limits);
        self.sandbox = Some(policy.sandbox);
        self
    }

    pub fn filesystem_policy(mut self, policy: FilesystemPolicy) -> Self {
        self.filesystem = Some(policy);
        self
    }

    pub fn network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.network = Some(policy);
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn sandbox_settings(mut self, settings: SandboxSettings) -> Self {
        self.sandbox = Some(settings);
        self
    }

    /// Shares an existing audit log.
    pub fn audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn filesystem_backend(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs_backend = Some(fs);
        self
    }

    pub fn network_backend(mut self, backend: Arc<dyn NetworkBackend>) -> Self {
        self.net_backend = Some(backend);
        self
    }

    pub fn container_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.container = Some(backend);
        self
    }

    pub fn process_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.process = Some(backend);
        self
    }

    /// Validates the policies and wires the components.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Access` with `InvalidConfig` for a malformed
    /// policy.
    pub fn build(self) -> Result<SafetyManager, RuntimeError> {
        let fs_policy = Arc::new(self.filesystem.unwrap_or_default());
        let net_policy = Arc::new(self.network.unwrap_or_default());
        validate_filesystem_policy(&fs_policy)?;
        validate_network_policy(&net_policy)?;
        let limits = self.limits.unwrap_or_default();
        let settings = Arc::new(self.sandbox.unwrap_or_default());
        let audit = self.audit.unwrap_or_else(AuditLog::new_shared);

        let filesystem = match self.fs_backend {
            Some(fs) => FilesystemAccessController::with_backend(
                Arc::clone(&fs_policy),
                Arc::clone(&audit),
                fs,
            ),
            None => FilesystemAccessController::new(Arc::clone(&fs_policy), Arc::clone(&audit)),
        };
        let network = match self.net_backend {
            Some(backend) => {
                NetworkAccessController::with_backend(net_policy, Arc::clone(&audit), backend)
            }
            None => NetworkAccessController::new(net_policy, Arc::clone(&audit)),
        };
        let metrics = ExecutionMetrics::new_shared();
        let container: Arc<dyn IsolationBackend> = match self.container {
            Some(backend) => backend,
            None => Arc::new(ContainerBackend::from_settings(&settings)),
        };
        let process: Arc<dyn IsolationBackend> = match self.process {
            Some(backend) => backend,
            None => Arc::new(ProcessBackend::new()),
        };
        let sandbox = ExecutionSandbox::new(
            Arc::clone(&settings),
            fs_policy,
            network.clone(),
            Arc::clone(&audit),
            Arc::clone(&metrics),
        )
        .with_backends(container, process);
        let scheduler = Scheduler::new(&SchedulerConfig {
            max_concurrent: settings.max_concurrent.max(1),
        });

        info!(
            isolation = ?settings.isolation,
            max_concurrent = scheduler.max_concurrent(),
            "safety manager ready"
        );
        Ok(SafetyManager {
            filesystem,
            network,
            sandbox,
            scheduler,
            metrics,
            audit,
            limits,
        })
    }
}

/// Single entry point for sandboxed execution and mediated I/O.
#[derive(Debug)]
pub struct SafetyManager {
    filesystem: FilesystemAccessController,
    network: NetworkAccessController,
    sandbox: ExecutionSandbox,
    scheduler: Scheduler,
    metrics: Arc<ExecutionMetrics>,
    audit: Arc<AuditLog>,
    limits: ResourceLimits,
}

impl SafetyManager {
    pub fn builder() -> SafetyManagerBuilder {
        SafetyManagerBuilder::default()
    }

    /// Builds a manager from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Config` when the configuration fails
    /// validation.
    pub fn from_config(config: &BastionConfig) -> Result<Self, RuntimeError> {
        let policies = config.to_policies()?;
        let audit = match config.logging.audit_max_entries {
            Some(max) => Arc::new(AuditLog::with_capacity_limit(max)),
            None => AuditLog::new_shared(),
        };
        Self::builder().policies(policies).audit_log(audit).build()
    }

    /// Runs `request` in a fresh sandbox.
    ///
    /// # Errors
    ///
    /// Fails only when the request is refused before reaching the sandbox:
    /// invalid request, a limit above the session ceiling, or shutdown.
    /// Everything that happens after that is reported in the result.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, RuntimeError> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), aborting when `cancel` fires.
    #[tracing::instrument(skip_all, fields(language = %request.language))]
    pub async fn execute_with_cancel(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, RuntimeError> {
        let limits = self.admit(request).inspect_err(|e| {
            self.metrics.record_rejection();
            warn!(error = %e, "execution request refused");
            self.audit.record(
                AuditLogEntry::new(
                    AuditOperation::Exec,
                    request.language.entry_file(),
                    AuditResult::Denied,
                )
                .with_error(e.to_string()),
            );
        })?;
        let _permit = tokio::select! {
            permit = self.scheduler.acquire() => permit?,
            () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
        };
        Ok(self.sandbox.execute(request, &limits, cancel).await)
    }

    /// Validates `request` and resolves its effective limits.
    fn admit(&self, request: &ExecutionRequest) -> Result<ResourceLimits, RuntimeError> {
        request.validate()?;
        let ceiling = &self.limits;
        Ok(ResourceLimits {
            timeout_seconds: narrow(
                "timeout_seconds",
                request.timeout_seconds,
                ceiling.timeout_seconds,
            )?,
            max_memory_mb: narrow("max_memory_mb", request.max_memory_mb, ceiling.max_memory_mb)?,
            max_cpu_percent: if ceiling.max_cpu_percent == 0 {
                request.max_cpu_percent
            } else {
                narrow(
                    "max_cpu_percent",
                    u64::from(request.max_cpu_percent),
                    u64::from(ceiling.max_cpu_percent),
                )? as u32
            },
            ..ceiling.clone()
        })
    }

    /// Performs a mediated filesystem operation.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Access` for policy violations and I/O failures.
    pub fn file_op(&self, op: FileOp) -> Result<FileOpOutput, RuntimeError> {
        let fs = &self.filesystem;
        let output = match op {
            FileOp::Read { path } => FileOpOutput::Data(fs.read(path)?),
            FileOp::Write { path, data, append } => {
                FileOpOutput::Written(fs.write(path, &data, append)?)
            }
            FileOp::Copy { src, dst } => FileOpOutput::Copied(fs.copy(src, dst)?),
            FileOp::Move { src, dst } => {
                fs.move_file(src, dst)?;
                FileOpOutput::Done
            }
            FileOp::Delete { path } => {
                fs.delete(path)?;
                FileOpOutput::Done
            }
            FileOp::List { path } => FileOpOutput::Entries(fs.list_dir(path)?),
            FileOp::Exists { path } => FileOpOutput::Exists(fs.exists(path)?),
            FileOp::Check { path, operation } => FileOpOutput::Checked(fs.check(path, operation)?),
            FileOp::CreateTempDir { prefix } => FileOpOutput::TempDir(fs.create_temp_dir(&prefix)?),
            FileOp::CleanupTempDirs => FileOpOutput::Removed(fs.cleanup_temp_dirs()),
        };
        Ok(output)
    }

    /// Performs a mediated network operation.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Access` for policy violations and network
    /// failures. Nothing is retried.
    pub async fn net_op(&self, op: NetOp) -> Result<NetOpOutput, RuntimeError> {
        let net = &self.network;
        let output = match op {
            NetOp::Request {
                method,
                url,
                headers,
                body,
            } => NetOpOutput::Response(net.request(method, &url, headers, body).await?),
            NetOp::Get { url } => NetOpOutput::Response(net.get(&url).await?),
            NetOp::DnsLookup { host } => NetOpOutput::Addresses(net.dns_lookup_all(&host).await?),
            NetOp::CheckUrl { url } => {
                net.check_url(&url)?;
                NetOpOutput::Allowed
            }
            NetOp::OpenSocket {
                host,
                port,
                timeout,
            } => {
                let timeout = timeout.unwrap_or_else(|| net.policy().request_timeout());
                NetOpOutput::Socket(net.open_socket(&host, port, timeout).await?)
            }
        };
        Ok(output)
    }

    /// Aggregates audit, controller and execution counters.
    pub fn statistics(&self) -> Statistics {
        let summary = self.audit.summary();
        let executions = self.metrics.snapshot();
        Statistics {
            total_ops: summary.total,
            allowed: summary.allowed,
            denied: summary.denied,
            restricted: summary.restricted,
            errors: summary.errors,
            files_created: self.filesystem.stats().files_created + executions.files_created,
            bytes_transferred: self.network.stats().bytes_transferred,
            executions: executions.total_executions,
            rejected_executions: executions.rejected_requests,
            executions_by_status: executions.by_status,
            isolation_fallbacks: executions.isolation_fallbacks,
            audit_dropped: summary.dropped,
        }
    }

    /// Writes the audit log to `path` as a JSON array. Returns entries
    /// written.
    pub fn export_audit_log(&self, path: impl AsRef<Path>) -> Result<usize, RuntimeError> {
        let path = path.as_ref();
        let written = self
            .audit
            .export_json(path)
            .map_err(|e| RuntimeError::io("export audit log", e))?;
        info!(path = %path.display(), entries = written, "audit log exported");
        Ok(written)
    }

    /// Waits for in-flight executions, refuses new ones, and removes temp
    /// directories created through `file_op`.
    pub async fn shutdown(&self) {
        self.scheduler.drain_and_close().await;
        let removed = self.filesystem.cleanup_temp_dirs();
        info!(temp_dirs_removed = removed, "safety manager shut down");
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn filesystem(&self) -> &FilesystemAccessController {
        &self.filesystem
    }

    pub fn network(&self) -> &NetworkAccessController {
        &self.network
    }

    pub fn sandbox(&self) -> &ExecutionSandbox {
        &self.sandbox
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Session resource ceilings.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

/// `requested` if set and within `ceiling`; `ceiling` when unset.
fn narrow(limit: &'static str, requested: u64, ceiling: u64) -> Result<u64, RuntimeError> {
    match requested {
        0 => Ok(ceiling),
        r if r > ceiling => Err(RuntimeError::LimitAboveCeiling {
            limit,
            requested,
            ceiling,
        }),
        r => Ok(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_inherits_and_caps() {
        assert_eq!(narrow("t", 0, 30).expect("inherit"), 30);
        assert_eq!(narrow("t", 5, 30).expect("narrow"), 5);
        assert!(matches!(
            narrow("t", 60, 30),
            Err(RuntimeError::LimitAboveCeiling { requested: 60, ceiling: 30, .. })
        ));
    }

    #[test]
    fn admit_resolves_request_limits() {
        let manager = SafetyManager::builder()
            .limits(ResourceLimits {
                timeout_seconds: 10,
                max_memory_mb: 256,
                max_cpu_percent: 0,
                ..ResourceLimits::default()
            })
            .build()
            .expect("manager");
        let req = ExecutionRequest::new("echo hi", bastion_types::Language::Shell)
            .with_timeout_seconds(3)
            .with_max_cpu_percent(400);
        let limits = manager.admit(&req).expect("admit");
        assert_eq!(limits.timeout_seconds, 3);
        assert_eq!(limits.max_memory_mb, 256);
        assert_eq!(limits.max_cpu_percent, 400);
    }

    #[test]
    fn admit_refuses_wider_limits() {
        let manager = SafetyManager::builder().build().expect("manager");
        let req = ExecutionRequest::new("echo hi", bastion_types::Language::Shell)
            .with_max_memory_mb(1_000_000);
        assert!(matches!(
            manager.admit(&req),
            Err(RuntimeError::LimitAboveCeiling { limit: "max_memory_mb", .. })
        ));
    }
}
