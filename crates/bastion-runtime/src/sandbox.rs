//! The execution sandbox.
//!
//! One [`ExecutionSandbox::execute`] call drives a payload through
//! `Pending -> Preparing -> Running -> terminal -> CleanedUp`:
//!
//! - **Preparing**: fresh workspace, files staged through the jailed
//!   filesystem controller, isolation backend chosen, requirements
//!   installed, egress proxy started when network is enabled.
//! - **Running**: the payload runs under its backend while a resource
//!   monitor samples it and a watchdog holds the wall-clock deadline.
//! - **Terminal**: the payload tree is killed unless it exited by itself;
//!   a completed run has its output diffed and revalidated.
//! - **CleanedUp**: proxy, container and workspace are removed on every
//!   path, including when the caller drops the future mid-run.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bastion_access::{AuditLog, NetworkAccessController};
use bastion_types::{
    AuditLogEntry, AuditOperation, AuditResult, ExecutionRequest, ExecutionResult,
    ExecutionStatus, FilesystemPolicy, IsolationMode, IsolationPreference, Language,
    ResourceLimits, SandboxSettings, SandboxState,
};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::isolation::{
    ContainerBackend, IsolationBackend, LaunchPlan, Launched, PayloadHandle, ProcessBackend,
    PROXY_SOCKET,
};
use crate::metrics::ExecutionMetrics;
use crate::monitor::{Breach, Monitor, MonitorLimits};
use crate::output::{capture, finish};
use crate::proxy::EgressProxy;
use crate::workspace::{Snapshot, Workspace};

/// Time output streams get to close after the payload ends.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);
/// Time a killed payload gets to be reaped before a second kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Returns a fresh execution id.
pub fn new_execution_id() -> String {
    format!("exec-{}", Uuid::new_v4().simple())
}

/// Tracks one execution's [`SandboxState`].
#[derive(Debug)]
struct Lifecycle {
    state: SandboxState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: SandboxState::Pending,
        }
    }

    fn advance(&mut self, next: SandboxState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(from = ?self.state, to = ?next, "sandbox state");
        } else {
            tracing::warn!(from = ?self.state, to = ?next, "unexpected sandbox transition");
        }
        self.state = next;
    }
}

/// Resources that must be released whatever happens to the execution.
///
/// [`CleanupGuard::release`] is the orderly path. Dropping an unreleased
/// guard (the caller abandoned the future) falls back to synchronous
/// best-effort removal.
struct CleanupGuard {
    workspace: Arc<Workspace>,
    payload: Option<(Arc<dyn IsolationBackend>, PayloadHandle)>,
    proxy: Option<EgressProxy>,
    released: bool,
}

impl CleanupGuard {
    fn new(workspace: Workspace) -> Self {
        Self {
            workspace: Arc::new(workspace),
            payload: None,
            proxy: None,
            released: false,
        }
    }

    /// Releases everything. Returns problems worth surfacing as warnings.
    async fn release(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(proxy) = self.proxy.take() {
            proxy.shutdown().await;
        }
        if let Some((backend, handle)) = self.payload.take() {
            backend.teardown(&handle).await;
        }
        if let Err(e) = self.workspace.cleanup() {
            tracing::warn!(error = %e, "workspace cleanup failed");
            warnings.push(format!("workspace cleanup failed: {e}"));
        }
        self.released = true;
        warnings
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!("execution abandoned mid-flight; cleaning up");
        if let Some((backend, handle)) = self.payload.take() {
            backend.abandon(&handle);
        }
        let _ = self.workspace.cleanup();
    }
}

/// How the RUNNING phase ended.
#[derive(Debug, Clone, Copy)]
enum Ending {
    Exited,
    Breach(Breach),
    Timeout,
    Cancelled,
}

/// Runs untrusted payloads under isolation.
#[derive(Debug, Clone)]
pub struct ExecutionSandbox {
    settings: Arc<SandboxSettings>,
    fs_policy: Arc<FilesystemPolicy>,
    network: NetworkAccessController,
    audit: Arc<AuditLog>,
    metrics: Arc<ExecutionMetrics>,
    container: Arc<dyn IsolationBackend>,
    process: Arc<dyn IsolationBackend>,
}

impl ExecutionSandbox {
    /// Creates a sandbox with the default container and process backends.
    pub fn new(
        settings: Arc<SandboxSettings>,
        fs_policy: Arc<FilesystemPolicy>,
        network: NetworkAccessController,
        audit: Arc<AuditLog>,
        metrics: Arc<ExecutionMetrics>,
    ) -> Self {
        let container: Arc<dyn IsolationBackend> =
            Arc::new(ContainerBackend::from_settings(&settings));
        Self {
            settings,
            fs_policy,
            network,
            audit,
            metrics,
            container,
            process: Arc::new(ProcessBackend::new()),
        }
    }

    /// Replaces the isolation backends.
    pub fn with_backends(
        mut self,
        container: Arc<dyn IsolationBackend>,
        process: Arc<dyn IsolationBackend>,
    ) -> Self {
        self.container = container;
        self.process = process;
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Runs `request` under `limits` and returns its single result.
    ///
    /// Never fails: every problem is reported through the result's status
    /// and error message. `cancel` aborts the run through the same cleanup
    /// path as a timeout.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let execution_id = new_execution_id();
        let span = tracing::info_span!(
            "execute",
            execution_id = %execution_id,
            language = %request.language,
        );
        self.execute_inner(execution_id, request, limits, cancel)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        execution_id: String,
        request: &ExecutionRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let mut life = Lifecycle::new();
        self.metrics.record_attempt();
        tracing::info!(timeout_s = limits.timeout_seconds, memory_mb = limits.max_memory_mb, "execution started");
        life.advance(SandboxState::Preparing);

        let workspace = match Workspace::create(
            self.settings.work_root.as_deref(),
            &self.fs_policy,
            Arc::clone(&self.audit),
            &execution_id,
        ) {
            Ok(ws) => ws,
            Err(e) => {
                life.advance(SandboxState::Errored);
                life.advance(SandboxState::CleanedUp);
                return self.conclude(ExecutionResult::error(&execution_id, e.to_string()), request);
            }
        };
        let mut guard = CleanupGuard::new(workspace);
        let mut result = ExecutionResult::new(&execution_id, ExecutionStatus::Error);

        if let Err(e) = self
            .drive(request, limits, cancel, &mut guard, &mut life, &mut result)
            .await
        {
            life.advance(SandboxState::Errored);
            result.status = match e {
                RuntimeError::Cancelled => ExecutionStatus::Cancelled,
                _ => ExecutionStatus::Error,
            };
            tracing::warn!(error = %e, "execution failed before completion");
            result.error_message = Some(e.to_string());
        }

        let cleanup_warnings = guard.release().await;
        result.warnings.extend(cleanup_warnings);
        life.advance(SandboxState::CleanedUp);
        self.conclude(result, request)
    }

    /// Preparing and Running. Fills `result`; errors are sandbox failures.
    async fn drive(
        &self,
        request: &ExecutionRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
        guard: &mut CleanupGuard,
        life: &mut Lifecycle,
        result: &mut ExecutionResult,
    ) -> Result<(), RuntimeError> {
        let execution_id = result.execution_id.clone();
        let workspace = Arc::clone(&guard.workspace);
        let entry = request.language.entry_file();

        workspace.stage(&request.files, entry, &request.code)?;
        let backend = self
            .select_backend(request.language, request.network_enabled, result)
            .await?;
        result.isolation = Some(backend.mode());

        let mut plan = LaunchPlan {
            execution_id: execution_id.clone(),
            language: request.language,
            workdir: workspace.path().to_path_buf(),
            entry: entry.to_string(),
            limits: limits.clone(),
            max_file_size_bytes: self.fs_policy.max_file_size_bytes,
            proxy_socket: None,
            with_deps: !request.requirements.is_empty(),
        };

        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if plan.with_deps {
            self.install(backend.as_ref(), &plan, request, cancel).await?;
        }
        if request.network_enabled {
            let controller = if request.allowed_hosts.is_empty() {
                self.network.with_execution_id(&execution_id)
            } else {
                self.network
                    .scoped(request.allowed_hosts.iter().cloned(), &execution_id)
            };
            let socket = workspace.path().join(PROXY_SOCKET);
            let proxy = EgressProxy::start(&socket, controller).await?;
            plan.proxy_socket = Some(socket);
            guard.proxy = Some(proxy);
        }

        let before = workspace.snapshot()?;
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        let Launched {
            mut child,
            handle,
            weakened,
        } = backend.launch(&plan).await?;
        guard.payload = Some((Arc::clone(&backend), handle.clone()));
        for reason in weakened {
            self.record_weakened("network", &reason, result);
            result.warnings.push(reason);
        }
        life.advance(SandboxState::Running);

        let stop_capture = CancellationToken::new();
        let limit = limits.max_output_bytes;
        let stdout = child
            .stdout
            .take()
            .map(|s| tokio::spawn(capture(s, limit, stop_capture.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(capture(s, limit, stop_capture.clone())));
        let (monitor, mut breach_rx) = Monitor::spawn(
            backend.probe(&handle),
            MonitorLimits {
                max_memory_bytes: limits.max_memory_bytes(),
                max_cpu_percent: limits.max_cpu_percent,
                max_processes: limits.max_processes,
                cpu_grace_samples: self.settings.cpu_grace_samples,
            },
            self.settings.sample_interval(),
        );

        let started = Instant::now();
        let deadline = tokio::time::sleep(limits.timeout());
        tokio::pin!(deadline);
        let (ending, exited) = tokio::select! {
            // Polled first so a payload is never reaped unobserved.
            biased;
            status = child.wait() => (Ending::Exited, Some(status)),
            Ok(breach) = &mut breach_rx => (Ending::Breach(breach), None),
            () = &mut deadline => (Ending::Timeout, None),
            () = cancel.cancelled() => (Ending::Cancelled, None),
        };
        result.execution_time_ms = started.elapsed().as_millis() as u64;

        let exit = match exited {
            Some(status) => status,
            None => {
                backend.kill(&handle).await;
                reap(&mut child).await
            }
        };
        let oom = matches!(ending, Ending::Exited) && backend.oom_killed(&handle).await;
        if let Some((backend, handle)) = guard.payload.take() {
            backend.teardown(&handle).await;
        }

        let peaks = monitor.stop().await;
        result.peak_memory_mb = peaks.memory_mb();
        result.peak_cpu_percent = peaks.cpu_percent();
        let out = finish(stdout, &stop_capture, OUTPUT_GRACE).await;
        let err = finish(stderr, &stop_capture, OUTPUT_GRACE).await;
        result.stdout = out.text;
        result.stdout_truncated = out.truncated;
        result.stderr = err.text;
        result.stderr_truncated = err.truncated;

        match ending {
            Ending::Breach(breach) => {
                life.advance(SandboxState::ResourceExceeded);
                result.status = ExecutionStatus::ResourceLimit;
                result.error_message = Some(breach.to_string());
            }
            Ending::Timeout => {
                life.advance(SandboxState::TimedOut);
                result.status = ExecutionStatus::Timeout;
                result.error_message = Some(format!(
                    "execution timed out after {}s",
                    limits.timeout_seconds
                ));
            }
            Ending::Cancelled => {
                life.advance(SandboxState::Errored);
                result.status = ExecutionStatus::Cancelled;
                result.error_message = Some("execution cancelled".into());
            }
            Ending::Exited => {
                let status = exit.map_err(|e| RuntimeError::io("wait for payload", e))?;
                result.exit_code = status.code();
                if let Some(reason) = limit_kill_reason(status, oom, limits) {
                    life.advance(SandboxState::ResourceExceeded);
                    result.status = ExecutionStatus::ResourceLimit;
                    result.error_message = Some(reason);
                } else {
                    life.advance(SandboxState::Completed);
                    self.complete(&workspace, &before, status, result)?;
                }
            }
        }
        Ok(())
    }

    /// Records exit status and payload-produced files for a completed run.
    fn complete(
        &self,
        workspace: &Workspace,
        before: &Snapshot,
        status: ExitStatus,
        result: &mut ExecutionResult,
    ) -> Result<(), RuntimeError> {
        if status.success() {
            result.status = ExecutionStatus::Success;
        } else {
            result.status = ExecutionStatus::Failure;
            result.error_message = Some(match status.code() {
                Some(code) => format!("process exited with code {code}"),
                None => format!("process terminated: {status}"),
            });
        }
        let changes = before.diff(&workspace.snapshot()?);
        let rejected = workspace.revalidate(&changes);
        let kept = |paths: &[String]| -> Vec<String> {
            paths
                .iter()
                .filter(|p| !rejected.contains(p))
                .cloned()
                .collect()
        };
        result.files_created = kept(&changes.created);
        result.files_modified = kept(&changes.modified);
        self.metrics
            .record_files_created(result.files_created.len() as u64);
        if !rejected.is_empty() {
            result.warnings.push(format!(
                "{} output file(s) violated the filesystem policy and were removed",
                rejected.len()
            ));
        }
        result.files_rejected = rejected;
        Ok(())
    }

    /// Picks the backend for this run, falling back from container to
    /// process isolation when the preference allows it.
    /// Picks the backend for one run. A networked run needs a backend that
    /// can confine egress to the proxy.
    async fn select_backend(
        &self,
        language: Language,
        network: bool,
        result: &mut ExecutionResult,
    ) -> Result<Arc<dyn IsolationBackend>, RuntimeError> {
        match self.settings.isolation {
            IsolationPreference::Container => {
                self.container_usable(language, network).await?;
                Ok(Arc::clone(&self.container))
            }
            IsolationPreference::Process => {
                self.process.check_available(language).await?;
                Ok(Arc::clone(&self.process))
            }
            IsolationPreference::Auto => match self.container_usable(language, network).await {
                Ok(()) => Ok(Arc::clone(&self.container)),
                Err(e) => {
                    tracing::warn!(reason = %e, "container isolation unusable; falling back to process isolation");
                    self.record_weakened(language.as_str(), &e.to_string(), result);
                    self.metrics.record_fallback();
                    result.warnings.push(format!(
                        "container isolation unavailable ({e}); ran under weaker process isolation"
                    ));
                    self.process.check_available(language).await?;
                    Ok(Arc::clone(&self.process))
                }
            },
        }
    }

    async fn container_usable(&self, language: Language, network: bool) -> Result<(), RuntimeError> {
        self.container.check_available(language).await?;
        if network && !self.container.brokers_egress() {
            return Err(RuntimeError::IsolationUnavailable {
                mode: IsolationMode::Container,
                reason: "containers run without a network; egress cannot be brokered".into(),
            });
        }
        Ok(())
    }

    /// Audits a protection the run goes without.
    fn record_weakened(&self, target: &str, reason: &str, result: &ExecutionResult) {
        self.audit.record(
            AuditLogEntry::new(AuditOperation::IsolationFallback, target, AuditResult::Restricted)
                .with_error(reason)
                .with_execution_id(Some(result.execution_id.clone())),
        );
    }

    async fn install(
        &self,
        backend: &dyn IsolationBackend,
        plan: &LaunchPlan,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let started = Instant::now();
        let outcome = backend
            .install(
                plan,
                &request.requirements,
                self.settings.install_timeout(),
                cancel,
            )
            .await;
        let mut entry = AuditLogEntry::new(
            AuditOperation::InstallRequirements,
            request.requirements.join(" "),
            if outcome.is_ok() {
                AuditResult::Allowed
            } else {
                AuditResult::Error
            },
        )
        .with_duration_ms(started.elapsed().as_millis() as u64)
        .with_metadata("count", request.requirements.len())
        .with_execution_id(Some(plan.execution_id.clone()));
        if let Err(e) = &outcome {
            entry = entry.with_error(e.to_string());
        }
        self.audit.record(entry);
        outcome
    }

    /// Audits and counts the finished execution.
    fn conclude(&self, result: ExecutionResult, request: &ExecutionRequest) -> ExecutionResult {
        let audit_result = match result.status {
            ExecutionStatus::Success | ExecutionStatus::Failure => AuditResult::Allowed,
            ExecutionStatus::Timeout
            | ExecutionStatus::ResourceLimit
            | ExecutionStatus::Cancelled => AuditResult::Restricted,
            ExecutionStatus::Error => AuditResult::Error,
        };
        let mut entry = AuditLogEntry::new(
            AuditOperation::Exec,
            request.language.entry_file(),
            audit_result,
        )
        .with_duration_ms(result.execution_time_ms)
        .with_metadata("status", result.status.as_str())
        .with_metadata("language", request.language.as_str())
        .with_metadata("peak_memory_mb", result.peak_memory_mb)
        .with_metadata("files_created", result.files_created.len())
        .with_metadata("files_rejected", result.files_rejected.len())
        .with_execution_id(Some(result.execution_id.clone()));
        if let Some(code) = result.exit_code {
            entry = entry.with_metadata("exit_code", code);
        }
        if let Some(mode) = result.isolation {
            entry = entry.with_metadata(
                "isolation",
                match mode {
                    IsolationMode::Container => "container",
                    IsolationMode::Process => "process",
                },
            );
        }
        if let Some(message) = &result.error_message {
            entry = entry.with_error(message.clone());
        }
        self.audit.record(entry);
        self.metrics
            .record_outcome(result.status, result.execution_time_ms);
        tracing::info!(
            status = result.status.as_str(),
            exit_code = ?result.exit_code,
            elapsed_ms = result.execution_time_ms,
            peak_memory_mb = result.peak_memory_mb,
            "execution finished"
        );
        result
    }
}

/// Waits for a killed payload, killing it again if it lingers.
async fn reap(child: &mut Child) -> io::Result<ExitStatus> {
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

/// Why an exit that looks natural was really a kernel-enforced limit.
fn limit_kill_reason(status: ExitStatus, oom: bool, limits: &ResourceLimits) -> Option<String> {
    if oom {
        return Some(format!(
            "killed by the OOM killer: memory limit {} MB",
            limits.max_memory_mb
        ));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(sig) if sig == SIGXCPU => {
                return Some("CPU time limit exceeded".into());
            }
            Some(sig) if sig == SIGXFSZ => {
                return Some("file size limit exceeded".into());
            }
            _ => {}
        }
    }
    #[cfg(not(unix))]
    let _ = status;
    None
}

#[cfg(unix)]
const SIGXCPU: i32 = nix::sys::signal::Signal::SIGXCPU as i32;
#[cfg(unix)]
const SIGXFSZ: i32 = nix::sys::signal::Signal::SIGXFSZ as i32;
