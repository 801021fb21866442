//! Process-group isolation.
//!
//! The payload runs as a plain child of this process, in its own session,
//! under hard rlimits, with a scrubbed environment and `HOME`/`TMPDIR`
//! inside the working directory. Where the host allows unprivileged
//! namespaces the payload also gets its own network namespace: empty when
//! offline, and reaching only the egress proxy when networked. Still weaker
//! than a container: the payload shares the host filesystem view and user.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bastion_types::{IsolationMode, Language};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{
    language_env, proxy_env, wait_installer, InstallEnd, IsolationBackend, LaunchPlan, Launched,
    PayloadHandle, DEPS_DIR, TMP_DIR,
};
use crate::error::RuntimeError;
use crate::netns::{self, NetworkConfinement, FORWARD_PORT};
use crate::output::{capture, finish, tail};
use crate::probe::{ProcessTreeProbe, ResourceProbe};
use crate::process::{harden_command, kill_group, kill_tree, scrubbed_env, ProcessLimits};
use crate::requirements::{deps_env, installer_argv};

/// Open-file ceiling for payload processes.
const PAYLOAD_OPEN_FILES: u64 = 256;
/// Open-file ceiling for package installers.
const INSTALLER_OPEN_FILES: u64 = 1024;

/// Runs payloads as hardened child process trees.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    namespaces: Option<bool>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips the host check and takes namespace support as given.
    pub fn assume_namespaces(mut self, available: bool) -> Self {
        self.namespaces = Some(available);
        self
    }

    async fn namespaces(&self) -> bool {
        match self.namespaces {
            Some(available) => available,
            None => netns::namespaces_available().await,
        }
    }

    fn interpreter(language: Language) -> Result<std::path::PathBuf, RuntimeError> {
        which::which(language.interpreter()).map_err(|e| RuntimeError::IsolationUnavailable {
            mode: IsolationMode::Process,
            reason: format!("{} not found: {e}", language.interpreter()),
        })
    }
}

/// CPU seconds a payload may burn: the wall timeout times the cores its CPU
/// limit allows, plus one second of slack.
pub fn cpu_seconds_for(timeout_seconds: u64, max_cpu_percent: u32) -> u64 {
    let cores = u64::from(max_cpu_percent.div_ceil(100)).max(1);
    timeout_seconds.saturating_mul(cores).saturating_add(1)
}

fn payload_env(plan: &LaunchPlan, interpreter_dir: Option<&Path>) -> Vec<(String, String)> {
    let mut extra = language_env(plan.language);
    extra.push((
        "TMPDIR".into(),
        plan.workdir.join(TMP_DIR).display().to_string(),
    ));
    if plan.with_deps {
        let deps = plan.workdir.join(DEPS_DIR);
        extra.extend(deps_env(plan.language, &deps.display().to_string()));
    }
    if plan.proxy_socket.is_some() {
        extra.extend(proxy_env(&format!("http://127.0.0.1:{FORWARD_PORT}")));
    }
    scrubbed_env(&plan.workdir, interpreter_dir, &extra)
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn mode(&self) -> IsolationMode {
        IsolationMode::Process
    }

    async fn check_available(&self, language: Language) -> Result<(), RuntimeError> {
        Self::interpreter(language).map(|_| ())
    }

    fn brokers_egress(&self) -> bool {
        true
    }

    #[tracing::instrument(skip_all, fields(execution_id = %plan.execution_id))]
    async fn install(
        &self,
        plan: &LaunchPlan,
        requirements: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let deps = plan.workdir.join(DEPS_DIR);
        let tmp = plan.workdir.join(TMP_DIR);
        for dir in [&deps, &tmp] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RuntimeError::io("create dependency dir", e))?;
        }
        let argv = installer_argv(plan.language, &deps.display().to_string(), requirements)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(RuntimeError::invalid("empty installer command"));
        };
        let program = which::which(program).map_err(|e| RuntimeError::Install {
            reason: format!("{program} not found: {e}"),
        })?;

        let env = scrubbed_env(
            &plan.workdir,
            program.parent(),
            &[("TMPDIR".into(), tmp.display().to_string())],
        );
        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(&plan.workdir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        harden_command(
            &mut cmd,
            ProcessLimits {
                address_space_bytes: None,
                cpu_seconds: timeout.as_secs().saturating_add(1),
                open_files: INSTALLER_OPEN_FILES,
                file_size_bytes: u64::MAX,
                network: NetworkConfinement::Host,
            },
        );

        tracing::info!(count = requirements.len(), "installing requirements");
        let mut child = cmd.spawn().map_err(|e| RuntimeError::Install {
            reason: format!("failed to start {}: {e}", program.display()),
        })?;
        let pid = child.id();
        let stop = CancellationToken::new();
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(capture(s, 16 * 1024, stop.clone())));

        let end = wait_installer(&mut child, timeout, cancel).await;
        if let Some(pid) = pid {
            match end {
                // Reaped: only the group is still safe to address.
                InstallEnd::Exited(_) => {
                    let _ = kill_group(pid);
                }
                InstallEnd::TimedOut | InstallEnd::Cancelled => {
                    let _ = tokio::task::spawn_blocking(move || kill_tree(pid)).await;
                }
            }
        }
        let _ = child.wait().await;
        let stderr = finish(stderr, &stop, Duration::from_secs(2)).await;

        match end {
            InstallEnd::Exited(Ok(status)) if status.success() => Ok(()),
            InstallEnd::Exited(Ok(status)) => Err(RuntimeError::Install {
                reason: format!("installer exited with {status}: {}", tail(&stderr.text, 2000)),
            }),
            InstallEnd::Exited(Err(e)) => Err(RuntimeError::io("wait for installer", e)),
            InstallEnd::TimedOut => Err(RuntimeError::Install {
                reason: format!("timed out after {}s", timeout.as_secs()),
            }),
            InstallEnd::Cancelled => Err(RuntimeError::Cancelled),
        }
    }

    #[tracing::instrument(skip_all, fields(execution_id = %plan.execution_id))]
    async fn launch(&self, plan: &LaunchPlan) -> Result<Launched, RuntimeError> {
        let interpreter = Self::interpreter(plan.language)?;
        let namespaces = self.namespaces().await;
        if plan.proxy_socket.is_some() && !namespaces {
            return Err(RuntimeError::IsolationUnavailable {
                mode: IsolationMode::Process,
                reason: "network namespaces unavailable; egress cannot be confined to the proxy"
                    .into(),
            });
        }
        tokio::fs::create_dir_all(plan.workdir.join(TMP_DIR))
            .await
            .map_err(|e| RuntimeError::io("create payload tmp dir", e))?;

        let mut weakened = Vec::new();
        let mut report = None;
        let network = match &plan.proxy_socket {
            Some(socket) => {
                let bridge = netns::ProxyBridge::new(socket)
                    .map_err(|e| RuntimeError::io("prepare proxy bridge", e))?;
                #[cfg(unix)]
                let bridge = {
                    let pipe =
                        netns::PidReport::new().map_err(|e| RuntimeError::io("pid pipe", e))?;
                    let bridge = bridge.reporting_to(pipe.write_fd());
                    report = Some(pipe);
                    bridge
                };
                NetworkConfinement::Brokered(bridge)
            }
            None if namespaces => NetworkConfinement::Offline,
            None => {
                tracing::warn!("network namespaces unavailable; payload keeps the host network");
                weakened.push(
                    "network namespaces unavailable; offline payload keeps the host network"
                        .to_string(),
                );
                NetworkConfinement::Host
            }
        };

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&plan.entry)
            .current_dir(&plan.workdir)
            .env_clear()
            .envs(payload_env(plan, interpreter.parent()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limits = ProcessLimits {
            address_space_bytes: plan
                .language
                .supports_address_space_limit()
                .then(|| plan.limits.max_memory_bytes()),
            cpu_seconds: cpu_seconds_for(plan.limits.timeout_seconds, plan.limits.max_cpu_percent),
            open_files: PAYLOAD_OPEN_FILES,
            file_size_bytes: plan.max_file_size_bytes,
            network,
        };
        harden_command(&mut cmd, limits);

        let child = cmd.spawn().map_err(|e| RuntimeError::Launch {
            reason: format!("failed to start {}: {e}", interpreter.display()),
        })?;
        let pid = child.id().ok_or_else(|| RuntimeError::Launch {
            reason: "payload exited before it could be tracked".into(),
        })?;
        let forwarder = match report {
            Some(pipe) => Some(pipe.receive().map_err(|e| RuntimeError::Launch {
                reason: format!("egress forwarder did not report: {e}"),
            })?),
            None => None,
        };
        tracing::debug!(pid, ?forwarder, interpreter = %interpreter.display(), "payload started");

        Ok(Launched {
            child,
            handle: PayloadHandle::Process { pid, forwarder },
            weakened,
        })
    }

    fn probe(&self, handle: &PayloadHandle) -> Arc<dyn ResourceProbe> {
        match *handle {
            PayloadHandle::Process { pid, forwarder } => {
                Arc::new(ProcessTreeProbe::new(pid).excluding(forwarder))
            }
            PayloadHandle::Container { .. } => Arc::new(ProcessTreeProbe::new(0)),
        }
    }

    /// Must run before the payload's root process is reaped, while its pid
    /// still names it.
    async fn kill(&self, handle: &PayloadHandle) {
        if let PayloadHandle::Process { pid, .. } = *handle {
            let _ = tokio::task::spawn_blocking(move || kill_tree(pid)).await;
        }
    }

    async fn teardown(&self, handle: &PayloadHandle) {
        self.abandon(handle);
    }

    fn abandon(&self, handle: &PayloadHandle) {
        if let PayloadHandle::Process { pid, .. } = *handle {
            if let Err(e) = kill_group(pid) {
                tracing::debug!(pid, error = %e, "payload group kill failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_budget_scales_with_cores() {
        assert_eq!(cpu_seconds_for(10, 100), 11);
        assert_eq!(cpu_seconds_for(10, 50), 11);
        assert_eq!(cpu_seconds_for(10, 250), 31);
        assert_eq!(cpu_seconds_for(10, 0), 11);
    }

    #[test]
    fn env_points_home_and_tmp_into_workdir() {
        let plan = LaunchPlan {
            execution_id: "exec-1".into(),
            language: Language::Python,
            workdir: "/w".into(),
            entry: "main.py".into(),
            limits: Default::default(),
            max_file_size_bytes: 1024,
            proxy_socket: Some("/w/.bastion_proxy.sock".into()),
            with_deps: true,
        };
        let env = payload_env(&plan, None);
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("HOME").as_deref(), Some("/w"));
        assert_eq!(get("TMPDIR").as_deref(), Some("/w/.bastion_tmp"));
        assert_eq!(get("PYTHONPATH").as_deref(), Some("/w/.bastion_deps"));
        assert_eq!(get("HTTP_PROXY").as_deref(), Some("http://127.0.0.1:3128"));
    }

    #[test]
    fn env_without_network_has_no_proxy() {
        let plan = LaunchPlan {
            execution_id: "exec-1".into(),
            language: Language::Shell,
            workdir: "/w".into(),
            entry: "main.sh".into(),
            limits: Default::default(),
            max_file_size_bytes: 1024,
            proxy_socket: None,
            with_deps: false,
        };
        let env = payload_env(&plan, None);
        assert!(!env.iter().any(|(k, _)| k == "HTTP_PROXY"));
    }
}
