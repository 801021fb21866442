//! Container isolation through a docker-compatible CLI.
//!
//! Each payload runs in a fresh container: read-only root, a tmpfs `/tmp`,
//! the working directory bind-mounted at `/work`, all capabilities dropped,
//! memory/CPU/pid limits enforced by the runtime's cgroups, and no network
//! at all. Networked payloads are never given to this backend.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bastion_types::{IsolationMode, Language, SandboxSettings};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::{
    language_env, wait_installer, InstallEnd, IsolationBackend, LaunchPlan, Launched,
    PayloadHandle, DEPS_DIR,
};
use crate::error::RuntimeError;
use crate::output::{capture, finish, tail};
use crate::probe::{ContainerProbe, ResourceProbe};
use crate::requirements::{deps_env, installer_argv};

/// Mount point of the working directory inside the container.
pub const CONTAINER_WORKDIR: &str = "/work";
/// Uid/gid payloads run as when the supervisor itself is root.
const NOBODY: &str = "65534:65534";
/// Timeout for short runtime CLI calls (kill, rm, inspect).
const CLI_TIMEOUT: Duration = Duration::from_secs(10);

/// Images per payload language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub python: String,
    pub node: String,
    pub shell: String,
    pub ruby: String,
}

impl ImageSet {
    pub fn for_language(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python,
            Language::JavaScript => &self.node,
            Language::Shell => &self.shell,
            Language::Ruby => &self.ruby,
        }
    }
}

/// Runs payloads in throwaway containers.
#[derive(Debug)]
pub struct ContainerBackend {
    runtime: String,
    images: ImageSet,
    available: OnceCell<Result<PathBuf, String>>,
}

impl ContainerBackend {
    pub fn new(runtime: impl Into<String>, images: ImageSet) -> Self {
        Self {
            runtime: runtime.into(),
            images,
            available: OnceCell::new(),
        }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(
            settings.container_runtime.clone(),
            ImageSet {
                python: settings.python_image.clone(),
                node: settings.node_image.clone(),
                shell: settings.shell_image.clone(),
                ruby: settings.ruby_image.clone(),
            },
        )
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Resolves the runtime binary and checks that its daemon answers.
    /// Probed once per backend.
    async fn runtime_path(&self) -> Result<&Path, RuntimeError> {
        let probed = self
            .available
            .get_or_init(|| async {
                let path = which::which(&self.runtime)
                    .map_err(|e| format!("{} not found: {e}", self.runtime))?;
                let output = tokio::time::timeout(
                    CLI_TIMEOUT,
                    Command::new(&path)
                        .args(["version", "--format", "{{.Server.Version}}"])
                        .stdin(Stdio::null())
                        .kill_on_drop(true)
                        .output(),
                )
                .await
                .map_err(|_| format!("{} version timed out", self.runtime))?
                .map_err(|e| format!("{} version failed: {e}", self.runtime))?;
                if !output.status.success() {
                    return Err(format!(
                        "{} daemon unreachable: {}",
                        self.runtime,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                tracing::debug!(
                    runtime = %self.runtime,
                    server = %String::from_utf8_lossy(&output.stdout).trim(),
                    "container runtime available"
                );
                Ok(path)
            })
            .await;
        probed
            .as_deref()
            .map_err(|reason| RuntimeError::IsolationUnavailable {
                mode: IsolationMode::Container,
                reason: reason.clone(),
            })
    }

    /// Runs a short runtime command, ignoring failures.
    async fn quiet(&self, args: &[&str]) -> Option<std::process::Output> {
        tokio::time::timeout(
            CLI_TIMEOUT,
            Command::new(&self.runtime)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()
    }
}

/// Container name for an execution.
pub fn container_name(execution_id: &str) -> String {
    format!("bastion-{execution_id}")
}

/// `--user` value for payload containers, preparing `workdir` so that user
/// can write to it.
#[cfg(unix)]
fn container_user(workdir: &Path) -> Result<String, RuntimeError> {
    use std::os::unix::fs::PermissionsExt;

    let uid = nix::unistd::getuid();
    if !uid.is_root() {
        return Ok(format!("{}:{}", uid.as_raw(), nix::unistd::getgid().as_raw()));
    }
    for entry in walkdir::WalkDir::new(workdir).follow_links(false) {
        let entry = entry.map_err(|e| RuntimeError::io("open workdir", e.into()))?;
        if entry.file_type().is_dir() {
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o777))
                .map_err(|e| RuntimeError::io("open workdir", e))?;
        }
    }
    Ok(NOBODY.to_string())
}

#[cfg(not(unix))]
fn container_user(_workdir: &Path) -> Result<String, RuntimeError> {
    Ok(NOBODY.to_string())
}

/// Environment a payload container gets.
fn container_env(plan: &LaunchPlan) -> Vec<(String, String)> {
    let mut env = vec![
        ("HOME".to_string(), CONTAINER_WORKDIR.to_string()),
        ("TMPDIR".to_string(), "/tmp".to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ];
    env.extend(language_env(plan.language));
    if plan.with_deps {
        env.extend(deps_env(
            plan.language,
            &format!("{CONTAINER_WORKDIR}/{DEPS_DIR}"),
        ));
    }
    env
}

/// Arguments to `<runtime>` that start the payload described by `plan`.
pub fn run_args(plan: &LaunchPlan, name: &str, image: &str, user: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--name".into(),
        name.into(),
        "--label".into(),
        format!("bastion.execution={}", plan.execution_id),
        "--network".into(),
        "none".into(),
        "--read-only".into(),
        "--tmpfs".into(),
        "/tmp:rw,nosuid,nodev,size=64m".into(),
        "--memory".into(),
        format!("{}m", plan.limits.max_memory_mb),
        "--memory-swap".into(),
        format!("{}m", plan.limits.max_memory_mb),
    ];
    if plan.limits.max_cpu_percent > 0 {
        args.extend([
            "--cpus".into(),
            format!("{:.2}", f64::from(plan.limits.max_cpu_percent) / 100.0),
        ]);
    }
    if plan.limits.max_processes > 0 {
        args.extend(["--pids-limit".into(), plan.limits.max_processes.to_string()]);
    }
    args.extend([
        "--ulimit".into(),
        "nofile=256:256".into(),
        "--ulimit".into(),
        "core=0:0".into(),
        "--ulimit".into(),
        format!("fsize={0}:{0}", plan.max_file_size_bytes),
        "--user".into(),
        user.into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "-w".into(),
        CONTAINER_WORKDIR.into(),
        "-v".into(),
        format!("{}:{CONTAINER_WORKDIR}", plan.workdir.display()),
    ]);
    for (key, value) in container_env(plan) {
        args.extend(["-e".into(), format!("{key}={value}")]);
    }
    args.extend([
        image.into(),
        plan.language.interpreter().into(),
        plan.entry.clone(),
    ]);
    args
}

/// Arguments that install `requirements` into the mounted deps dir.
pub fn install_args(
    plan: &LaunchPlan,
    name: &str,
    image: &str,
    user: &str,
    requirements: &[String],
) -> Result<Vec<String>, RuntimeError> {
    let deps = format!("{CONTAINER_WORKDIR}/{DEPS_DIR}");
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        name.into(),
        "--label".into(),
        format!("bastion.execution={}", plan.execution_id),
        "--network".into(),
        "bridge".into(),
        "--memory".into(),
        format!("{}m", plan.limits.max_memory_mb.max(256)),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--user".into(),
        user.into(),
        "-w".into(),
        CONTAINER_WORKDIR.into(),
        "-v".into(),
        format!("{}:{CONTAINER_WORKDIR}", plan.workdir.display()),
        "-e".into(),
        format!("HOME={CONTAINER_WORKDIR}"),
        image.into(),
    ];
    args.extend(installer_argv(plan.language, &deps, requirements)?);
    Ok(args)
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn mode(&self) -> IsolationMode {
        IsolationMode::Container
    }

    async fn check_available(&self, _language: Language) -> Result<(), RuntimeError> {
        self.runtime_path().await.map(|_| ())
    }

    #[tracing::instrument(skip_all, fields(execution_id = %plan.execution_id))]
    async fn install(
        &self,
        plan: &LaunchPlan,
        requirements: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let runtime = self.runtime_path().await?.to_path_buf();
        tokio::fs::create_dir_all(plan.workdir.join(DEPS_DIR))
            .await
            .map_err(|e| RuntimeError::io("create dependency dir", e))?;
        let user = container_user(&plan.workdir)?;
        let name = format!("{}-install", container_name(&plan.execution_id));
        let args = install_args(
            plan,
            &name,
            self.images.for_language(plan.language),
            &user,
            requirements,
        )?;

        tracing::info!(count = requirements.len(), "installing requirements in container");
        let mut child = Command::new(&runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Install {
                reason: format!("failed to start {}: {e}", self.runtime),
            })?;
        let stop = CancellationToken::new();
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(capture(s, 16 * 1024, stop.clone())));

        let end = wait_installer(&mut child, timeout, cancel).await;
        if !matches!(end, InstallEnd::Exited(_)) {
            self.quiet(&["kill", &name]).await;
            self.quiet(&["rm", "-f", &name]).await;
            let _ = child.wait().await;
        }
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
        if plan.proxy_socket.is_some() {
            return Err(RuntimeError::IsolationUnavailable {
                mode: IsolationMode::Container,
                reason: "containers run without a network; egress cannot be brokered".into(),
            });
        }
        let runtime = self.runtime_path().await?.to_path_buf();
        let user = container_user(&plan.workdir)?;
        let name = container_name(&plan.execution_id);
        let image = self.images.for_language(plan.language);
        let args = run_args(plan, &name, image, &user);

        let child = Command::new(&runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Launch {
                reason: format!("failed to start {}: {e}", self.runtime),
            })?;
        tracing::debug!(container = %name, image, "payload container started");

        Ok(Launched {
            child,
            handle: PayloadHandle::Container { name },
            weakened: Vec::new(),
        })
    }

    fn probe(&self, handle: &PayloadHandle) -> Arc<dyn ResourceProbe> {
        let name = match handle {
            PayloadHandle::Container { name } => name.clone(),
            PayloadHandle::Process { pid, .. } => pid.to_string(),
        };
        Arc::new(ContainerProbe::new(self.runtime.clone(), name))
    }

    async fn kill(&self, handle: &PayloadHandle) {
        if let PayloadHandle::Container { name } = handle {
            self.quiet(&["kill", name]).await;
        }
    }

    async fn oom_killed(&self, handle: &PayloadHandle) -> bool {
        let PayloadHandle::Container { name } = handle else {
            return false;
        };
        self.quiet(&["inspect", "--format", "{{.State.OOMKilled}}", name])
            .await
            .is_some_and(|out| String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    async fn teardown(&self, handle: &PayloadHandle) {
        if let PayloadHandle::Container { name } = handle {
            match self.quiet(&["rm", "-f", name]).await {
                Some(out) if out.status.success() => {}
                _ => tracing::warn!(container = %name, "container removal failed"),
            }
        }
    }

    fn abandon(&self, handle: &PayloadHandle) {
        if let PayloadHandle::Container { name } = handle {
            let runtime = self.runtime.clone();
            let name = name.clone();
            std::thread::spawn(move || {
                let _ = std::process::Command::new(runtime)
                    .args(["rm", "-f", &name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            });
        }
    }
}
