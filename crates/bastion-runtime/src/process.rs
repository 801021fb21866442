//! Process-group, rlimit and environment helpers for payload processes.
//!
//! A payload starts in its own session (and so its own process group) with
//! a parent-death signal, hard rlimits, its network confinement and a
//! scrubbed environment. Killing
//! targets the group and every descendant found by a process-table scan, so
//! children that changed group are still reached.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;

use crate::netns::NetworkConfinement;

/// Search path handed to payloads, after the interpreter's own directory.
pub const BASE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Hard limits applied in the child before `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    /// `RLIMIT_AS`; `None` for JIT runtimes that reserve large address space.
    pub address_space_bytes: Option<u64>,
    /// `RLIMIT_CPU`.
    pub cpu_seconds: u64,
    /// `RLIMIT_NOFILE`.
    pub open_files: u64,
    /// `RLIMIT_FSIZE`.
    pub file_size_bytes: u64,
    /// Network namespace setup. Failing to apply it fails the spawn.
    pub network: NetworkConfinement,
}

/// Installs the `pre_exec` hook that puts the child in its own session and
/// applies `limits`.
#[cfg(unix)]
pub fn harden_command(cmd: &mut Command, limits: ProcessLimits) {
    let parent = nix::unistd::getpid();
    // SAFETY: the hook only makes async-signal-safe syscalls (setsid, prctl,
    // getppid, setrlimit, unshare, socket calls, fork) and allocates nothing.
    unsafe {
        cmd.pre_exec(move || apply_in_child(&limits, parent));
    }
}

#[cfg(not(unix))]
pub fn harden_command(_cmd: &mut Command, _limits: ProcessLimits) {}

#[cfg(unix)]
fn apply_in_child(limits: &ProcessLimits, parent: nix::unistd::Pid) -> io::Result<()> {
    use nix::sys::resource::Resource;

    nix::unistd::setsid()?;
    #[cfg(target_os = "linux")]
    {
        nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)?;
        if nix::unistd::getppid() != parent {
            return Err(io::Error::other("parent exited before exec"));
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = parent;

    // Before the rlimits, which the forwarder must not inherit.
    crate::netns::confine(&limits.network)?;
    lower_limit(Resource::RLIMIT_CORE, 0, 0)?;
    // SIGXCPU at the soft limit, SIGKILL one second later.
    lower_limit(Resource::RLIMIT_CPU, limits.cpu_seconds, 1)?;
    lower_limit(Resource::RLIMIT_NOFILE, limits.open_files, 0)?;
    lower_limit(Resource::RLIMIT_FSIZE, limits.file_size_bytes, 0)?;
    if let Some(bytes) = limits.address_space_bytes {
        lower_limit(Resource::RLIMIT_AS, bytes, 0)?;
    }
    Ok(())
}

/// Sets the soft limit to `value` and the hard limit `slack` above it,
/// never above the current hard limit.
#[cfg(unix)]
fn lower_limit(resource: nix::sys::resource::Resource, value: u64, slack: u64) -> io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = getrlimit(resource)?;
    let new_hard = value.saturating_add(slack).min(hard);
    setrlimit(resource, value.min(new_hard), new_hard)?;
    Ok(())
}

/// Every live process in the tree rooted at `root`, root included.
pub fn process_tree(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }
    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|k| !seen.contains(*k)));
        }
    }
    seen.into_iter()
        .filter(|pid| system.process(*pid).is_some())
        .collect()
}

/// SIGKILLs the process group led by `pid` and every descendant of `pid`.
///
/// Blocking: scans the process table. Missing processes are not an error.
pub fn kill_tree(pid: u32) {
    let root = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let tree = process_tree(&system, root);

    #[cfg(unix)]
    if let Err(e) = kill_group(pid) {
        tracing::debug!(pid, error = %e, "process group kill failed");
    }

    for member in tree {
        if let Some(process) = system.process(member) {
            process.kill();
        }
    }
}

/// SIGKILLs the process group `pgid`. A group that no longer exists is fine.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as NixPid;

    let pgid = i32::try_from(pgid).map_err(|_| io::Error::other("pid out of range"))?;
    match killpg(NixPid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> io::Result<()> {
    Ok(())
}

/// Whether a process with `pid` is still running. Zombies count as dead.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|p| p.status() != ProcessStatus::Zombie)
}

/// Environment handed to a payload. Nothing is inherited from the host.
pub fn scrubbed_env(
    home: &Path,
    interpreter_dir: Option<&Path>,
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    let path = match interpreter_dir {
        Some(dir) => format!("{}:{BASE_PATH}", dir.display()),
        None => BASE_PATH.to_string(),
    };
    let mut env = vec![
        ("PATH".to_string(), path),
        ("HOME".to_string(), home.display().to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("LC_ALL".to_string(), "C.UTF-8".to_string()),
    ];
    env.extend(extra.iter().cloned());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubbed_env_sets_path_and_home_only() {
        let env = scrubbed_env(Path::new("/work"), Some(Path::new("/opt/py/bin")), &[]);
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("PATH").as_deref(), Some("/opt/py/bin:/usr/local/bin:/usr/bin:/bin"));
        assert_eq!(get("HOME").as_deref(), Some("/work"));
        assert!(get("LD_PRELOAD").is_none());
        assert!(get("AWS_SECRET_ACCESS_KEY").is_none());
    }

    #[test]
    fn extra_env_is_appended() {
        let env = scrubbed_env(
            Path::new("/w"),
            None,
            &[("PYTHONUNBUFFERED".into(), "1".into())],
        );
        assert!(env.iter().any(|(k, v)| k == "PYTHONUNBUFFERED" && v == "1"));
        assert_eq!(env[0].1, BASE_PATH);
    }

    #[test]
    fn current_process_is_alive_and_in_its_own_tree() {
        let me = std::process::id();
        assert!(is_alive(me));
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let tree = process_tree(&system, Pid::from_u32(me));
        assert!(tree.contains(&Pid::from_u32(me)));
    }

    #[test]
    fn unknown_pid_has_empty_tree() {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        assert!(process_tree(&system, Pid::from_u32(u32::MAX - 7)).is_empty());
    }
}
