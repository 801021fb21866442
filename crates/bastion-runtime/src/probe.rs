//! Resource sampling for running payloads.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;

use crate::process::process_tree;

/// One resource reading for a whole payload.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    /// Resident memory summed over the payload's processes.
    pub memory_bytes: u64,
    /// CPU usage summed over the payload's processes; 100 = one core.
    pub cpu_percent: f64,
    /// Number of live processes.
    pub processes: usize,
}

/// Reads current resource usage of one payload.
#[async_trait]
pub trait ResourceProbe: Send + Sync + fmt::Debug {
    /// Takes a sample. `None` when the payload is gone or unreadable.
    async fn sample(&self) -> Option<ResourceSample>;
}

/// Samples a process tree through the OS process table.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// reports 0%.
#[derive(Debug, Clone)]
pub struct ProcessTreeProbe {
    root: u32,
    excluded: Option<u32>,
    system: Arc<Mutex<System>>,
}

impl ProcessTreeProbe {
    pub fn new(root: u32) -> Self {
        Self {
            root,
            excluded: None,
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Leaves the subtree rooted at `pid` out of every sample.
    pub fn excluding(mut self, pid: Option<u32>) -> Self {
        self.excluded = pid;
        self
    }
}

#[async_trait]
impl ResourceProbe for ProcessTreeProbe {
    async fn sample(&self) -> Option<ResourceSample> {
        let system = Arc::clone(&self.system);
        let root = Pid::from_u32(self.root);
        let excluded = self.excluded.map(Pid::from_u32);
        tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_processes(ProcessesToUpdate::All, true);
            let mut tree = process_tree(&system, root);
            if let Some(excluded) = excluded {
                let skip = process_tree(&system, excluded);
                tree.retain(|pid| !skip.contains(pid));
            }
            if tree.is_empty() {
                return None;
            }
            let mut sample = ResourceSample {
                processes: tree.len(),
                ..ResourceSample::default()
            };
            for pid in tree {
                if let Some(process) = system.process(pid) {
                    sample.memory_bytes += process.memory();
                    sample.cpu_percent += f64::from(process.cpu_usage());
                }
            }
            Some(sample)
        })
        .await
        .ok()
        .flatten()
    }
}

/// Samples a container through `<runtime> stats`.
#[derive(Debug, Clone)]
pub struct ContainerProbe {
    runtime: String,
    container: String,
}

impl ContainerProbe {
    pub fn new(runtime: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            container: container.into(),
        }
    }
}

#[async_trait]
impl ResourceProbe for ContainerProbe {
    async fn sample(&self) -> Option<ResourceSample> {
        let output = tokio::time::timeout(
            Duration::from_secs(5),
            Command::new(&self.runtime)
                .args([
                    "stats",
                    "--no-stream",
                    "--format",
                    "{{.MemUsage}}|{{.CPUPerc}}|{{.PIDs}}",
                    &self.container,
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_stats_line(String::from_utf8_lossy(&output.stdout).trim())
    }
}

/// Parses `"12.5MiB / 256MiB|3.02%|4"`.
pub fn parse_stats_line(line: &str) -> Option<ResourceSample> {
    let mut fields = line.split('|');
    let memory = fields.next()?.split('/').next()?.trim();
    let cpu = fields.next()?.trim().trim_end_matches('%');
    let processes = fields.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    Some(ResourceSample {
        memory_bytes: parse_size(memory)?,
        cpu_percent: cpu.parse().ok()?,
        processes,
    })
}

/// Parses a human size as printed by container runtimes (`512KiB`, `1.5GB`).
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    if value.is_sign_negative() || !value.is_finite() {
        return None;
    }
    Some((value * multiplier) as u64)
}
