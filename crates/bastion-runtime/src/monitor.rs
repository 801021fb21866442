//! Resource monitor for a running payload.
//!
//! Samples a [`ResourceProbe`] on a fixed interval, records peaks, and
//! reports the first limit breach. The sandbox kills the payload on a
//! breach; the monitor itself never kills anything.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::probe::ResourceProbe;

/// Limits the monitor enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorLimits {
    pub max_memory_bytes: u64,
    /// Percent of one core; 0 disables the check.
    pub max_cpu_percent: u32,
    /// 0 disables the check.
    pub max_processes: u32,
    /// Consecutive over-limit CPU samples tolerated.
    pub cpu_grace_samples: u32,
}

/// The limit a payload broke.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Breach {
    Memory { used_bytes: u64, limit_bytes: u64 },
    Cpu { percent: f64, limit: u32 },
    Processes { count: usize, limit: u32 },
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MB: f64 = 1024.0 * 1024.0;
        match self {
            Self::Memory {
                used_bytes,
                limit_bytes,
            } => write!(
                f,
                "memory limit exceeded: {:.1} MB used, limit {:.0} MB",
                *used_bytes as f64 / MB,
                *limit_bytes as f64 / MB
            ),
            Self::Cpu { percent, limit } => {
                write!(f, "CPU limit exceeded: {percent:.1}% sustained, limit {limit}%")
            }
            Self::Processes { count, limit } => {
                write!(f, "process limit exceeded: {count} processes, limit {limit}")
            }
        }
    }
}

/// Peak usage seen so far. Shared between the monitor task and the sandbox.
#[derive(Debug, Default)]
pub struct Peaks {
    memory_bytes: AtomicU64,
    cpu_millipercent: AtomicU64,
}

impl Peaks {
    fn observe(&self, memory_bytes: u64, cpu_percent: f64) {
        self.memory_bytes.fetch_max(memory_bytes, Ordering::Relaxed);
        let milli = (cpu_percent.max(0.0) * 1000.0) as u64;
        self.cpu_millipercent.fetch_max(milli, Ordering::Relaxed);
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0)
    }

    pub fn cpu_percent(&self) -> f64 {
        self.cpu_millipercent.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct Monitor {
    peaks: Arc<Peaks>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Starts sampling `probe` every `interval`. The first breach is sent on
    /// the returned receiver, after which the monitor stops.
    pub fn spawn(
        probe: Arc<dyn ResourceProbe>,
        limits: MonitorLimits,
        interval: Duration,
    ) -> (Self, oneshot::Receiver<Breach>) {
        let peaks = Arc::new(Peaks::default());
        let stop = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run(
            probe,
            limits,
            interval,
            Arc::clone(&peaks),
            stop.clone(),
            tx,
        ));
        (
            Self {
                peaks,
                stop,
                task: Some(task),
            },
            rx,
        )
    }

    pub fn peaks(&self) -> &Peaks {
        &self.peaks
    }

    /// Stops sampling and waits for the task to finish.
    pub async fn stop(mut self) -> Arc<Peaks> {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Arc::clone(&self.peaks)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(
    probe: Arc<dyn ResourceProbe>,
    limits: MonitorLimits,
    interval: Duration,
    peaks: Arc<Peaks>,
    stop: CancellationToken,
    breach_tx: oneshot::Sender<Breach>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut cpu_over = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = stop.cancelled() => return,
        }
        let Some(sample) = probe.sample().await else {
            continue;
        };
        peaks.observe(sample.memory_bytes, sample.cpu_percent);

        let breach = if sample.memory_bytes > limits.max_memory_bytes {
            Some(Breach::Memory {
                used_bytes: sample.memory_bytes,
                limit_bytes: limits.max_memory_bytes,
            })
        } else if limits.max_processes > 0 && sample.processes > limits.max_processes as usize {
            Some(Breach::Processes {
                count: sample.processes,
                limit: limits.max_processes,
            })
        } else if limits.max_cpu_percent > 0 && sample.cpu_percent > f64::from(limits.max_cpu_percent) {
            cpu_over += 1;
            (cpu_over > limits.cpu_grace_samples).then_some(Breach::Cpu {
                percent: sample.cpu_percent,
                limit: limits.max_cpu_percent,
            })
        } else {
            cpu_over = 0;
            None
        };

        if let Some(breach) = breach {
            tracing::info!(%breach, "resource limit breached");
            let _ = breach_tx.send(breach);
            return;
        }
    }
}
