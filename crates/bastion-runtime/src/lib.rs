//! # bastion-runtime
//!
//! Execution sandbox and the `SafetyManager` facade.
//!
//! Use [`SafetyManager`] to run untrusted code and perform mediated file
//! and network operations under one session policy, or
//! [`ExecutionSandbox`] directly to drive a single payload.

pub mod error;
pub mod isolation;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod netns;
pub mod output;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod requirements;
pub mod sandbox;
pub mod scheduler;
pub mod workspace;

pub use error::RuntimeError;
pub use isolation::{ContainerBackend, IsolationBackend, ProcessBackend};
pub use manager::{FileOp, FileOpOutput, NetOp, NetOpOutput, SafetyManager, SafetyManagerBuilder, Statistics};
pub use metrics::{ExecutionMetrics, MetricsSnapshot};
pub use monitor::{Breach, MonitorLimits};
pub use probe::{ResourceProbe, ResourceSample};
pub use proxy::EgressProxy;
pub use sandbox::{new_execution_id, ExecutionSandbox};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use workspace::{Changes, Snapshot, Workspace};
