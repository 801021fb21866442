//! End-to-end sandbox runs under process isolation.
//!
//! Shell payloads only need `/bin/sh`; Python and container runs are
//! skipped when the interpreter or runtime is missing.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bastion_runtime::process::is_alive;
use bastion_runtime::{ContainerBackend, IsolationBackend, ProcessBackend, SafetyManager};
use bastion_types::{
    AuditOperation, AuditResult, ExecutionRequest, ExecutionStatus, FilesystemPolicy,
    IsolationMode, IsolationPreference, Language, NetworkPolicy, ResourceLimits, SandboxSettings,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use common::{entries, has_interpreter, process_manager, process_settings, quick_limits};

fn shell(code: &str) -> ExecutionRequest {
    ExecutionRequest::new(code, Language::Shell)
}

// ---------------------------------------------------------------------------
// Normal completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_succeeds_with_output() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let result = manager.execute(&shell("echo hello")).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.isolation, Some(IsolationMode::Process));
    assert!(result.error_message.is_none());
    assert!(result.execution_id.starts_with("exec-"));
}

#[tokio::test]
async fn non_zero_exit_is_failure() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let result = manager
        .execute(&shell("echo oops >&2; exit 3"))
        .await
        .expect("run");
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr, "oops\n");
    assert_eq!(
        result.error_message.as_deref(),
        Some("process exited with code 3")
    );
}

#[tokio::test]
async fn host_environment_is_not_inherited() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());
    std::env::set_var("BASTION_TEST_SECRET", "hunter2");

    let result = manager
        .execute(&shell("echo \"[$BASTION_TEST_SECRET]\""))
        .await
        .expect("run");
    assert_eq!(result.stdout, "[]\n");
}

#[tokio::test]
async fn staged_files_are_visible_to_payload() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let request = shell("cat data/input.txt").with_file("data/input.txt", "staged\n");
    let result = manager.execute(&request).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "staged\n");
}

#[tokio::test]
async fn output_past_limit_is_truncated() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let limits = ResourceLimits {
        max_output_bytes: 64,
        ..quick_limits()
    };
    let manager = process_manager(root.path(), work.path(), limits);

    let result = manager
        .execute(&shell("i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done"))
        .await
        .expect("run");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.stdout_truncated);
    assert!(result.stdout.len() <= 64);
}

// ---------------------------------------------------------------------------
// Output files
// ---------------------------------------------------------------------------

#[tokio::test]
async fn created_modified_and_rejected_files_are_reported() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let request = shell("echo new > out.txt; echo more >> data.txt; printf x > tool.exe")
        .with_file("data.txt", "seed\n");
    let result = manager.execute(&request).await.expect("run");

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.files_created, vec!["out.txt".to_string()]);
    assert_eq!(result.files_modified, vec!["data.txt".to_string()]);
    assert_eq!(result.files_rejected, vec!["tool.exe".to_string()]);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("violated the filesystem policy")));
    assert_eq!(manager.statistics().files_created, 1);
}

#[tokio::test]
async fn workspace_is_removed_after_every_run() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let limits = ResourceLimits {
        timeout_seconds: 1,
        ..quick_limits()
    };
    let manager = process_manager(root.path(), work.path(), limits);

    manager.execute(&shell("echo ok > f.txt")).await.expect("ok run");
    manager.execute(&shell("exit 1")).await.expect("failed run");
    manager.execute(&shell("sleep 30")).await.expect("timed out run");
    assert_eq!(entries(work.path()), 0);
}

// ---------------------------------------------------------------------------
// Timeout, limits and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_kills_background_children() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let request = shell("sleep 60 & echo $!; wait").with_timeout_seconds(1);
    let started = Instant::now();
    let result = manager.execute(&request).await.expect("run");

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(
        result.error_message.as_deref(),
        Some("execution timed out after 1s")
    );
    assert!(started.elapsed() < Duration::from_secs(8));

    let pid: u32 = result.stdout.trim().parse().expect("grandchild pid");
    let deadline = Instant::now() + Duration::from_secs(3);
    while is_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!is_alive(pid), "background child {pid} survived the timeout");
}

#[tokio::test]
async fn sustained_cpu_is_resource_limit() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let request = shell("while :; do :; done").with_max_cpu_percent(10);
    let result = manager.execute(&request).await.expect("run");

    assert_eq!(result.status, ExecutionStatus::ResourceLimit);
    let message = result.error_message.expect("message");
    assert!(
        message.contains("CPU"),
        "unexpected limit message: {message}"
    );
}

#[tokio::test]
async fn cancel_stops_a_running_payload() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let result = manager
        .execute_with_cancel(&shell("sleep 30"), &cancel)
        .await
        .expect("run");

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(entries(work.path()), 0);
}

// ---------------------------------------------------------------------------
// Isolation selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_container_runtime_falls_back_with_warning() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let settings = SandboxSettings {
        isolation: IsolationPreference::Auto,
        container_runtime: "bastion-no-such-runtime".into(),
        ..process_settings(work.path())
    };
    let manager = SafetyManager::builder()
        .filesystem_policy(FilesystemPolicy {
            repo_root: root.path().to_path_buf(),
            ..FilesystemPolicy::default()
        })
        .sandbox_settings(settings)
        .limits(quick_limits())
        .build()
        .expect("manager");

    let result = manager.execute(&shell("echo fallback")).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.isolation, Some(IsolationMode::Process));
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("container isolation unavailable")));

    let fallbacks: Vec<_> = manager
        .audit_log()
        .filter_by_operation(AuditOperation::IsolationFallback)
        .into_iter()
        .filter(|e| e.target == "shell")
        .collect();
    assert_eq!(fallbacks.len(), 1);
    assert_eq!(fallbacks[0].result, AuditResult::Restricted);
    assert_eq!(manager.statistics().isolation_fallbacks, 1);
}

#[tokio::test]
async fn required_container_without_runtime_is_error() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let settings = SandboxSettings {
        isolation: IsolationPreference::Container,
        container_runtime: "bastion-no-such-runtime".into(),
        ..process_settings(work.path())
    };
    let manager = SafetyManager::builder()
        .filesystem_policy(FilesystemPolicy {
            repo_root: root.path().to_path_buf(),
            ..FilesystemPolicy::default()
        })
        .sandbox_settings(settings)
        .build()
        .expect("manager");

    let result = manager.execute(&shell("echo never")).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.stdout.is_empty());
    assert_eq!(entries(work.path()), 0);
}

// ---------------------------------------------------------------------------
// Network confinement
// ---------------------------------------------------------------------------

/// Loopback HTTP server answering `ok` and counting connections.
async fn counting_upstream() -> (u16, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = conn.read(&mut buf).await;
                let _ = conn
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    (port, hits)
}

fn networked_manager(root: &Path, work: &Path, process: ProcessBackend) -> SafetyManager {
    SafetyManager::builder()
        .filesystem_policy(FilesystemPolicy {
            repo_root: root.to_path_buf(),
            ..FilesystemPolicy::default()
        })
        .network_policy(NetworkPolicy {
            allowed_ips: vec!["127.0.0.1/32".parse().expect("cidr")],
            denied_ips: Vec::new(),
            allowed_ports: Default::default(),
            ..NetworkPolicy::default()
        })
        .sandbox_settings(process_settings(work))
        .process_backend(Arc::new(process))
        .limits(quick_limits())
        .build()
        .expect("manager")
}

#[tokio::test]
async fn networked_payload_is_confined_to_allowed_hosts() {
    if !bastion_runtime::netns::namespaces_available().await || which::which("bash").is_err() {
        return;
    }
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let (port, hits) = counting_upstream().await;
    let manager = networked_manager(root.path(), work.path(), ProcessBackend::new());

    let code = format!(
        r#"fetch() {{
  bash -c 'exec 3<>/dev/tcp/127.0.0.1/3128 || exit 1
    printf "GET http://$1/ HTTP/1.1\r\nHost: $1\r\nConnection: close\r\n\r\n" >&3
    head -n 1 <&3' _ "$1"
}}
echo "allowed: $(fetch 127.0.0.1:{port})"
echo "outside: $(fetch example.com:80)"
if bash -c 'echo x > /dev/tcp/127.0.0.1/{port}' 2>/dev/null; then
  echo "direct: open"
else
  echo "direct: refused"
fi
"#
    );
    let request = shell(&code).with_network(["127.0.0.1"]);
    let result = manager.execute(&request).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Success, "stderr: {}", result.stderr);
    assert!(result.stdout.contains("allowed: HTTP/1.1 200"), "stdout: {}", result.stdout);
    assert!(result.stdout.contains("outside: HTTP/1.1 403"), "stdout: {}", result.stdout);
    assert!(result.stdout.contains("direct: refused"), "stdout: {}", result.stdout);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let entries = manager.audit_log().entries();
    assert!(entries.iter().any(|e| e.operation == AuditOperation::ProxyConnect
        && e.result == AuditResult::Allowed
        && e.target.contains("127.0.0.1")));
    assert!(entries
        .iter()
        .any(|e| e.result == AuditResult::Denied && e.target.contains("example.com")));
}

#[tokio::test]
async fn offline_payload_without_namespaces_is_audited() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = networked_manager(
        root.path(),
        work.path(),
        ProcessBackend::new().assume_namespaces(false),
    );

    let result = manager.execute(&shell("echo offline")).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("network namespaces unavailable")));
    let fallbacks = manager
        .audit_log()
        .filter_by_operation(AuditOperation::IsolationFallback);
    assert_eq!(fallbacks.len(), 1);
    assert_eq!(fallbacks[0].target, "network");
    assert_eq!(fallbacks[0].result, AuditResult::Restricted);
}

#[tokio::test]
async fn networked_payload_without_namespaces_fails_closed() {
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let (port, hits) = counting_upstream().await;
    let manager = networked_manager(
        root.path(),
        work.path(),
        ProcessBackend::new().assume_namespaces(false),
    );

    let request = shell(&format!("echo x > /dev/tcp/127.0.0.1/{port}")).with_network(["127.0.0.1"]);
    let result = manager.execute(&request).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("namespaces")));
    assert!(result.stdout.is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(entries(work.path()), 0);
}

// ---------------------------------------------------------------------------
// Python payloads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn python_print_succeeds() {
    if !has_interpreter(Language::Python) {
        eprintln!("python3 not installed; skipping");
        return;
    }
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let result = manager
        .execute(&ExecutionRequest::new("print('hi')", Language::Python))
        .await
        .expect("run");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn python_over_allocation_fails_under_process_isolation() {
    if !has_interpreter(Language::Python) {
        eprintln!("python3 not installed; skipping");
        return;
    }
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let manager = process_manager(root.path(), work.path(), quick_limits());

    let request = ExecutionRequest::new("x = bytearray(8 * 1024 ** 3)", Language::Python)
        .with_max_memory_mb(256);
    let result = manager.execute(&request).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert!(
        result.stderr.contains("MemoryError"),
        "stderr: {}",
        result.stderr
    );
}

#[tokio::test]
async fn python_over_allocation_is_resource_limit_in_container() {
    let probe = ContainerBackend::from_settings(&SandboxSettings::default());
    if probe.check_available(Language::Python).await.is_err() {
        eprintln!("container runtime not available; skipping");
        return;
    }
    let root = tempfile::tempdir().expect("root");
    let work = tempfile::tempdir().expect("work");
    let settings = SandboxSettings {
        isolation: IsolationPreference::Container,
        ..process_settings(work.path())
    };
    let manager = SafetyManager::builder()
        .filesystem_policy(FilesystemPolicy {
            repo_root: root.path().to_path_buf(),
            ..FilesystemPolicy::default()
        })
        .sandbox_settings(settings)
        .limits(ResourceLimits {
            timeout_seconds: 60,
            ..ResourceLimits::default()
        })
        .build()
        .expect("manager");

    let request = ExecutionRequest::new(
        "chunks = []\nwhile True:\n    chunks.append(bytearray(64 * 1024 ** 2))",
        Language::Python,
    )
    .with_max_memory_mb(128);
    let result = manager.execute(&request).await.expect("run");
    assert_eq!(result.status, ExecutionStatus::ResourceLimit);
    assert_eq!(result.isolation, Some(IsolationMode::Container));
}
