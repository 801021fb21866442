//! External scheduler tests for slot and drain coverage.

use bastion_runtime::{RuntimeError, Scheduler, SchedulerConfig};

#[test]
fn scheduler_max_concurrent_accessor() {
    let s = Scheduler::new(&SchedulerConfig { max_concurrent: 8 });
    assert_eq!(s.max_concurrent(), 8);
}

#[test]
fn zero_slots_become_one() {
    let s = Scheduler::new(&SchedulerConfig { max_concurrent: 0 });
    assert_eq!(s.max_concurrent(), 1);
}

#[test]
fn scheduler_config_default() {
    let config = SchedulerConfig::default();
    assert_eq!(config.max_concurrent, 4);
}

#[tokio::test]
async fn scheduler_drain_returns_when_idle() {
    let s = Scheduler::new(&SchedulerConfig { max_concurrent: 2 });
    s.drain().await;
    assert_eq!(s.available_permits(), 2);
}

#[tokio::test]
async fn scheduler_drain_waits_for_in_flight() {
    let s = Scheduler::new(&SchedulerConfig { max_concurrent: 2 });
    let p = s.acquire().await.expect("permit");
    assert_eq!(s.available_permits(), 1);

    let s_clone = s.clone();
    let handle = tokio::spawn(async move {
        s_clone.drain().await;
    });

    drop(p);
    handle.await.expect("drain completes");
    assert_eq!(s.available_permits(), 2);
}

#[tokio::test]
async fn closed_scheduler_refuses_acquire() {
    let s = Scheduler::new(&SchedulerConfig { max_concurrent: 1 });
    s.drain_and_close().await;
    assert!(s.is_closed());
    assert!(matches!(s.acquire().await, Err(RuntimeError::ShuttingDown)));
}

#[tokio::test]
async fn close_waits_for_running_executions() {
    let s = Scheduler::new(&SchedulerConfig { max_concurrent: 1 });
    let permit = s.acquire().await.expect("permit");

    let closer = s.clone();
    let handle = tokio::spawn(async move { closer.drain_and_close().await });
    tokio::task::yield_now().await;
    assert!(!s.is_closed());

    drop(permit);
    handle.await.expect("close completes");
    assert!(s.is_closed());
}
