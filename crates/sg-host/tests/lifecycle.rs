//! Lifecycle manager against real child processes

#![cfg(unix)]

use std::time::Duration;

use sg_host::{DaemonOutcome, DaemonSupervisor, LifecycleError, ProcessSpawner};

/// A fake daemon that records each start in `log` and exits with `code`
fn fake_daemon(log: &std::path::Path, code: i32) -> ProcessSpawner {
    ProcessSpawner::new(
        "sh",
        vec![
            "-c".to_string(),
            format!("echo started >> '{}'; exit {}", log.display(), code),
        ],
    )
}

fn starts(log: &std::path::Path) -> usize {
    std::fs::read_to_string(log)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_port_in_use_exit_is_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("starts");
    let supervisor = DaemonSupervisor::new(fake_daemon(&log, 100), 3, Duration::from_millis(10));

    let outcome = supervisor.ensure_started().await.unwrap();

    assert_eq!(outcome, DaemonOutcome::AlreadyServing);
    assert_eq!(starts(&log), 1);
}

#[tokio::test]
async fn test_unexpected_exit_is_restarted_up_to_limit() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("starts");
    let supervisor = DaemonSupervisor::new(fake_daemon(&log, 101), 2, Duration::from_millis(10));

    let result = supervisor.ensure_started().await;

    assert!(matches!(
        result,
        Err(LifecycleError::RestartsExhausted {
            restarts: 2,
            last_code: Some(101)
        })
    ));
    assert_eq!(starts(&log), 3);
}

#[tokio::test]
async fn test_clean_exit_is_success() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("starts");
    let supervisor = DaemonSupervisor::new(fake_daemon(&log, 0), 3, Duration::from_millis(10));

    assert_eq!(
        supervisor.ensure_started().await.unwrap(),
        DaemonOutcome::Stopped
    );
    assert_eq!(starts(&log), 1);
}
