//! Supervisor lifecycle scenarios

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use workspace_finder::process::{
    ServiceState, Supervisor, SupervisorOptions, WARN_DEFINITION_MISSING, WARN_PERMANENT_FAILURE,
    WARN_RESTART_LIMIT,
};

use crate::helpers::{primary, supervisor_for, Fixture};

#[tokio::test]
async fn test_services_launch_in_parallel() {
    let fixture = Fixture::new();
    let a = fixture.script("a.sh", "sleep 0.15\necho ready\nsleep 5");
    let b = fixture.script("b.sh", "sleep 0.2\necho ready\nsleep 5");
    let c = fixture.script("c.sh", "sleep 0.25\necho ready\nsleep 5");
    let supervisor = supervisor_for(
        &[("a", &a), ("b", &b), ("c", &c)],
        Duration::from_millis(600),
        1,
    );

    let started = Instant::now();
    let mut statuses = supervisor.launch_all().await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(550),
        "launch took {:?}, expected parallel start",
        elapsed
    );
    for status in statuses.values() {
        assert!(status.ready, "{} not ready: {:?}", status.name, status.warning);
        assert_eq!(status.state, ServiceState::Ready);
        assert!(status.started());
        assert_eq!(status.restart_count, 0);
    }

    supervisor.shutdown(&mut statuses).await;
    assert!(statuses.values().all(|s| s.process.is_none()));
}

#[tokio::test]
async fn test_readiness_timeout_keeps_process() {
    let fixture = Fixture::new();
    let slow = fixture.script("slow.sh", "sleep 5\necho late");
    let supervisor = supervisor_for(&[("slow", &slow)], Duration::from_millis(200), 1);

    let mut statuses = supervisor.launch_all().await;
    let status = &statuses["slow"];

    assert!(!status.ready);
    assert!(status.warning.as_deref().unwrap().contains("timeout"));
    assert!(status.process.is_some());
    assert!(!status.started());

    supervisor.shutdown(&mut statuses).await;
}

#[tokio::test]
async fn test_early_exit_reports_exit_code() {
    let fixture = Fixture::new();
    let broken = fixture.script("broken.sh", "echo 'boom' >&2\nexit 3");
    let supervisor = supervisor_for(&[("broken", &broken)], Duration::from_secs(2), 1);

    let statuses = supervisor.launch_all().await;
    let status = &statuses["broken"];

    assert!(!status.ready);
    assert!(status.process.is_none());
    assert_eq!(status.state, ServiceState::StartFailed);
    assert_eq!(status.warning.as_deref(), Some("start failed: exit code 3"));
}

#[tokio::test]
async fn test_early_auth_failure_is_permanent() {
    let fixture = Fixture::new();
    let denied = fixture.script("denied.sh", "echo 'Error: invalid token' >&2\nexit 1");
    let supervisor = supervisor_for(&[("denied", &denied)], Duration::from_secs(2), 1);

    let statuses = supervisor.launch_all().await;
    let status = &statuses["denied"];

    assert!(!status.ready);
    assert_eq!(status.restart_count, 0);
    assert_eq!(status.warning.as_deref(), Some(WARN_PERMANENT_FAILURE));
}

#[tokio::test]
async fn test_config_error_isolated_to_one_service() {
    let fixture = Fixture::new();
    let good = fixture.script("good.sh", "echo ready\nsleep 5");
    let missing = fixture.path().join("does-not-exist.sh");
    let supervisor = supervisor_for(
        &[("good", &good), ("bad", &missing)],
        Duration::from_secs(2),
        1,
    );

    let mut statuses = supervisor.launch_all().await;

    let bad = &statuses["bad"];
    assert_eq!(bad.state, ServiceState::StartFailed);
    assert!(bad.command.is_none());
    assert!(bad.error.as_deref().unwrap().contains("does not exist"));
    assert!(statuses["good"].ready);

    supervisor.shutdown(&mut statuses).await;
}

#[tokio::test]
async fn test_missing_definition() {
    let mut resolved = BTreeMap::new();
    resolved.insert("ghost".to_string(), primary("ghost"));
    let supervisor = Supervisor::new(BTreeMap::new(), resolved, SupervisorOptions::default());

    let statuses = supervisor.launch_all().await;
    let ghost = &statuses["ghost"];

    assert!(!ghost.started());
    assert_eq!(ghost.warning.as_deref(), Some(WARN_DEFINITION_MISSING));
    assert_eq!(ghost.error.as_deref(), Some(WARN_DEFINITION_MISSING));
}

#[tokio::test]
async fn test_auth_failure_skips_restart_and_spares_sibling() {
    let fixture = Fixture::new();
    let auth = fixture.script(
        "auth.sh",
        "echo ready\nsleep 0.2\necho 'HTTP 401 unauthorized' >&2\nexit 1",
    );
    let sibling = fixture.script("sibling.sh", "echo ready\nsleep 5");
    let supervisor = supervisor_for(
        &[("auth", &auth), ("sibling", &sibling)],
        Duration::from_secs(2),
        1,
    );

    let mut statuses = supervisor.launch_all().await;
    assert!(statuses["auth"].ready);

    supervisor
        .monitor(&mut statuses, Some(Duration::from_millis(1500)))
        .await;

    let failed = &statuses["auth"];
    assert_eq!(failed.restart_count, 0);
    assert!(!failed.ready);
    assert!(failed.process.is_none());
    assert!(failed.warning.as_deref().unwrap().contains("auth"));
    assert_eq!(failed.state, ServiceState::Stopped);

    assert!(statuses["sibling"].ready);
    supervisor.shutdown(&mut statuses).await;
}

#[tokio::test]
async fn test_abnormal_exit_restarts_once() {
    let fixture = Fixture::new();
    let marker = fixture.path().join("started-once");
    let flaky = fixture.script(
        "flaky.sh",
        &format!(
            "if [ -f '{marker}' ]; then\n  echo ready again\n  sleep 5\nelse\n  touch '{marker}'\n  echo ready\n  sleep 0.1\n  exit 1\nfi",
            marker = marker.display()
        ),
    );
    let supervisor = supervisor_for(&[("flaky", &flaky)], Duration::from_secs(2), 1);

    let mut statuses = supervisor.launch_all().await;
    supervisor
        .monitor(&mut statuses, Some(Duration::from_millis(1500)))
        .await;

    let status = statuses.get_mut("flaky").unwrap();
    assert_eq!(status.restart_count, 1);
    assert!(status.ready);
    assert_eq!(status.state, ServiceState::Ready);
    assert!(status.warning.is_none());
    assert!(status.process.as_mut().unwrap().is_running());

    supervisor.shutdown(&mut statuses).await;
}

#[tokio::test]
async fn test_noisy_stderr_does_not_hide_auth_failure() {
    let fixture = Fixture::new();
    let noisy = fixture.script(
        "noisy.sh",
        "echo ready\nhead -c 300000 /dev/zero | tr '\\0' x >&2\necho ' unauthorized' >&2\nexit 1",
    );
    let supervisor = supervisor_for(&[("noisy", &noisy)], Duration::from_secs(2), 1);

    let mut statuses = supervisor.launch_all().await;
    assert!(statuses["noisy"].ready);

    supervisor
        .monitor(&mut statuses, Some(Duration::from_secs(3)))
        .await;

    let status = &statuses["noisy"];
    assert_eq!(status.restart_count, 0);
    assert!(!status.ready);
    assert!(status.process.is_none());
    assert_eq!(status.warning.as_deref(), Some(WARN_PERMANENT_FAILURE));
}

#[tokio::test]
async fn test_restart_limit_reached() {
    let fixture = Fixture::new();
    let crashing = fixture.script("crash.sh", "echo ready\nsleep 0.1\nexit 1");
    let supervisor = supervisor_for(&[("crash", &crashing)], Duration::from_secs(2), 1);

    let mut statuses = supervisor.launch_all().await;
    supervisor.monitor(&mut statuses, None).await;

    let status = &statuses["crash"];
    assert_eq!(status.restart_count, 1);
    assert!(!status.ready);
    assert!(status.process.is_none());
    assert_eq!(status.warning.as_deref(), Some(WARN_RESTART_LIMIT));
}

#[tokio::test]
async fn test_clean_exit_is_not_restarted() {
    let fixture = Fixture::new();
    let done = fixture.script("done.sh", "echo ready\nsleep 0.1\nexit 0");
    let supervisor = supervisor_for(&[("done", &done)], Duration::from_secs(2), 1);

    let mut statuses = supervisor.launch_all().await;
    supervisor.monitor(&mut statuses, None).await;

    let status = &statuses["done"];
    assert_eq!(status.restart_count, 0);
    assert_eq!(status.state, ServiceState::Stopped);
    assert!(status.process.is_none());
}

#[tokio::test]
async fn test_monitor_deadline_leaves_processes_running() {
    let fixture = Fixture::new();
    let steady = fixture.script("steady.sh", "echo ready\nsleep 5");
    let supervisor = supervisor_for(&[("steady", &steady)], Duration::from_secs(2), 1);

    let mut statuses = supervisor.launch_all().await;
    let started = Instant::now();
    supervisor
        .monitor(&mut statuses, Some(Duration::from_millis(200)))
        .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    let status = statuses.get_mut("steady").unwrap();
    assert!(status.ready);
    assert!(status.process.as_mut().unwrap().is_running());

    supervisor.shutdown(&mut statuses).await;
    assert!(statuses["steady"].process.is_none());
}
