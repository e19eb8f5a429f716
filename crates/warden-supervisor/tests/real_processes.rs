use std::collections::BTreeMap;
use std::sync::Arc;

use warden_config::{Format, LoadOptions, WardenConfig, parse_str};
use warden_probe::HttpHealthChecker;
use warden_probe::stub::StubServer;
use warden_supervisor::{Orchestrator, UnixProcessControl};
use warden_types::{ServiceState, WardenError};

fn load(yaml: &str) -> WardenConfig {
    parse_str(yaml, Format::Yaml, &LoadOptions::default()).expect("valid config")
}

fn orchestrator(config: WardenConfig) -> Orchestrator {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    env.insert("INHERITED_MARKER".into(), "warden".into());
    Orchestrator::new(config, Arc::new(UnixProcessControl::new()), Arc::new(HttpHealthChecker::new()))
        .with_parent_env(env)
}

#[tokio::test]
async fn services_start_in_order_and_stop_cleanly() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let health = StubServer::start(200).await.expect("stub");
    let yaml = format!(
        r#"
vars:
  logs: {logs}
settings:
  log_dir: ${{logs}}
  grace_period_secs: 2
  retry: {{ max_retries: 1, base_delay_secs: 0.1, max_delay_secs: 0.5 }}
  health_check: {{ check_interval_secs: 0.05, request_timeout_secs: 1.0 }}
base_services:
  - name: prepare
    command: echo prepared for $INHERITED_MARKER
    shell: true
    run_in_background: false
    log_file: prepare.log
    startup_timeout: 5
  - name: sleeper
    command: sleep 30
    log_file: sleeper.log
    startup_timeout: 5
    health_check_url: {url}
    dependencies: [prepare]
"#,
        logs = dir.path().display(),
        url = health.url("/health"),
    );
    let orch = orchestrator(load(&yaml));

    let report = orch.initialize_all().await.expect("valid graph");
    assert!(report.success, "{report:?}");

    let status = orch.status().await;
    assert_eq!(status["prepare"].state, ServiceState::Running);
    assert_eq!(status["sleeper"].state, ServiceState::Running);
    assert!(status["sleeper"].pid.is_some());
    assert!(health.hits() >= 1, "sleeper is only running after a passing probe");

    let log = std::fs::read_to_string(dir.path().join("prepare.log")).expect("prepare log");
    assert!(log.contains("prepared for warden"), "parent environment reaches the child: {log:?}");

    let shutdown = orch.shutdown_all().await;
    assert!(shutdown.errors.is_empty(), "{shutdown:?}");
    assert_eq!(shutdown.stopped, vec!["sleeper", "prepare"]);
    let status = orch.status().await;
    assert_eq!(status["sleeper"].state, ServiceState::Stopped);
    assert_eq!(status["sleeper"].pid, None);
}

#[tokio::test]
async fn missing_executable_fails_without_retries() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let yaml = format!(
        r#"
settings:
  log_dir: {logs}
  retry: {{ max_retries: 3, base_delay_secs: 0.1 }}
base_services:
  - name: ghost
    command: /nonexistent/warden-test-binary --serve
"#,
        logs = dir.path().display(),
    );
    let orch = orchestrator(load(&yaml));

    let report = orch.initialize_all().await.expect("valid graph");

    assert!(!report.success);
    assert_eq!(report.failed_base[0].attempts, 1);
    assert!(matches!(
        report.failed_base[0].error,
        WardenError::Startup { retryable: false, .. }
    ));
}

#[tokio::test]
async fn reap_notices_a_process_that_exits_after_startup() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let yaml = format!(
        r#"
settings:
  log_dir: {logs}
base_services:
  - name: short_lived
    command: sleep 0.3
"#,
        logs = dir.path().display(),
    );
    let orch = orchestrator(load(&yaml));
    orch.initialize_all().await.expect("valid graph");
    assert!(orch.reap().await.is_empty());

    tokio::time::sleep(std::time::Duration::from_millis(600)).await;

    assert_eq!(orch.reap().await, vec!["short_lived"]);
    assert_eq!(orch.status().await["short_lived"].state, ServiceState::Failed);
}
