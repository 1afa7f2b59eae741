//! End-to-end tests against real `sh`-scripted host processes speaking the
//! newline-delimited JSON protocol over stdio.

#![cfg(unix)]

mod common;

use std::path::Path;
use std::time::Duration;

use common::{init_tracing, wait_until};
use tempfile::TempDir;
use warren_core::config::{HostProcessConfig, OrchestratorConfig};
use warren_core::worker::{WorkerSpec, WorkerState};
use warren_orchestrator::{Orchestrator, OrchestratorError, HOST_CRASH_ERROR};

fn sh_config(fs_base_dir: &Path, script: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(
        HostProcessConfig::new("sh")
            .with_arg("-c")
            .with_arg(script)
            .with_ready_timeout(Duration::from_secs(5)),
    );
    config.workspace_id = "testws".to_string();
    config.fs_base_dir = fs_base_dir.to_path_buf();
    config
}

/// Host that answers creates and terminates with success confirmations.
const RESPONDER: &str = r#"
echo '{"type":"ready"}'
while IFS= read -r line; do
  case "$line" in
    *'"type":"worker:create"'*)
      wid=${line#*\"workerId\":\"}
      wid=${wid%%\"*}
      printf '{"type":"worker:created","workerId":"%s","success":true}\n' "$wid"
      ;;
    *'"type":"worker:terminate"'*)
      wid=${line#*\"workerId\":\"}
      wid=${wid%%\"*}
      printf '{"type":"worker:terminated","workerId":"%s","success":true}\n' "$wid"
      ;;
  esac
done
"#;

#[tokio::test]
async fn test_handshake_survives_stdout_and_stderr_noise() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let script = r#"
echo 'host booting, please hold...'
echo 'this is not json'
echo 'diagnostics go to stderr' >&2
echo '{"type":"ready"}'
while IFS= read -r line; do :; done
"#;
    let orchestrator = Orchestrator::builder(sh_config(dir.path(), script))
        .build()
        .unwrap();

    // The noise is relayed to logging; the handshake still completes and
    // the worker record comes up.
    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1").with_id_hint("w1"))
        .await
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Building);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_full_lifecycle_against_a_real_host() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let orchestrator = Orchestrator::builder(sh_config(dir.path(), RESPONDER)).build()?;

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1").with_id_hint("real-w"))
        .await?;
    orchestrator
        .send_bundle("real-w", "export default {};")
        .await?;
    worker.wait_ready(Duration::from_secs(5)).await?;
    assert_eq!(worker.state(), WorkerState::Ready);

    orchestrator.terminate_worker("real-w").await?;
    assert!(orchestrator.worker("real-w").is_none());

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_host_exit_marks_workers_crashed() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    // Exits as soon as the first command arrives.
    let script = r#"
echo '{"type":"ready"}'
IFS= read -r line
exit 7
"#;
    let orchestrator = Orchestrator::builder(sh_config(dir.path(), script))
        .build()
        .unwrap();

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1").with_id_hint("w1"))
        .await
        .unwrap();
    orchestrator.send_bundle("w1", "code").await.unwrap();

    wait_until(|| worker.state() == WorkerState::Error).await;
    assert_eq!(
        worker.snapshot().unwrap().last_error.as_deref(),
        Some(HOST_CRASH_ERROR)
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_ready_timeout_against_a_silent_host() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = sh_config(dir.path(), "sleep 30");
    config.host.ready_timeout = Duration::from_millis(200);
    let orchestrator = Orchestrator::builder(config).build().unwrap();

    let err = orchestrator
        .create_worker(WorkerSpec::new("bundle@1"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Supervisor(_)), "{err}");
    assert!(orchestrator.workers().is_empty());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_surfaces() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = sh_config(dir.path(), "true");
    config.host.program = "/nonexistent/warren-host".into();
    let orchestrator = Orchestrator::builder(config).build().unwrap();

    let err = orchestrator
        .create_worker(WorkerSpec::new("bundle@1"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Supervisor(_)), "{err}");

    orchestrator.shutdown().await;
}
