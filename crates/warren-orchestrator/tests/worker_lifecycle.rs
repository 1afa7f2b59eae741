//! Worker lifecycle: creation, bundle delivery, readiness, termination.

mod common;

use std::time::Duration;

use common::{autopilot, init_tracing, test_config, TestLauncher};
use tempfile::TempDir;
use warren_core::protocol::{HostCommand, HostEvent};
use warren_core::worker::{WorkerSpec, WorkerState};
use warren_orchestrator::{Orchestrator, OrchestratorError};

#[tokio::test]
async fn test_create_send_bundle_and_wait_ready() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .with_launcher(launcher)
        .build()
        .unwrap();

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1").with_parent("panel-1"))
        .await
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Building);
    let _pilot = autopilot(hosts.recv().await.unwrap());

    orchestrator
        .send_bundle(worker.id().as_str(), "export default {};")
        .await
        .unwrap();
    worker.wait_ready(Duration::from_secs(2)).await.unwrap();

    let snapshot = worker.snapshot().unwrap();
    assert_eq!(snapshot.state, WorkerState::Ready);
    assert_eq!(snapshot.parent_id.as_deref(), Some("panel-1"));
    assert_eq!(snapshot.source_ref, "bundle@1");
    assert!(snapshot.fs_root.is_some());
    assert!(snapshot.last_error.is_none());

    // The bundle window closes once the worker is ready.
    let err = orchestrator
        .send_bundle(worker.id().as_str(), "again")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotBuilding { .. }));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_failed_build_reports_error() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .with_launcher(launcher)
        .build()
        .unwrap();

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1"))
        .await
        .unwrap();
    let mut host = hosts.recv().await.unwrap();

    orchestrator
        .send_bundle(worker.id().as_str(), "broken")
        .await
        .unwrap();
    let HostCommand::WorkerCreate { worker_id, .. } = host.recv().await else {
        panic!("expected worker:create");
    };
    host.send(HostEvent::WorkerCreated {
        worker_id: worker_id.as_str().to_string(),
        success: false,
        error: Some("bundle failed to evaluate".to_string()),
    })
    .await;

    let err = worker.wait_ready(Duration::from_secs(2)).await.unwrap_err();
    assert!(
        matches!(&err, OrchestratorError::WorkerFailed { reason, .. }
            if reason == "bundle failed to evaluate"),
        "{err}"
    );

    // A late success for the same id never resurrects the record.
    host.send(HostEvent::WorkerCreated {
        worker_id: worker_id.as_str().to_string(),
        success: true,
        error: None,
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = worker.snapshot().unwrap();
    assert_eq!(snapshot.state, WorkerState::Error);
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("bundle failed to evaluate")
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_provision_failure_never_contacts_the_host() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    // A regular file where the workspace directory should go makes every
    // provision under it fail.
    std::fs::write(dir.path().join("testws"), b"not a directory").unwrap();

    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .with_launcher(launcher)
        .build()
        .unwrap();

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1"))
        .await
        .unwrap();
    let mut host = hosts.recv().await.unwrap();

    let snapshot = worker.snapshot().unwrap();
    assert_eq!(snapshot.state, WorkerState::Error);
    assert!(snapshot.last_error.is_some());
    assert!(snapshot.fs_root.is_none());
    host.expect_silence().await;

    // The bundle path refuses the errored record, so the host still hears
    // nothing about this worker.
    let err = orchestrator
        .send_bundle(worker.id().as_str(), "code")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotBuilding { .. }));
    host.expect_silence().await;

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_id_hint_rejected_until_terminated() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .with_launcher(launcher)
        .build()
        .unwrap();

    let spec = || WorkerSpec::new("bundle@1").with_id_hint("singleton-x");
    let first = orchestrator.create_worker(spec()).await.unwrap();
    let _pilot = autopilot(hosts.recv().await.unwrap());

    let err = orchestrator.create_worker(spec()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Registry(_)), "{err}");

    let first_root = first.snapshot().unwrap().fs_root.unwrap();
    orchestrator.terminate_worker("singleton-x").await.unwrap();
    assert!(orchestrator.worker("singleton-x").is_none());

    // Same hint after termination resolves to the same deterministic root.
    let second = orchestrator.create_worker(spec()).await.unwrap();
    assert_eq!(second.snapshot().unwrap().fs_root.unwrap(), first_root);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = std::sync::Arc::new(
        Orchestrator::builder(test_config(dir.path()))
            .with_launcher(launcher)
            .build()
            .unwrap(),
    );

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1"))
        .await
        .unwrap();
    let mut host = hosts.recv().await.unwrap();
    let id = worker.id().as_str().to_string();

    let waiting = tokio::spawn({
        let orchestrator = std::sync::Arc::clone(&orchestrator);
        let id = id.clone();
        async move { orchestrator.terminate_worker(&id).await }
    });

    // The host sees exactly one terminate for the record's lifetime.
    let HostCommand::WorkerTerminate { worker_id } = host.recv().await else {
        panic!("expected worker:terminate");
    };
    host.send(HostEvent::WorkerTerminated {
        worker_id: worker_id.as_str().to_string(),
        success: true,
        error: None,
    })
    .await;

    waiting.await.unwrap().unwrap();
    assert!(orchestrator.worker(&id).is_none());

    // Second terminate: the record is gone, so this is a quiet no-op.
    orchestrator.terminate_worker(&id).await.unwrap();
    host.expect_silence().await;

    // A stray late confirmation for the same id is ignored.
    host.send(HostEvent::WorkerTerminated {
        worker_id: worker_id.to_string(),
        success: true,
        error: None,
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_terminate_reports_pending() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = std::sync::Arc::new(
        Orchestrator::builder(test_config(dir.path()))
            .with_launcher(launcher)
            .build()
            .unwrap(),
    );

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1"))
        .await
        .unwrap();
    let mut host = hosts.recv().await.unwrap();
    let id = worker.id().as_str().to_string();

    let waiting = tokio::spawn({
        let orchestrator = std::sync::Arc::clone(&orchestrator);
        let id = id.clone();
        async move { orchestrator.terminate_worker(&id).await }
    });
    let HostCommand::WorkerTerminate { worker_id } = host.recv().await else {
        panic!("expected worker:terminate");
    };

    // While the first call waits for confirmation, a second is refused.
    let err = orchestrator.terminate_worker(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TerminationPending { .. }));

    host.send(HostEvent::WorkerTerminated {
        worker_id: worker_id.as_str().to_string(),
        success: true,
        error: None,
    })
    .await;
    waiting.await.unwrap().unwrap();

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_termination_failure_keeps_the_record() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = std::sync::Arc::new(
        Orchestrator::builder(test_config(dir.path()))
            .with_launcher(launcher)
            .build()
            .unwrap(),
    );

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1"))
        .await
        .unwrap();
    let mut host = hosts.recv().await.unwrap();
    let id = worker.id().as_str().to_string();

    let waiting = tokio::spawn({
        let orchestrator = std::sync::Arc::clone(&orchestrator);
        let id = id.clone();
        async move { orchestrator.terminate_worker(&id).await }
    });
    let HostCommand::WorkerTerminate { worker_id } = host.recv().await else {
        panic!("expected worker:terminate");
    };
    host.send(HostEvent::WorkerTerminated {
        worker_id: worker_id.as_str().to_string(),
        success: false,
        error: Some("sandbox is wedged".to_string()),
    })
    .await;

    let err = waiting.await.unwrap().unwrap_err();
    assert!(
        matches!(&err, OrchestratorError::TerminationFailed { reason, .. }
            if reason == "sandbox is wedged"),
        "{err}"
    );
    // Cleanup only happens on a successful confirmation.
    let snapshot = orchestrator.worker(&id).unwrap();
    assert_eq!(snapshot.last_error.as_deref(), Some("sandbox is wedged"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_terminate_workers_of_parent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .with_launcher(launcher)
        .build()
        .unwrap();

    for hint in ["owned-a", "owned-b"] {
        orchestrator
            .create_worker(
                WorkerSpec::new("bundle@1")
                    .with_id_hint(hint)
                    .with_parent("panel-7"),
            )
            .await
            .unwrap();
    }
    orchestrator
        .create_worker(WorkerSpec::new("bundle@1").with_id_hint("other"))
        .await
        .unwrap();
    let _pilot = autopilot(hosts.recv().await.unwrap());

    let results = orchestrator.terminate_workers_of("panel-7").await;
    assert_eq!(results.len(), 2);
    for (_, outcome) in &results {
        assert!(outcome.is_ok());
    }
    assert!(orchestrator.worker("owned-a").is_none());
    assert!(orchestrator.worker("owned-b").is_none());
    assert!(orchestrator.worker("other").is_some());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_worker_error_events_update_the_record() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (launcher, mut hosts) = TestLauncher::new();
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .with_launcher(launcher)
        .build()
        .unwrap();

    let worker = orchestrator
        .create_worker(WorkerSpec::new("bundle@1").with_id_hint("w1"))
        .await
        .unwrap();
    let host = hosts.recv().await.unwrap();

    // Non-fatal: last_error only, state untouched.
    host.send(HostEvent::WorkerError {
        worker_id: "w1".to_string(),
        error: "unhandled rejection".to_string(),
        fatal: false,
    })
    .await;
    common::wait_until(|| {
        orchestrator
            .worker("w1")
            .is_some_and(|s| s.last_error.is_some())
    })
    .await;
    assert_eq!(worker.state(), WorkerState::Building);

    // Fatal: terminal error state.
    host.send(HostEvent::WorkerError {
        worker_id: "w1".to_string(),
        error: "sandbox heap exhausted".to_string(),
        fatal: true,
    })
    .await;
    common::wait_until(|| worker.state() == WorkerState::Error).await;
    assert_eq!(
        orchestrator.worker("w1").unwrap().last_error.as_deref(),
        Some("sandbox heap exhausted")
    );

    orchestrator.shutdown().await;
}
