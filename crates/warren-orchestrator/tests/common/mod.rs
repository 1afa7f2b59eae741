//! Shared fixtures: an in-memory host launcher plus config helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use warren_core::config::{HostProcessConfig, OrchestratorConfig};
use warren_core::protocol::{HostCommand, HostEvent};
use warren_orchestrator::{HostConnection, HostLauncher, SupervisorError};

/// Host-side halves of one in-memory connection.
///
/// Tests script host behavior by reading [`commands`](Self::commands) and
/// injecting [`events`](Self::events); [`crash`](Self::crash) simulates the
/// process dying.
pub struct TestHost {
    pub commands: mpsc::Receiver<HostCommand>,
    pub events: mpsc::Sender<HostEvent>,
    pub exit: Option<oneshot::Sender<String>>,
    pub kill: oneshot::Receiver<()>,
}

impl TestHost {
    /// Inject one event into the orchestrator.
    pub async fn send(&self, event: HostEvent) {
        self.events.send(event).await.expect("orchestrator gone");
    }

    /// Receive the next command the orchestrator sent, bounded.
    pub async fn recv(&mut self) -> HostCommand {
        tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
            .await
            .expect("timed out waiting for a host command")
            .expect("command channel closed")
    }

    /// Assert no command arrives within a short grace window.
    pub async fn expect_silence(&mut self) {
        let outcome = tokio::time::timeout(Duration::from_millis(100), self.commands.recv()).await;
        assert!(outcome.is_err(), "unexpected host command: {outcome:?}");
    }

    /// Simulate the host process dying with the given exit description.
    pub fn crash(mut self, status: &str) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(status.to_string());
        }
        // Dropping `events` closes the inbound stream, which is what the
        // supervisor treats as the process going away.
    }
}

/// Launcher that hands out in-memory connections, each already past the
/// `ready` handshake, and exposes the host-side halves to the test.
pub struct TestLauncher {
    hosts: mpsc::UnboundedSender<TestHost>,
}

impl TestLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TestHost>) {
        let (hosts_tx, hosts_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { hosts: hosts_tx }), hosts_rx)
    }
}

#[async_trait]
impl HostLauncher for TestLauncher {
    async fn launch(&self, _config: &HostProcessConfig) -> Result<HostConnection, SupervisorError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        inbound_tx
            .send(HostEvent::Ready)
            .await
            .expect("fresh channel");
        self.hosts
            .send(TestHost {
                commands: outbound_rx,
                events: inbound_tx,
                exit: Some(exit_tx),
                kill: kill_rx,
            })
            .map_err(|_| SupervisorError::StartupFailed {
                reason: "test dropped the host receiver".to_string(),
            })?;

        Ok(HostConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
            exited: exit_rx,
            kill: kill_tx,
        })
    }
}

/// Well-behaved host: confirms every create and terminate.
///
/// Returns when the command channel closes. Other commands are dropped.
pub fn autopilot(mut host: TestHost) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = host.commands.recv().await {
            let reply = match command {
                HostCommand::WorkerCreate { worker_id, .. } => Some(HostEvent::WorkerCreated {
                    worker_id: worker_id.as_str().to_string(),
                    success: true,
                    error: None,
                }),
                HostCommand::WorkerTerminate { worker_id } => Some(HostEvent::WorkerTerminated {
                    worker_id: worker_id.as_str().to_string(),
                    success: true,
                    error: None,
                }),
                _ => None,
            };
            if let Some(reply) = reply {
                if host.events.send(reply).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Configuration pointing at the in-memory launcher's placeholder program.
pub fn test_config(fs_base_dir: &std::path::Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(
        HostProcessConfig::new("in-memory-host").with_ready_timeout(Duration::from_secs(1)),
    );
    config.workspace_id = "testws".to_string();
    config.fs_base_dir = fs_base_dir.to_path_buf();
    config.invoke_timeout = Duration::from_millis(500);
    config
}

/// Poll a worker's state until `predicate` holds, bounded.
pub async fn wait_until<F>(mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
