//! The orchestrator facade.
//!
//! One [`Orchestrator`] instance owns everything: the host supervisor, the
//! worker registry, both pending tables, the service registry, and the
//! router task that consumes the host signal stream. There is no global
//! state; dropping the orchestrator drops all of it.
//!
//! Public operations return `Result` rather than panicking. Failures that
//! belong to a worker (a failed build, a crashed host) are recorded on the
//! worker record and surface through [`WorkerHandle::wait_ready`] and
//! snapshots, not as errors from unrelated calls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;
use warren_core::config::{ConfigError, OrchestratorConfig};
use warren_core::pending::{PendingError, PendingTable};
use warren_core::protocol::{HostCommand, MAX_BUNDLE_BYTES};
use warren_core::scoped_fs::ScopedFs;
use warren_core::worker::{
    WorkerId, WorkerIdError, WorkerOptionsError, WorkerRecord, WorkerSnapshot, WorkerSpec,
    WorkerState, MAX_SOURCE_REF_LEN,
};

use crate::registry::{RegistryError, WorkerRegistry};
use crate::router::{run_router, ConsoleLine, PanelMessage, PanelRegistry};
use crate::services::{ServiceError, ServiceHandler, ServiceRegistry};
use crate::supervisor::{HostLauncher, HostSupervisor, ProcessLauncher, SupervisorError};

/// Drain reason handed to pending waiters at shutdown.
const SHUTDOWN_ERROR: &str = "orchestrator shut down";

/// State shared between the facade and the router task.
pub(crate) struct Shared {
    pub(crate) config: OrchestratorConfig,
    pub(crate) supervisor: HostSupervisor,
    pub(crate) registry: WorkerRegistry,
    /// In-flight `service:invoke` calls, keyed by correlation id.
    pub(crate) invokes: PendingTable<Value>,
    /// In-flight terminations, keyed by worker id.
    pub(crate) terminations: PendingTable<()>,
    pub(crate) services: ServiceRegistry,
    pub(crate) panels: PanelRegistry,
    pub(crate) console_sink: Option<mpsc::Sender<ConsoleLine>>,
    /// Serializes host spawn against crash cleanup, so a worker created on
    /// a fresh host is never swept with a dead one.
    pub(crate) host_transition: Mutex<()>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builds an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    launcher: Arc<dyn HostLauncher>,
    console_sink: Option<mpsc::Sender<ConsoleLine>>,
    services: Vec<(String, Arc<dyn ServiceHandler>)>,
}

impl OrchestratorBuilder {
    /// Builder around a configuration, using the default process launcher.
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            launcher: Arc::new(ProcessLauncher),
            console_sink: None,
            services: Vec::new(),
        }
    }

    /// Replace the host launcher (tests inject in-memory hosts here).
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn HostLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Receive every captured worker console line on the given sink.
    #[must_use]
    pub fn with_console_sink(mut self, sink: mpsc::Sender<ConsoleLine>) -> Self {
        self.console_sink = Some(sink);
        self
    }

    /// Register an application service alongside the built-ins.
    #[must_use]
    pub fn with_service(mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Self {
        self.services.push((name.into(), handler));
        self
    }

    /// Validate the configuration, wire everything up, and spawn the router
    /// task. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Configuration validation failures and service registration failures
    /// (built-in name collisions, registry overflow).
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        self.config.validate()?;

        let services = ServiceRegistry::with_builtins()?;
        for (name, handler) in self.services {
            services.register(&name, handler)?;
        }

        let (supervisor, signals) = HostSupervisor::new(self.config.host.clone(), self.launcher);
        let shared = Arc::new(Shared {
            config: self.config,
            supervisor,
            registry: WorkerRegistry::new(),
            invokes: PendingTable::new("invokes"),
            terminations: PendingTable::new("terminations"),
            services,
            panels: PanelRegistry::new(),
            console_sink: self.console_sink,
            host_transition: Mutex::new(()),
        });
        let router = tokio::spawn(run_router(Arc::clone(&shared), signals));

        Ok(Orchestrator {
            shared,
            router: std::sync::Mutex::new(Some(router)),
        })
    }
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates sandboxed workers hosted in one supervised host process.
pub struct Orchestrator {
    shared: Arc<Shared>,
    router: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Start building an orchestrator.
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// The configuration this orchestrator was built with.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Create a worker record and provision its scoped filesystem.
    ///
    /// Ensures the host process is running (spawning it if needed), inserts
    /// the record in `building` state, and provisions the filesystem root.
    /// A provisioning failure is recorded on the returned handle's record
    /// (`error` state, `last_error` set) and the host is never asked to
    /// create that sandbox; the call itself still succeeds.
    ///
    /// The sandbox is not created until [`send_bundle`](Self::send_bundle)
    /// supplies the code to run.
    ///
    /// # Errors
    ///
    /// Invalid spec (id hint, options, oversized source ref), a duplicate
    /// live id, or a host spawn/handshake failure.
    pub async fn create_worker(&self, spec: WorkerSpec) -> Result<WorkerHandle, OrchestratorError> {
        spec.options.validate()?;
        if spec.source_ref.len() > MAX_SOURCE_REF_LEN {
            return Err(OrchestratorError::SourceRefTooLong {
                len: spec.source_ref.len(),
                max: MAX_SOURCE_REF_LEN,
            });
        }
        let id = match &spec.id_hint {
            Some(hint) => WorkerId::parse(hint)?,
            None => WorkerId::generate(),
        };

        // Held across spawn + insert so crash cleanup for an older
        // generation cannot interleave.
        let transition = self.shared.host_transition.lock().await;
        let generation = self.shared.supervisor.ensure_running().await?;

        let record = WorkerRecord::new(id.clone(), &spec);
        let (fs, provision_error) = match ScopedFs::provision(
            &self.shared.config.fs_base_dir,
            &self.shared.config.workspace_id,
            &id,
        ) {
            Ok(fs) => (Some(fs), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let state_rx = self.shared.registry.insert(record, fs, generation)?;
        match provision_error {
            None => info!(worker = %id, generation, "worker record created"),
            Some(reason) => {
                warn!(worker = %id, reason, "scoped filesystem provisioning failed");
                self.shared.registry.mark_error(id.as_str(), &reason);
            }
        }
        drop(transition);

        Ok(WorkerHandle {
            id,
            shared: Arc::clone(&self.shared),
            state_rx,
        })
    }

    /// Send the executable bundle for a `building` worker to the host.
    ///
    /// The `worker:create` envelope carries the record's immutable options.
    /// The record moves to `ready` or `error` when the host's asynchronous
    /// `worker:created` outcome arrives.
    ///
    /// # Errors
    ///
    /// Unknown worker id (caller contract), a record no longer in
    /// `building` (already built, failed, or provisioning failed), an
    /// oversized bundle, or a dead host channel.
    pub async fn send_bundle(&self, id: &str, bundle: &str) -> Result<(), OrchestratorError> {
        if bundle.len() > MAX_BUNDLE_BYTES {
            return Err(OrchestratorError::BundleTooLarge {
                len: bundle.len(),
                max: MAX_BUNDLE_BYTES,
            });
        }
        let state = self
            .shared
            .registry
            .state_of(id)
            .ok_or_else(|| OrchestratorError::unknown_worker(id))?;
        if state != WorkerState::Building {
            return Err(OrchestratorError::NotBuilding {
                id: id.to_string(),
                state,
            });
        }
        let options = self
            .shared
            .registry
            .options_of(id)
            .ok_or_else(|| OrchestratorError::unknown_worker(id))?;
        let worker_id = WorkerId::parse(id)?;

        self.shared
            .supervisor
            .send(HostCommand::WorkerCreate {
                worker_id,
                bundle: bundle.to_string(),
                options,
            })
            .await?;
        Ok(())
    }

    /// Terminate a worker and wait for the host's confirmation.
    ///
    /// Idempotent: an unknown (or already removed) id is a successful
    /// no-op. With no live host there is nothing to confirm, so the record
    /// and filesystem are cleaned up immediately. Otherwise cleanup happens
    /// only when `worker:terminated` arrives (or crash handling confirms
    /// the worker is gone) — never eagerly at send time.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::TerminationPending`] when another call is
    /// already waiting on this worker, or the failure reason the host
    /// reported.
    pub async fn terminate_worker(&self, id: &str) -> Result<(), OrchestratorError> {
        let Ok(worker_id) = WorkerId::parse(id) else {
            // An invalid id can never name a record.
            return Ok(());
        };
        if !self.shared.registry.contains(id) {
            return Ok(());
        }
        if !self.shared.supervisor.is_running().await {
            self.cleanup_record(id).await;
            return Ok(());
        }

        let ticket = self.shared.terminations.register(id).map_err(|e| match e {
            PendingError::AlreadyPending { .. } => OrchestratorError::TerminationPending {
                id: id.to_string(),
            },
            other => OrchestratorError::Pending(other),
        })?;

        match self
            .shared
            .supervisor
            .send(HostCommand::WorkerTerminate { worker_id })
            .await
        {
            Ok(()) => {}
            Err(SupervisorError::NotRunning | SupervisorError::ChannelClosed) => {
                // The host died between the liveness check and the send.
                drop(ticket);
                self.cleanup_record(id).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match ticket.wait().await {
            Ok(()) => Ok(()),
            Err(PendingError::Rejected { reason }) => Err(OrchestratorError::TerminationFailed {
                id: id.to_string(),
                reason,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Terminate every live worker owned by `parent_id`.
    ///
    /// Used when an owner (typically a panel) goes away. Failures are
    /// collected per worker; one stubborn worker does not stop the sweep.
    pub async fn terminate_workers_of(
        &self,
        parent_id: &str,
    ) -> Vec<(WorkerId, Result<(), OrchestratorError>)> {
        let mut results = Vec::new();
        for id in self.shared.registry.ids_of_parent(parent_id) {
            let outcome = self.terminate_worker(id.as_str()).await;
            results.push((id, outcome));
        }
        results
    }

    /// Call a worker-side service and wait for the correlated response.
    ///
    /// `timeout` defaults to the configured invoke timeout. On expiry the
    /// pending entry is removed, so a response arriving later resolves
    /// nothing.
    ///
    /// # Errors
    ///
    /// Unknown worker, dead host channel,
    /// [`OrchestratorError::InvokeTimeout`] at the deadline, or the failure
    /// the worker reported.
    pub async fn invoke(
        &self,
        worker_id: &str,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, OrchestratorError> {
        if !self.shared.registry.contains(worker_id) {
            return Err(OrchestratorError::unknown_worker(worker_id));
        }
        let worker = WorkerId::parse(worker_id)?;
        let timeout = timeout.unwrap_or(self.shared.config.invoke_timeout);
        let request_id = Uuid::new_v4().to_string();

        let ticket = self.shared.invokes.register(&request_id)?;
        self.shared
            .supervisor
            .send(HostCommand::ServiceInvoke {
                request_id,
                worker_id: worker,
                service: service.to_string(),
                method: method.to_string(),
                args,
            })
            .await?;

        // A timeout cancels the wait and drops the ticket, which removes
        // the pending entry; that is what makes a late response a no-op.
        match tokio::time::timeout(timeout, ticket.wait()).await {
            Err(_) => Err(OrchestratorError::InvokeTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(PendingError::Rejected { reason })) => {
                Err(OrchestratorError::InvokeFailed { reason })
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Push a fire-and-forget event into a worker-side service.
    ///
    /// Delivery is best-effort; no response is expected or awaited.
    ///
    /// # Errors
    ///
    /// Unknown worker or a dead host channel.
    pub async fn push(
        &self,
        worker_id: &str,
        service: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), OrchestratorError> {
        if !self.shared.registry.contains(worker_id) {
            return Err(OrchestratorError::unknown_worker(worker_id));
        }
        let worker = WorkerId::parse(worker_id)?;
        self.shared
            .supervisor
            .send(HostCommand::ServicePush {
                worker_id: worker,
                service: service.to_string(),
                event: event.to_string(),
                payload,
            })
            .await?;
        Ok(())
    }

    /// Route an outbound message from a panel or the embedding application.
    ///
    /// Applies the same precedence as sandbox-originated traffic: `"main"`
    /// service dispatch, then worker forward, then panel delivery.
    /// Undeliverable messages are logged and dropped; this never fails.
    pub async fn route_rpc(&self, from_id: &str, to_id: &str, payload: Value) {
        crate::router::route_rpc(&self.shared, from_id, to_id, payload).await;
    }

    /// Register (or replace) the sink messages addressed to `panel_id` are
    /// delivered on.
    pub fn register_panel(&self, panel_id: &str, sink: mpsc::Sender<PanelMessage>) {
        self.shared.panels.insert(panel_id, sink);
    }

    /// Remove a panel sink. Returns whether one was registered.
    pub fn unregister_panel(&self, panel_id: &str) -> bool {
        self.shared.panels.remove(panel_id)
    }

    /// Register an application service.
    ///
    /// # Errors
    ///
    /// Built-in name collisions and registry overflow.
    pub fn register_service(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<(), OrchestratorError> {
        Ok(self.shared.services.register(name, handler)?)
    }

    /// Remove an application service. Returns whether one was registered;
    /// built-ins are never removed.
    pub fn unregister_service(&self, name: &str) -> bool {
        self.shared.services.unregister(name)
    }

    /// Snapshot one worker record.
    #[must_use]
    pub fn worker(&self, id: &str) -> Option<WorkerSnapshot> {
        self.shared.registry.snapshot(id)
    }

    /// Snapshot every worker record, ordered by creation.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.shared.registry.snapshots()
    }

    /// Stop the host process and the router task, failing every pending
    /// waiter.
    ///
    /// Worker directories are left on disk: shutdown is not a termination
    /// confirmation, and a later orchestrator may reattach to the same
    /// roots.
    pub async fn shutdown(&self) {
        self.shared.supervisor.stop().await;
        self.shared.invokes.drain(SHUTDOWN_ERROR);
        self.shared.terminations.drain(SHUTDOWN_ERROR);
        if let Some(router) = self.router.lock().expect("lock poisoned").take() {
            router.abort();
        }
        info!("orchestrator shut down");
    }

    /// Remove a record and destroy its filesystem without host involvement.
    async fn cleanup_record(&self, id: &str) {
        if let Some((_record, fs)) = self.shared.registry.remove(id) {
            if let Some(fs) = fs {
                if let Err(e) = fs.destroy().await {
                    warn!(worker = id, error = %e, "failed to destroy scoped filesystem");
                }
            }
            info!(worker = id, "worker cleaned up without host confirmation");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Ok(mut router) = self.router.lock() {
            if let Some(router) = router.take() {
                router.abort();
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workers", &self.shared.registry.len())
            .field("supervisor", &self.shared.supervisor)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// WorkerHandle
// =============================================================================

/// Cheap cloneable handle to one worker record.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// The worker's id.
    #[must_use]
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// The lifecycle state as last published.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// Snapshot the record, or `None` once it has been removed.
    #[must_use]
    pub fn snapshot(&self) -> Option<WorkerSnapshot> {
        self.shared.registry.snapshot(self.id.as_str())
    }

    /// Wait until the record leaves `building`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WorkerFailed`] with the recorded reason when
    /// the record lands in `error`, [`OrchestratorError::ReadyTimeout`] at
    /// the deadline, or [`OrchestratorError::UnknownWorker`] if the record
    /// is removed while waiting.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), OrchestratorError> {
        let mut state_rx = self.state_rx.clone();
        let settled = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    WorkerState::Ready => return Ok(()),
                    WorkerState::Error => {
                        let reason = self
                            .snapshot()
                            .and_then(|s| s.last_error)
                            .unwrap_or_else(|| "worker failed".to_string());
                        return Err(OrchestratorError::WorkerFailed {
                            id: self.id.as_str().to_string(),
                            reason,
                        });
                    }
                    WorkerState::Building => {
                        if state_rx.changed().await.is_err() {
                            return Err(OrchestratorError::unknown_worker(self.id.as_str()));
                        }
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, settled).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OrchestratorError::ReadyTimeout {
                id: self.id.as_str().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure of a public orchestrator operation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The id hint (or a caller-supplied id) is not a valid worker id.
    #[error("invalid worker id: {0}")]
    InvalidWorkerId(#[from] WorkerIdError),

    /// The worker options failed validation.
    #[error(transparent)]
    InvalidOptions(#[from] WorkerOptionsError),

    /// The source ref exceeds the permitted length.
    #[error("source ref is {len} bytes, maximum is {max}")]
    SourceRefTooLong {
        /// Actual length in bytes.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// A live record already holds the requested id.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The host process could not be spawned, readied, or reached.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// No record holds the id.
    #[error("unknown worker `{id}`")]
    UnknownWorker {
        /// The requested id.
        id: String,
    },

    /// The record is past `building`; the bundle window has closed.
    #[error("worker `{id}` is `{state}`, expected `building`")]
    NotBuilding {
        /// The worker.
        id: String,
        /// Its current state.
        state: WorkerState,
    },

    /// The bundle exceeds the wire ceiling.
    #[error("bundle is {len} bytes, maximum is {max}")]
    BundleTooLarge {
        /// Actual length in bytes.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// Another termination of the same worker is already awaiting
    /// confirmation.
    #[error("termination of worker `{id}` is already pending")]
    TerminationPending {
        /// The worker.
        id: String,
    },

    /// The host reported a termination failure.
    #[error("termination of worker `{id}` failed: {reason}")]
    TerminationFailed {
        /// The worker.
        id: String,
        /// The host's reason.
        reason: String,
    },

    /// The invoke deadline elapsed before a response arrived.
    #[error("invoke timed out after {timeout_ms} ms")]
    InvokeTimeout {
        /// The configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The worker-side service reported a failure.
    #[error("invoke failed: {reason}")]
    InvokeFailed {
        /// The reported reason.
        reason: String,
    },

    /// The worker landed in its terminal error state.
    #[error("worker `{id}` failed: {reason}")]
    WorkerFailed {
        /// The worker.
        id: String,
        /// The recorded `last_error`.
        reason: String,
    },

    /// The ready wait deadline elapsed with the worker still `building`.
    #[error("worker `{id}` not ready within {timeout_ms} ms")]
    ReadyTimeout {
        /// The worker.
        id: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// A service registration failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A pending-table failure other than the specialized ones above.
    #[error(transparent)]
    Pending(#[from] PendingError),
}

impl OrchestratorError {
    fn unknown_worker(id: &str) -> Self {
        OrchestratorError::UnknownWorker { id: id.to_string() }
    }
}
