//! warren-orchestrator - Sandbox Worker Orchestration Runtime
//!
//! Runs many untrusted script workers inside one supervised host process
//! and multiplexes all of their traffic over a single message channel.
//! The orchestrator:
//!
//! - supervises the host process (lazy spawn, `ready` handshake, crash
//!   detection, no automatic respawn);
//! - tracks worker lifecycles through a forward-only state machine
//!   (`building → ready | error`);
//! - routes messages between workers, UI panels, and orchestrator-side
//!   services under one addressing scheme (`"main"` is the service layer);
//! - answers worker service calls through a pluggable registry with
//!   built-in `fs` (scoped filesystem) and `network` (fetch) services;
//! - offers correlated [`invoke`](orchestrator::Orchestrator::invoke) and
//!   fire-and-forget [`push`](orchestrator::Orchestrator::push) primitives
//!   into workers.
//!
//! Wire types, worker records, pending tables, scoped filesystems, and
//! configuration live in [`warren_core`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use warren_core::config::{HostProcessConfig, OrchestratorConfig};
//! use warren_core::worker::WorkerSpec;
//! use warren_orchestrator::Orchestrator;
//!
//! # async fn run() -> Result<(), warren_orchestrator::OrchestratorError> {
//! let config = OrchestratorConfig::new(
//!     HostProcessConfig::new("sandbox-host").with_arg("--stdio"),
//! );
//! let orchestrator = Orchestrator::builder(config).build()?;
//!
//! let worker = orchestrator
//!     .create_worker(WorkerSpec::new("bundle@1.0.0").with_id_hint("singleton-x"))
//!     .await?;
//! orchestrator
//!     .send_bundle(worker.id().as_str(), "export default {};")
//!     .await?;
//! worker.wait_ready(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod orchestrator;
pub mod registry;
mod router;
pub mod services;
pub mod supervisor;

pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorError, WorkerHandle};
pub use router::{ConsoleLine, PanelMessage, HOST_CRASH_ERROR};
pub use services::{ServiceContext, ServiceError, ServiceHandler, ServiceRegistry};
pub use supervisor::{
    HostConnection, HostLauncher, HostSignal, HostSupervisor, ProcessLauncher, SupervisorError,
};
