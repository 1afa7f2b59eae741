//! Inbound routing and message fan-out.
//!
//! One router task consumes the supervisor's signal stream and fans out:
//! lifecycle events update the worker registry, service traffic dispatches
//! to handlers, rpc traffic routes by address, and crash notifications
//! trigger the cleanup sweep.
//!
//! # Addressing
//!
//! `rpc:forward{fromId, toId, payload}` routes by strict precedence:
//!
//! 1. `toId == "main"` and the payload is a request: service dispatch.
//!    Responses (and malformed-method errors) travel back as
//!    `rpc:forward` from `"main"` to the caller.
//! 2. `toId` names a worker record: forwarded verbatim to the host.
//! 3. A panel sink is registered under `toId`: handed to the panel.
//! 4. Nobody: logged and dropped. Routing failures never raise.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use warren_core::pending::PendingError;
use warren_core::protocol::{
    split_service_method, ConsoleLevel, HostCommand, HostEvent, RpcPayload, MAIN_ADDRESS,
};

use crate::orchestrator::Shared;
use crate::services::ServiceContext;
use crate::supervisor::HostSignal;

/// `last_error` value every worker carries after its host dies under it.
pub const HOST_CRASH_ERROR: &str = "host process crashed";

// =============================================================================
// Panels and console
// =============================================================================

/// One message delivered to a panel sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelMessage {
    /// Originating address (usually a worker id).
    pub from_id: String,
    /// Opaque rpc payload.
    pub payload: Value,
}

/// One captured console line, delivered to the console sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleLine {
    /// Worker that produced the output.
    pub worker_id: String,
    /// Console level.
    pub level: ConsoleLevel,
    /// Flattened message text.
    pub line: String,
}

/// Name-to-sink map for registered panels.
pub(crate) struct PanelRegistry {
    sinks: std::sync::Mutex<HashMap<String, mpsc::Sender<PanelMessage>>>,
}

impl PanelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sinks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register or replace a panel sink.
    pub(crate) fn insert(&self, panel_id: &str, sink: mpsc::Sender<PanelMessage>) {
        self.sinks
            .lock()
            .expect("lock poisoned")
            .insert(panel_id.to_string(), sink);
    }

    /// Remove a panel sink. Returns whether one was registered.
    pub(crate) fn remove(&self, panel_id: &str) -> bool {
        self.sinks
            .lock()
            .expect("lock poisoned")
            .remove(panel_id)
            .is_some()
    }

    pub(crate) fn get(&self, panel_id: &str) -> Option<mpsc::Sender<PanelMessage>> {
        self.sinks
            .lock()
            .expect("lock poisoned")
            .get(panel_id)
            .cloned()
    }
}

impl std::fmt::Debug for PanelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sinks = self.sinks.lock().expect("lock poisoned");
        f.debug_struct("PanelRegistry")
            .field("len", &sinks.len())
            .finish()
    }
}

// =============================================================================
// Router task
// =============================================================================

/// Consume the signal stream until it closes.
pub(crate) async fn run_router(shared: Arc<Shared>, mut signals: mpsc::Receiver<HostSignal>) {
    while let Some(signal) = signals.recv().await {
        handle_signal(&shared, signal).await;
    }
    debug!("signal stream closed; router task ending");
}

async fn handle_signal(shared: &Arc<Shared>, signal: HostSignal) {
    match signal {
        HostSignal::Event { event, .. } => handle_event(shared, event).await,
        HostSignal::Crashed { generation, reason } => {
            handle_crash(shared, generation, &reason).await;
        }
    }
}

async fn handle_event(shared: &Arc<Shared>, event: HostEvent) {
    match event {
        // The supervisor consumes the handshake; anything here is noise.
        HostEvent::Ready => warn!("ignoring stray ready event"),

        HostEvent::WorkerCreated {
            worker_id,
            success,
            error,
        } => {
            if success {
                if shared.registry.mark_ready(&worker_id) {
                    info!(worker = %worker_id, "worker ready");
                } else {
                    debug!(worker = %worker_id, "ignoring worker:created for unknown or settled worker");
                }
            } else {
                let reason = error.unwrap_or_else(|| "worker creation failed".to_string());
                if shared.registry.mark_error(&worker_id, &reason) {
                    warn!(worker = %worker_id, reason, "worker failed to build");
                } else {
                    debug!(worker = %worker_id, "ignoring worker:created failure for unknown worker");
                }
            }
        }

        HostEvent::WorkerTerminated {
            worker_id,
            success,
            error,
        } => {
            if success {
                if let Some((_record, fs)) = shared.registry.remove(&worker_id) {
                    if let Some(fs) = fs {
                        if let Err(e) = fs.destroy().await {
                            warn!(worker = %worker_id, error = %e, "failed to destroy scoped filesystem");
                        }
                    }
                    info!(worker = %worker_id, "worker terminated");
                } else {
                    trace!(worker = %worker_id, "ignoring worker:terminated for unknown worker");
                }
                if !shared.terminations.complete(&worker_id, Ok(())) {
                    trace!(worker = %worker_id, "no pending termination waiter");
                }
            } else {
                let reason = error.unwrap_or_else(|| "termination failed".to_string());
                shared.registry.record_error(&worker_id, &reason);
                shared
                    .terminations
                    .complete(&worker_id, Err(PendingError::rejected(&reason)));
                warn!(worker = %worker_id, reason, "host failed to terminate worker");
            }
        }

        HostEvent::RpcForward {
            from_id,
            to_id,
            payload,
        } => {
            route_rpc(shared, &from_id, &to_id, payload).await;
        }

        HostEvent::ServiceCall {
            worker_id,
            request_id,
            service,
            method,
            args,
        } => {
            // Dispatched off the router task: a slow handler (fetch, big
            // file) must not stall routing.
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let ctx = ServiceContext::new(&worker_id, shared.registry.fs_of(&worker_id));
                let outcome = shared
                    .services
                    .dispatch(&ctx, &service, &method, &args)
                    .await;
                let response = match outcome {
                    Ok(value) => HostCommand::ServiceResponse {
                        request_id,
                        result: Some(value),
                        error: None,
                    },
                    Err(e) => {
                        debug!(worker = %worker_id, service, method, error = %e, "service call failed");
                        HostCommand::ServiceResponse {
                            request_id,
                            result: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                if let Err(e) = shared.supervisor.send(response).await {
                    warn!(error = %e, "failed to send service response");
                }
            });
        }

        HostEvent::ServiceInvokeResponse {
            request_id,
            result,
            error,
        } => {
            let outcome = match error {
                Some(reason) => Err(PendingError::rejected(reason)),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            if !shared.invokes.complete(&request_id, outcome) {
                trace!(request_id, "late or unknown invoke response; ignoring");
            }
        }

        HostEvent::ConsoleLog {
            worker_id,
            level,
            args,
        } => {
            let line = flatten_console_args(&args);
            match level {
                ConsoleLevel::Debug => debug!(worker = %worker_id, "{line}"),
                ConsoleLevel::Info | ConsoleLevel::Log => info!(worker = %worker_id, "{line}"),
                ConsoleLevel::Warn => warn!(worker = %worker_id, "{line}"),
                ConsoleLevel::Error => error!(worker = %worker_id, "{line}"),
            }
            if let Some(sink) = &shared.console_sink {
                if sink
                    .try_send(ConsoleLine {
                        worker_id,
                        level,
                        line,
                    })
                    .is_err()
                {
                    trace!("console sink full or closed; dropping line");
                }
            }
        }

        HostEvent::WorkerError {
            worker_id,
            error,
            fatal,
        } => {
            warn!(worker = %worker_id, error, fatal, "worker reported an error");
            if fatal {
                shared.registry.mark_error(&worker_id, &error);
            } else {
                shared.registry.record_error(&worker_id, &error);
            }
        }
    }
}

// =============================================================================
// RPC routing
// =============================================================================

/// Route one rpc message by the address precedence rules.
///
/// Never raises: undeliverable messages are logged and dropped.
pub(crate) async fn route_rpc(shared: &Arc<Shared>, from_id: &str, to_id: &str, payload: Value) {
    if to_id == MAIN_ADDRESS {
        match RpcPayload::parse(&payload) {
            Some(RpcPayload::Request { id, method, args }) => {
                dispatch_main_request(shared, from_id, id, method, args);
            }
            Some(RpcPayload::Response { .. }) => {
                debug!(from = from_id, "dropping rpc response addressed to main");
            }
            None => {
                debug!(from = from_id, "dropping malformed rpc payload addressed to main");
            }
        }
        return;
    }
    deliver_non_main(shared, from_id, to_id, payload).await;
}

/// Rules 2-4: worker forward, panel delivery, or drop.
async fn deliver_non_main(shared: &Arc<Shared>, from_id: &str, to_id: &str, payload: Value) {
    if shared.registry.contains(to_id) {
        let command = HostCommand::RpcForward {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            payload,
        };
        if let Err(e) = shared.supervisor.send(command).await {
            warn!(from = from_id, to = to_id, error = %e, "dropping rpc forward");
        }
        return;
    }

    if let Some(sink) = shared.panels.get(to_id) {
        let message = PanelMessage {
            from_id: from_id.to_string(),
            payload,
        };
        match sink.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(panel = to_id, "panel sink full; dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                shared.panels.remove(to_id);
                warn!(panel = to_id, "panel sink closed; unregistered");
            }
        }
        return;
    }

    debug!(from = from_id, to = to_id, "no route for rpc message; dropping");
}

/// Rule 1: dispatch a request addressed to `"main"` and answer the caller.
fn dispatch_main_request(
    shared: &Arc<Shared>,
    from_id: &str,
    id: Option<Value>,
    method: String,
    args: Vec<Value>,
) {
    let shared = Arc::clone(shared);
    let from = from_id.to_string();
    tokio::spawn(async move {
        let response = match split_service_method(&method) {
            None => RpcPayload::response_err(
                id,
                format!("malformed method `{method}`; expected `service.method`"),
            ),
            Some((service, service_method)) => {
                let ctx = ServiceContext::new(&from, shared.registry.fs_of(&from));
                match shared
                    .services
                    .dispatch(&ctx, service, service_method, &args)
                    .await
                {
                    Ok(value) => RpcPayload::response_ok(id, value),
                    Err(e) => RpcPayload::response_err(id, e.to_string()),
                }
            }
        };
        deliver_non_main(&shared, MAIN_ADDRESS, &from, response).await;
    });
}

// =============================================================================
// Crash cleanup
// =============================================================================

/// Sweep all state attached to a dead host connection.
///
/// Runs under the host transition lock so a concurrent `ensure_running`
/// cannot interleave with the sweep. Order matters: workers with a pending
/// termination are confirmed dead (their waiters succeed and their state
/// is cleaned up); every other worker of the dead generation moves to
/// `Error`; then all pending invokes fail.
async fn handle_crash(shared: &Arc<Shared>, generation: u64, reason: &str) {
    let _guard = shared.host_transition.lock().await;

    let mut errored = 0usize;
    let mut terminated = 0usize;
    for id in shared.registry.ids_up_to_generation(generation) {
        let key = id.as_str();
        if shared.terminations.contains(key) {
            if let Some((_record, fs)) = shared.registry.remove(key) {
                if let Some(fs) = fs {
                    if let Err(e) = fs.destroy().await {
                        warn!(worker = key, error = %e, "failed to destroy scoped filesystem");
                    }
                }
            }
            shared.terminations.complete(key, Ok(()));
            terminated += 1;
        } else {
            shared.registry.mark_error(key, HOST_CRASH_ERROR);
            errored += 1;
        }
    }

    let failed_invokes = shared.invokes.drain(HOST_CRASH_ERROR);
    warn!(
        generation,
        reason, errored, terminated, failed_invokes, "host crash cleanup complete"
    );
}

/// Flatten console arguments to one line: strings verbatim, everything
/// else compact JSON, space-joined.
fn flatten_console_args(args: &[Value]) -> String {
    let parts: Vec<String> = args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    parts.join(" ")
}
