//! Wire protocol for the orchestrator ↔ host-process channel.
//!
//! The channel carries newline-delimited JSON envelopes over the host
//! process's stdin/stdout. Every envelope has a `type` discriminator;
//! [`HostCommand`] covers the orchestrator → host direction and
//! [`HostEvent`] the host → orchestrator direction. `rpc:forward` is
//! symmetric and appears in both.
//!
//! # Framing
//!
//! One envelope per line, encoded with [`encode_line`] and decoded with
//! [`decode_line`]. JSON string escaping guarantees an encoded envelope
//! never contains a raw newline. Lines beyond [`MAX_LINE_BYTES`] are
//! rejected rather than buffered. Host stdout lines that fail to decode are
//! not protocol errors: the transport relays them to logging and moves on.
//!
//! # Correlation
//!
//! `service:call`/`service:response` and
//! `service:invoke`/`service:invoke-response` pair up via `requestId`.
//! RPC request/response payloads carried inside `rpc:forward` correlate via
//! their embedded `id` (see [`RpcPayload`]).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::worker::{WorkerId, WorkerOptions};

/// Reserved routing address for the orchestrator's own service layer.
pub const MAIN_ADDRESS: &str = "main";

/// Hard ceiling for one encoded envelope line, in bytes.
///
/// Must stay above [`MAX_BUNDLE_BYTES`] with room for envelope overhead,
/// since bundles travel inside `worker:create` lines.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Maximum size of a code bundle accepted by `send_bundle`, in bytes.
pub const MAX_BUNDLE_BYTES: usize = 4 * 1024 * 1024;

// =============================================================================
// Envelopes
// =============================================================================

/// Envelope sent from the orchestrator to the host process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostCommand {
    /// Ask the host to create a sandbox and load the given bundle into it.
    #[serde(rename = "worker:create", rename_all = "camelCase")]
    WorkerCreate {
        /// Id of the worker record this sandbox belongs to.
        worker_id: WorkerId,
        /// Opaque executable payload.
        bundle: String,
        /// Immutable sandbox options from the worker record.
        options: WorkerOptions,
    },

    /// Ask the host to tear a sandbox down. Confirmed by
    /// [`HostEvent::WorkerTerminated`].
    #[serde(rename = "worker:terminate", rename_all = "camelCase")]
    WorkerTerminate {
        /// Worker to terminate.
        worker_id: WorkerId,
    },

    /// Verbatim message forward into a sandbox.
    #[serde(rename = "rpc:forward", rename_all = "camelCase")]
    RpcForward {
        /// Sender address.
        from_id: String,
        /// Destination worker id.
        to_id: String,
        /// Opaque payload; see [`RpcPayload`] for the request/response
        /// shapes the router understands.
        payload: Value,
    },

    /// The single response to a [`HostEvent::ServiceCall`].
    #[serde(rename = "service:response", rename_all = "camelCase")]
    ServiceResponse {
        /// Correlation id copied from the call.
        request_id: String,
        /// Present on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Present on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Fire-and-forget event pushed into a worker-side service.
    #[serde(rename = "service:push", rename_all = "camelCase")]
    ServicePush {
        /// Destination worker.
        worker_id: WorkerId,
        /// Worker-side service name.
        service: String,
        /// Event name.
        event: String,
        /// Event payload.
        payload: Value,
    },

    /// Correlated call into a worker-side service; answered by
    /// [`HostEvent::ServiceInvokeResponse`].
    #[serde(rename = "service:invoke", rename_all = "camelCase")]
    ServiceInvoke {
        /// Correlation id, unique per in-flight invoke.
        request_id: String,
        /// Destination worker.
        worker_id: WorkerId,
        /// Worker-side service name.
        service: String,
        /// Method to invoke.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
}

impl HostCommand {
    /// Wire name of this envelope's `type` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            HostCommand::WorkerCreate { .. } => "worker:create",
            HostCommand::WorkerTerminate { .. } => "worker:terminate",
            HostCommand::RpcForward { .. } => "rpc:forward",
            HostCommand::ServiceResponse { .. } => "service:response",
            HostCommand::ServicePush { .. } => "service:push",
            HostCommand::ServiceInvoke { .. } => "service:invoke",
        }
    }
}

/// Envelope sent from the host process to the orchestrator.
///
/// Worker ids arrive as plain strings: the host is not trusted to only name
/// workers that exist, and the router treats unknown ids as ignorable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    /// Startup handshake; must be the first event after spawn.
    #[serde(rename = "ready")]
    Ready,

    /// Outcome of a `worker:create`.
    #[serde(rename = "worker:created", rename_all = "camelCase")]
    WorkerCreated {
        /// Worker the outcome applies to.
        worker_id: String,
        /// Whether the sandbox came up.
        success: bool,
        /// Failure reason when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Outcome of a `worker:terminate`; the orchestrator only cleans up
    /// worker state on this confirmation.
    #[serde(rename = "worker:terminated", rename_all = "camelCase")]
    WorkerTerminated {
        /// Worker the outcome applies to.
        worker_id: String,
        /// Whether the sandbox was torn down.
        success: bool,
        /// Failure reason when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Message leaving a sandbox, to be routed by address.
    #[serde(rename = "rpc:forward", rename_all = "camelCase")]
    RpcForward {
        /// Originating worker id.
        from_id: String,
        /// Destination address: `"main"`, a worker id, or a panel id.
        to_id: String,
        /// Opaque payload.
        payload: Value,
    },

    /// Worker-initiated call to an orchestrator-side service. Must be
    /// answered by exactly one [`HostCommand::ServiceResponse`].
    #[serde(rename = "service:call", rename_all = "camelCase")]
    ServiceCall {
        /// Calling worker.
        worker_id: String,
        /// Correlation id to echo in the response.
        request_id: String,
        /// Service name.
        service: String,
        /// Method name.
        method: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Response to a [`HostCommand::ServiceInvoke`]. Unknown correlation
    /// ids are ignored.
    #[serde(rename = "service:invoke-response", rename_all = "camelCase")]
    ServiceInvokeResponse {
        /// Correlation id copied from the invoke.
        request_id: String,
        /// Present on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Present on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Console output captured inside a sandbox.
    #[serde(rename = "console:log", rename_all = "camelCase")]
    ConsoleLog {
        /// Worker that produced the output.
        worker_id: String,
        /// Console level.
        level: ConsoleLevel,
        /// Raw console arguments; flattened by the router.
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Worker fault report. `fatal` moves the record to its terminal error
    /// state; non-fatal reports only update `last_error`.
    #[serde(rename = "worker:error", rename_all = "camelCase")]
    WorkerError {
        /// Worker the fault applies to.
        worker_id: String,
        /// Fault description.
        error: String,
        /// Whether the sandbox is beyond recovery.
        #[serde(default)]
        fatal: bool,
    },
}

impl HostEvent {
    /// Wire name of this envelope's `type` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            HostEvent::Ready => "ready",
            HostEvent::WorkerCreated { .. } => "worker:created",
            HostEvent::WorkerTerminated { .. } => "worker:terminated",
            HostEvent::RpcForward { .. } => "rpc:forward",
            HostEvent::ServiceCall { .. } => "service:call",
            HostEvent::ServiceInvokeResponse { .. } => "service:invoke-response",
            HostEvent::ConsoleLog { .. } => "console:log",
            HostEvent::WorkerError { .. } => "worker:error",
        }
    }
}

/// Console level emitted by sandboxed code.
///
/// `log` is the plain `console.log` level and maps to `info` severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    /// Diagnostic chatter.
    Debug,
    /// Informational output.
    Info,
    /// Something suspicious.
    Warn,
    /// Something broken.
    Error,
    /// Plain `console.log`.
    Log,
}

impl ConsoleLevel {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Debug => "debug",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Log => "log",
        }
    }
}

// =============================================================================
// RPC payloads
// =============================================================================

/// The request/response shapes the router understands inside an
/// `rpc:forward` payload.
///
/// Payloads addressed anywhere but [`MAIN_ADDRESS`] stay opaque; only the
/// service-layer route interprets them. The correlation `id` is kept as a
/// raw [`Value`] so string and numeric ids both survive the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcPayload {
    /// A service request: `method` is `"<service>.<method>"`.
    #[serde(rename = "request")]
    Request {
        /// Caller-chosen correlation id, echoed in the response.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Qualified method string.
        method: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
    },

    /// A service response.
    #[serde(rename = "response")]
    Response {
        /// Correlation id copied from the request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Present on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Present on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RpcPayload {
    /// Parse a forwarded payload, returning `None` when it is not an RPC
    /// shape (which routing treats as opaque).
    #[must_use]
    pub fn parse(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    /// Whether a payload looks like a service request.
    #[must_use]
    pub fn is_request(payload: &Value) -> bool {
        matches!(Self::parse(payload), Some(RpcPayload::Request { .. }))
    }

    /// Build a success response payload.
    #[must_use]
    pub fn response_ok(id: Option<Value>, result: Value) -> Value {
        let mut payload = json!({ "type": "response", "result": result });
        if let Some(id) = id {
            payload["id"] = id;
        }
        payload
    }

    /// Build an error response payload.
    #[must_use]
    pub fn response_err(id: Option<Value>, error: impl Into<String>) -> Value {
        let mut payload = json!({ "type": "response", "error": error.into() });
        if let Some(id) = id {
            payload["id"] = id;
        }
        payload
    }
}

/// Split a qualified `"<service>.<method>"` string at the first dot.
///
/// Returns `None` when there is no dot or either part is empty; the method
/// part may itself contain further dots.
#[must_use]
pub fn split_service_method(qualified: &str) -> Option<(&str, &str)> {
    let (service, method) = qualified.split_once('.')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

// =============================================================================
// Line codec
// =============================================================================

/// Encode one envelope as a single JSON line (without the trailing newline).
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] when serialization fails and
/// [`ProtocolError::Oversize`] when the encoded form exceeds
/// [`MAX_LINE_BYTES`].
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(message).map_err(ProtocolError::Encode)?;
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::Oversize {
            len: line.len(),
            max: MAX_LINE_BYTES,
        });
    }
    Ok(line)
}

/// Decode one line into an envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::Oversize`] for lines beyond [`MAX_LINE_BYTES`]
/// and [`ProtocolError::Decode`] for anything that is not a valid envelope.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::Oversize {
            len: line.len(),
            max: MAX_LINE_BYTES,
        });
    }
    let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
    serde_json::from_str(trimmed).map_err(ProtocolError::Decode)
}

/// Wire codec failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    /// Line is not a valid envelope.
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    /// Line exceeds the protocol ceiling.
    #[error("envelope line is {len} bytes, maximum is {max}")]
    Oversize {
        /// Actual length in bytes.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },
}
