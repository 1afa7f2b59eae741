//! Host process supervision.
//!
//! The orchestrator owns at most ONE host process. [`HostSupervisor`]
//! tracks that single slot: lazy spawn with a `ready` handshake, command
//! sending, exit watching, and an explicit kill path. There is no automatic
//! respawn; a crash empties the slot and the next [`ensure_running`]
//! (typically from the next worker creation) starts a fresh process.
//!
//! # Architecture
//!
//! ```text
//!             ensure_running / send / stop
//!                        |
//!                  HostSupervisor ---- HostSignal stream ----> router task
//!                        |
//!                  HostLauncher (trait)
//!                        |
//!              +---------+----------+
//!              |                    |
//!        ProcessLauncher      test launchers
//!        (tokio::process,     (in-memory channel
//!         NDJSON over stdio)   pairs)
//! ```
//!
//! [`ProcessLauncher`] speaks the protocol over the child's stdin/stdout,
//! one JSON envelope per line. Unparseable stdout lines and all stderr
//! lines are relayed to logging and never break the channel.
//!
//! Every live connection carries a monotonically increasing generation
//! number. Crash notifications are tagged with it so cleanup can tell
//! workers of the dead process apart from workers racing onto a fresh one.
//!
//! [`ensure_running`]: HostSupervisor::ensure_running

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, trace, warn};
use warren_core::config::HostProcessConfig;
use warren_core::protocol::{decode_line, encode_line, HostCommand, HostEvent, MAX_LINE_BYTES};

/// Buffer depth for the outbound command channel.
const OUTBOUND_BUFFER: usize = 256;

/// Buffer depth for the inbound event channel.
const INBOUND_BUFFER: usize = 256;

/// Buffer depth for the merged signal stream consumed by the router.
const SIGNAL_BUFFER: usize = 256;

/// How long to wait for an exit status report after the host's output
/// closes during startup.
const EXIT_REPORT_GRACE: Duration = Duration::from_millis(500);

/// Longest host output fragment quoted in relay logs.
const MAX_RELAYED_LINE: usize = 512;

// =============================================================================
// Launcher seam
// =============================================================================

/// Channel halves of one launched host process.
///
/// A launcher hands the supervisor this bundle and keeps whatever pump
/// tasks it needs running behind it.
pub struct HostConnection {
    /// Command sink feeding the host.
    pub outbound: mpsc::Sender<HostCommand>,
    /// Decoded events arriving from the host. Closes when the host's
    /// output ends.
    pub inbound: mpsc::Receiver<HostEvent>,
    /// Resolves once with a human-readable exit status description.
    pub exited: oneshot::Receiver<String>,
    /// Fire to forcibly terminate the host.
    pub kill: oneshot::Sender<()>,
}

impl std::fmt::Debug for HostConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConnection").finish_non_exhaustive()
    }
}

/// Factory for host connections.
///
/// The default implementation is [`ProcessLauncher`]; tests inject
/// in-memory implementations to script host behavior without processes.
#[async_trait]
pub trait HostLauncher: Send + Sync {
    /// Start a host and return its channel halves.
    ///
    /// # Errors
    ///
    /// Launch failures (spawn error, missing stdio pipes).
    async fn launch(&self, config: &HostProcessConfig) -> Result<HostConnection, SupervisorError>;
}

/// Launcher that spawns the configured program and speaks newline-delimited
/// JSON over its stdin/stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl HostLauncher for ProcessLauncher {
    async fn launch(&self, config: &HostProcessConfig) -> Result<HostConnection, SupervisorError> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(config.kill_on_drop);
        for (name, value) in &config.env {
            command.env(name, value);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: config.program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| SupervisorError::StartupFailed {
            reason: "failed to capture host stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::StartupFailed {
            reason: "failed to capture host stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SupervisorError::StartupFailed {
            reason: "failed to capture host stderr".to_string(),
        })?;

        info!(program = %config.program.display(), pid, "spawned host process");

        let (outbound_tx, outbound_rx) = mpsc::channel::<HostCommand>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<HostEvent>(INBOUND_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel::<String>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(write_commands(stdin, outbound_rx));
        tokio::spawn(read_events(stdout, inbound_tx));
        tokio::spawn(relay_stderr(stderr));
        tokio::spawn(watch_exit(child, kill_rx, exit_tx));

        Ok(HostConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
            exited: exit_rx,
            kill: kill_tx,
        })
    }
}

/// Writer pump: encodes commands onto the child's stdin, one per line.
async fn write_commands(
    mut stdin: tokio::process::ChildStdin,
    mut commands: mpsc::Receiver<HostCommand>,
) {
    while let Some(command) = commands.recv().await {
        let line = match encode_line(&command) {
            Ok(line) => line,
            Err(e) => {
                error!(kind = command.kind(), error = %e, "failed to encode host command");
                continue;
            }
        };
        trace!(kind = command.kind(), "sending host command");
        if stdin.write_all(line.as_bytes()).await.is_err()
            || stdin.write_all(b"\n").await.is_err()
            || stdin.flush().await.is_err()
        {
            debug!("host stdin closed; writer pump ending");
            break;
        }
    }
    // Dropping stdin closes the pipe, giving the host an EOF to exit on.
}

/// Reader pump: decodes stdout lines into events, relaying noise to logs.
async fn read_events(stdout: tokio::process::ChildStdout, events: mpsc::Sender<HostEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        match read_line_bounded(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(0) => {
                debug!("host stdout reached EOF");
                break;
            }
            Ok(consumed) if consumed >= MAX_LINE_BYTES => {
                warn!(consumed, "dropping oversized host line");
            }
            Ok(_) => {
                let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
                if trimmed.is_empty() {
                    continue;
                }
                match decode_line::<HostEvent>(trimmed) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        // Not an envelope: relay the host's own output.
                        info!(line = clip(trimmed), "host stdout");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "host stdout read failed");
                break;
            }
        }
    }
}

/// Relays every stderr line to logging, best-effort.
async fn relay_stderr(stderr: tokio::process::ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        match read_line_bounded(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
                if !trimmed.is_empty() {
                    info!(line = clip(trimmed), "host stderr");
                }
            }
        }
    }
}

/// Waits for the child to exit, or kills it on demand, and reports the
/// final status.
async fn watch_exit(
    mut child: tokio::process::Child,
    mut kill: oneshot::Receiver<()>,
    exited: oneshot::Sender<String>,
) {
    let description = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        },
        _ = &mut kill => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "host already gone at kill");
            }
            match child.wait().await {
                Ok(status) => format!("killed ({status})"),
                Err(e) => format!("wait failed after kill: {e}"),
            }
        }
    };
    let _ = exited.send(description);
}

/// Reads one newline-terminated line, keeping at most `max_len` bytes.
///
/// Reads raw bytes so multi-byte characters split across buffer refills
/// survive, converting to UTF-8 (lossy on invalid input) only once the
/// line is complete. Returns the bytes consumed from the stream; `0` is
/// EOF, and a count at or above `max_len` means the kept portion was
/// truncated.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut String,
    max_len: usize,
) -> std::io::Result<usize> {
    use tokio::io::AsyncBufReadExt;

    line.clear();
    let mut kept: Vec<u8> = Vec::new();
    let mut consumed_total = 0usize;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !kept.is_empty() {
                *line = String::from_utf8_lossy(&kept).into_owned();
            }
            return Ok(consumed_total);
        }

        let (consume, found_newline) = match memchr::memchr(b'\n', available) {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let room = max_len.saturating_sub(consumed_total);
        kept.extend_from_slice(&available[..consume.min(room)]);
        reader.consume(consume);
        consumed_total += consume;

        if found_newline || consumed_total >= max_len {
            *line = String::from_utf8_lossy(&kept).into_owned();
            return Ok(consumed_total);
        }
    }
}

/// Shortens a host output line for log relay.
fn clip(line: &str) -> String {
    if line.len() <= MAX_RELAYED_LINE {
        line.to_string()
    } else {
        let mut shortened: String = line.chars().take(MAX_RELAYED_LINE).collect();
        shortened.push_str("...");
        shortened
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Merged stream the router consumes: decoded host events plus crash
/// notifications, all tagged with the connection generation.
#[derive(Debug)]
pub enum HostSignal {
    /// A decoded event from the live host.
    Event {
        /// Generation of the connection that produced it.
        generation: u64,
        /// The event.
        event: HostEvent,
    },
    /// The host process went away without being stopped.
    Crashed {
        /// Generation of the dead connection.
        generation: u64,
        /// Exit status description.
        reason: String,
    },
}

/// A live, ready host connection.
struct LiveHost {
    generation: u64,
    outbound: mpsc::Sender<HostCommand>,
    kill: Option<oneshot::Sender<()>>,
    /// Set by [`HostSupervisor::stop`] so the relay task does not report a
    /// deliberate shutdown as a crash.
    stopped: Arc<AtomicBool>,
}

struct SupervisorState {
    generation: u64,
    live: Option<LiveHost>,
}

/// Supervises the single host process slot.
pub struct HostSupervisor {
    config: HostProcessConfig,
    launcher: Arc<dyn HostLauncher>,
    state: Arc<Mutex<SupervisorState>>,
    signal_tx: mpsc::Sender<HostSignal>,
}

impl std::fmt::Debug for HostSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSupervisor")
            .field("program", &self.config.program)
            .finish_non_exhaustive()
    }
}

impl HostSupervisor {
    /// Build a supervisor and the signal stream its connections feed.
    #[must_use]
    pub fn new(
        config: HostProcessConfig,
        launcher: Arc<dyn HostLauncher>,
    ) -> (Self, mpsc::Receiver<HostSignal>) {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        (
            Self {
                config,
                launcher,
                state: Arc::new(Mutex::new(SupervisorState {
                    generation: 0,
                    live: None,
                })),
                signal_tx,
            },
            signal_rx,
        )
    }

    /// Ensure a ready host process exists, spawning one if needed.
    ///
    /// Idempotent: with a live host this returns its generation without
    /// side effects. Concurrent callers single-flight behind one lock, so
    /// exactly one process is ever spawned. The `ready` handshake must be
    /// the FIRST inbound event, within the configured ready timeout;
    /// anything else tears the fresh process down and leaves the slot
    /// empty.
    ///
    /// # Errors
    ///
    /// Spawn failures, handshake timeout, host exit before ready, or a
    /// wrong first event.
    pub async fn ensure_running(&self) -> Result<u64, SupervisorError> {
        let mut state = self.state.lock().await;
        if let Some(live) = &state.live {
            if live.outbound.is_closed() {
                // The pumps saw the host die but the relay task has not
                // swept the slot yet.
                state.live = None;
            } else {
                return Ok(live.generation);
            }
        }

        let mut conn = self.launcher.launch(&self.config).await?;

        match tokio::time::timeout(self.config.ready_timeout, conn.inbound.recv()).await {
            Err(_) => {
                let _ = conn.kill.send(());
                return Err(SupervisorError::ReadyTimeout {
                    timeout_ms: self.config.ready_timeout.as_millis() as u64,
                });
            }
            Ok(None) => {
                let reason = match tokio::time::timeout(EXIT_REPORT_GRACE, conn.exited).await {
                    Ok(Ok(status)) => format!("host exited during startup: {status}"),
                    _ => "host closed its output during startup".to_string(),
                };
                return Err(SupervisorError::StartupFailed { reason });
            }
            Ok(Some(HostEvent::Ready)) => {}
            Ok(Some(other)) => {
                let _ = conn.kill.send(());
                return Err(SupervisorError::StartupFailed {
                    reason: format!("first host event was `{}`, expected `ready`", other.kind()),
                });
            }
        }

        state.generation += 1;
        let generation = state.generation;
        let stopped = Arc::new(AtomicBool::new(false));
        tokio::spawn(relay_signals(
            generation,
            conn.inbound,
            conn.exited,
            self.signal_tx.clone(),
            Arc::clone(&self.state),
            Arc::clone(&stopped),
        ));
        state.live = Some(LiveHost {
            generation,
            outbound: conn.outbound,
            kill: Some(conn.kill),
            stopped,
        });
        info!(generation, "host process ready");
        Ok(generation)
    }

    /// Send a command to the live host.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NotRunning`] with no live host,
    /// [`SupervisorError::ChannelClosed`] when the host dies mid-send.
    pub async fn send(&self, command: HostCommand) -> Result<(), SupervisorError> {
        let outbound = {
            let state = self.state.lock().await;
            let live = state.live.as_ref().ok_or(SupervisorError::NotRunning)?;
            live.outbound.clone()
        };
        outbound
            .send(command)
            .await
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Whether a live host connection exists right now.
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .live
            .as_ref()
            .is_some_and(|live| !live.outbound.is_closed())
    }

    /// Generation of the most recently readied connection; zero before the
    /// first spawn.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Kill the live host (if any) and clear the slot.
    ///
    /// The relay task sees the stop marker and does not emit a crash
    /// signal for a deliberate shutdown.
    pub async fn stop(&self) {
        let live = { self.state.lock().await.live.take() };
        if let Some(mut live) = live {
            live.stopped.store(true, Ordering::SeqCst);
            if let Some(kill) = live.kill.take() {
                let _ = kill.send(());
            }
            info!(generation = live.generation, "host process stopped");
        }
    }
}

/// Host supervision failure.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The host program could not be spawned.
    #[error("failed to spawn host process `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The host did not send `ready` within the configured timeout.
    #[error("host process not ready within {timeout_ms} ms")]
    ReadyTimeout {
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The host came up wrong (early exit, missing pipes, bad handshake).
    #[error("host process failed to start: {reason}")]
    StartupFailed {
        /// What went wrong.
        reason: String,
    },

    /// No live host connection exists.
    #[error("host process is not running")]
    NotRunning,

    /// The host died while a send was in flight.
    #[error("host channel closed")]
    ChannelClosed,
}

/// Per-connection relay: forwards inbound events into the signal stream
/// and converts the connection's end into a crash notification.
async fn relay_signals(
    generation: u64,
    mut inbound: mpsc::Receiver<HostEvent>,
    exited: oneshot::Receiver<String>,
    signal_tx: mpsc::Sender<HostSignal>,
    state: Arc<Mutex<SupervisorState>>,
    stopped: Arc<AtomicBool>,
) {
    while let Some(event) = inbound.recv().await {
        if matches!(event, HostEvent::Ready) {
            // The handshake already happened; a second ready is host
            // misbehavior, not a routable event.
            warn!(generation, "ignoring duplicate ready event");
            continue;
        }
        if signal_tx
            .send(HostSignal::Event { generation, event })
            .await
            .is_err()
        {
            return;
        }
    }

    // Inbound closed: the host's output ended.
    let reason = match exited.await {
        Ok(status) => status,
        Err(_) => "host channel closed".to_string(),
    };

    if stopped.load(Ordering::SeqCst) {
        debug!(generation, reason, "host connection closed after stop");
        return;
    }

    {
        let mut state = state.lock().await;
        if state
            .live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
        {
            state.live = None;
        }
    }
    warn!(generation, reason, "host process exited unexpectedly");
    let _ = signal_tx
        .send(HostSignal::Crashed { generation, reason })
        .await;
}
