//! Worker identity, lifecycle state, and records.
//!
//! A worker is one sandboxed script instance living inside the host process.
//! The orchestrator tracks each worker with a [`WorkerRecord`] whose state
//! machine only moves forward:
//!
//! ```text
//!   building ──► ready ──► error
//!       │                    ▲
//!       └────────────────────┘
//! ```
//!
//! `error` is terminal and `ready` never returns to `building`. A record
//! exists exactly as long as the host process holds (or has been asked to
//! create) the sandbox; it is removed only once termination is confirmed or
//! the host process is known to be dead.
//!
//! # Identifiers
//!
//! Worker ids double as filesystem path components (see
//! [`crate::scoped_fs`]), so [`WorkerId`] validates the charset instead of
//! accepting arbitrary strings. Callers may supply an id hint; otherwise a
//! UUID is generated.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Limits
// =============================================================================

/// Maximum length of a worker id in bytes.
pub const MAX_WORKER_ID_LEN: usize = 64;

/// Maximum number of environment variables per worker.
pub const MAX_ENV_VARS: usize = 64;

/// Maximum length of an environment variable name in bytes.
pub const MAX_ENV_NAME_LEN: usize = 128;

/// Maximum length of an environment variable value in bytes.
pub const MAX_ENV_VALUE_LEN: usize = 4096;

/// Maximum length of a source ref in bytes.
pub const MAX_SOURCE_REF_LEN: usize = 512;

// =============================================================================
// WorkerId
// =============================================================================

/// Validated worker identifier.
///
/// Accepts `[A-Za-z0-9._-]`, 1 to [`MAX_WORKER_ID_LEN`] bytes, not starting
/// with `.`. The charset is restricted because ids are embedded in scoped
/// filesystem roots and wire envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Parse and validate a caller-supplied id (or id hint).
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerIdError`] describing the first violation found.
    pub fn parse(raw: &str) -> Result<Self, WorkerIdError> {
        if raw.is_empty() {
            return Err(WorkerIdError::Empty);
        }
        if raw.len() > MAX_WORKER_ID_LEN {
            return Err(WorkerIdError::TooLong {
                len: raw.len(),
                max: MAX_WORKER_ID_LEN,
            });
        }
        if raw.starts_with('.') {
            return Err(WorkerIdError::LeadingDot);
        }
        if let Some(ch) = raw
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
        {
            return Err(WorkerIdError::InvalidChar { ch });
        }
        Ok(Self(raw.to_string()))
    }

    /// Generate a fresh random id (UUID v4, hyphenated).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for WorkerId {
    type Err = WorkerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkerId {
    type Error = WorkerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

/// Validation failure for a worker id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerIdError {
    /// The id is the empty string.
    #[error("worker id is empty")]
    Empty,

    /// The id exceeds the maximum length.
    #[error("worker id is {len} bytes, maximum is {max}")]
    TooLong {
        /// Actual length in bytes.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// The id begins with `.`, which is reserved for hidden paths.
    #[error("worker id must not begin with `.`")]
    LeadingDot,

    /// The id contains a character outside `[A-Za-z0-9._-]`.
    #[error("worker id contains invalid character `{ch}`")]
    InvalidChar {
        /// The offending character.
        ch: char,
    },
}

// =============================================================================
// WorkerState
// =============================================================================

/// Lifecycle state of a worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created locally; the sandbox is not confirmed running yet.
    Building,
    /// The host process confirmed the sandbox is up.
    Ready,
    /// Terminal failure state; `last_error` explains why.
    Error,
}

impl WorkerState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// The state machine is forward-only: `building → ready`,
    /// `building → error`, and `ready → error` are the only legal moves.
    #[must_use]
    pub const fn may_become(self, next: WorkerState) -> bool {
        matches!(
            (self, next),
            (WorkerState::Building, WorkerState::Ready)
                | (WorkerState::Building, WorkerState::Error)
                | (WorkerState::Ready, WorkerState::Error)
        )
    }

    /// Lowercase name as it appears in snapshots and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerState::Building => "building",
            WorkerState::Ready => "ready",
            WorkerState::Error => "error",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// WorkerOptions
// =============================================================================

/// Sandbox options fixed at worker creation.
///
/// Options are immutable once the record exists; they are forwarded verbatim
/// inside the `worker:create` envelope.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Memory ceiling for the sandbox in megabytes. `None` leaves the host
    /// default in place.
    #[serde(rename = "memoryLimitMB", default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u32>,

    /// Environment variables exposed inside the sandbox.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl WorkerOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory ceiling in megabytes.
    #[must_use]
    pub fn with_memory_limit_mb(mut self, limit: u32) -> Self {
        self.memory_limit_mb = Some(limit);
        self
    }

    /// Add one environment variable.
    #[must_use]
    pub fn with_env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Validate the option bounds.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerOptionsError`] for an oversized env map, an invalid
    /// variable name, or an oversized value.
    pub fn validate(&self) -> Result<(), WorkerOptionsError> {
        if self.env.len() > MAX_ENV_VARS {
            return Err(WorkerOptionsError::TooManyEnvVars {
                count: self.env.len(),
                max: MAX_ENV_VARS,
            });
        }
        for (name, value) in &self.env {
            let name_ok = !name.is_empty()
                && name.len() <= MAX_ENV_NAME_LEN
                && !name.chars().any(|c| c == '=' || c.is_ascii_control());
            if !name_ok {
                return Err(WorkerOptionsError::InvalidEnvName { name: name.clone() });
            }
            if value.len() > MAX_ENV_VALUE_LEN {
                return Err(WorkerOptionsError::EnvValueTooLong {
                    name: name.clone(),
                    max: MAX_ENV_VALUE_LEN,
                });
            }
            if value.contains('\0') {
                return Err(WorkerOptionsError::InvalidEnvValue { name: name.clone() });
            }
        }
        Ok(())
    }
}

// Env values may carry tokens; keep them out of debug output.
impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: BTreeMap<&str, &str> = self
            .env
            .keys()
            .map(|name| (name.as_str(), "<redacted>"))
            .collect();
        f.debug_struct("WorkerOptions")
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("env", &env)
            .finish()
    }
}

/// Validation failure for worker options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerOptionsError {
    /// The env map holds more than [`MAX_ENV_VARS`] entries.
    #[error("too many environment variables: {count} exceeds maximum {max}")]
    TooManyEnvVars {
        /// Number of variables supplied.
        count: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// An env var name is empty, oversized, or contains `=` or control
    /// characters.
    #[error("environment variable name `{name}` is invalid")]
    InvalidEnvName {
        /// The offending name.
        name: String,
    },

    /// An env var value exceeds [`MAX_ENV_VALUE_LEN`].
    #[error("environment variable `{name}` value exceeds {max} bytes")]
    EnvValueTooLong {
        /// The variable whose value is oversized.
        name: String,
        /// Permitted maximum.
        max: usize,
    },

    /// An env var value contains a null byte.
    #[error("environment variable `{name}` value contains a null byte")]
    InvalidEnvValue {
        /// The offending variable.
        name: String,
    },
}

// =============================================================================
// WorkerSpec
// =============================================================================

/// Creation request for a worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Preferred worker id; validated before use. `None` generates a UUID.
    pub id_hint: Option<String>,
    /// Owning entity (typically a panel id), used for bulk cleanup when the
    /// owner goes away.
    pub parent_id: Option<String>,
    /// Opaque provenance of the code bundle that will be sent.
    pub source_ref: String,
    /// Immutable sandbox options.
    pub options: WorkerOptions,
}

impl WorkerSpec {
    /// New spec with the given source ref and default options.
    #[must_use]
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            id_hint: None,
            parent_id: None,
            source_ref: source_ref.into(),
            options: WorkerOptions::default(),
        }
    }

    /// Request a specific worker id.
    #[must_use]
    pub fn with_id_hint(mut self, id_hint: impl Into<String>) -> Self {
        self.id_hint = Some(id_hint.into());
        self
    }

    /// Attach an owning parent id.
    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Replace the sandbox options.
    #[must_use]
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }
}

// =============================================================================
// WorkerRecord
// =============================================================================

/// Book-keeping record for one worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Worker id, unique among live records.
    pub id: WorkerId,
    /// Owning entity, if any.
    pub parent_id: Option<String>,
    /// Opaque provenance of the worker's code bundle.
    pub source_ref: String,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Immutable sandbox options.
    pub options: WorkerOptions,
    /// Monotonic creation instant, used for ordering.
    pub created_at: Instant,
    /// Wall-clock creation time, used for snapshots.
    pub created_at_utc: DateTime<Utc>,
    /// Most recent failure reason; retained until the record is removed.
    pub last_error: Option<String>,
}

impl WorkerRecord {
    /// New record in `building` state.
    #[must_use]
    pub fn new(id: WorkerId, spec: &WorkerSpec) -> Self {
        Self {
            id,
            parent_id: spec.parent_id.clone(),
            source_ref: spec.source_ref.clone(),
            state: WorkerState::Building,
            options: spec.options.clone(),
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            last_error: None,
        }
    }

    /// Apply the `building → ready` transition.
    ///
    /// Returns `false` (and leaves the record untouched) when the current
    /// state does not permit it.
    pub fn mark_ready(&mut self) -> bool {
        if self.state.may_become(WorkerState::Ready) {
            self.state = WorkerState::Ready;
            true
        } else {
            false
        }
    }

    /// Record a failure reason without forcing a state change.
    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
    }

    /// Record a failure reason and move to `error` if the lifecycle allows.
    ///
    /// Returns whether the state actually changed; the reason is retained
    /// either way.
    pub fn mark_error(&mut self, reason: impl Into<String>) -> bool {
        self.record_error(reason);
        if self.state.may_become(WorkerState::Error) {
            self.state = WorkerState::Error;
            true
        } else {
            false
        }
    }

    /// Point-in-time copy for inspection APIs.
    #[must_use]
    pub fn snapshot(&self, fs_root: Option<PathBuf>) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.as_str().to_string(),
            parent_id: self.parent_id.clone(),
            source_ref: self.source_ref.clone(),
            state: self.state,
            memory_limit_mb: self.options.memory_limit_mb,
            created_at: self.created_at_utc,
            last_error: self.last_error.clone(),
            fs_root,
        }
    }
}

/// Serializable point-in-time view of a worker record.
///
/// Env values are deliberately omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    /// Worker id.
    pub id: String,
    /// Owning entity, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Opaque provenance of the worker's code bundle.
    pub source_ref: String,
    /// Lifecycle state at snapshot time.
    pub state: WorkerState,
    /// Memory ceiling in megabytes, if set.
    #[serde(rename = "memoryLimitMB", skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u32>,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Most recent failure reason, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Scoped filesystem root, when provisioning succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_root: Option<PathBuf>,
}
