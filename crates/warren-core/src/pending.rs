//! Correlated-request bookkeeping.
//!
//! One table abstraction serves every "send now, resolve later" exchange on
//! the host channel: service invokes (keyed by generated correlation id)
//! and worker terminations (keyed by worker id, at most one per worker).
//!
//! # Timers
//!
//! The table itself is timer-free. A caller that wants a deadline wraps
//! [`PendingTicket::wait`] in `tokio::time::timeout`; cancelling the wait
//! drops the ticket, and dropping a ticket removes its entry. A completion
//! that arrives afterwards finds no entry and is silently ignored — that
//! one mechanism provides both the timeout and the late-response no-op
//! guarantee.
//!
//! # Backstops
//!
//! [`PendingTable::drain`] fails every outstanding waiter at once; the
//! host-exit and shutdown paths use it so callers never hang on a channel
//! that can no longer deliver a response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::trace;

/// Maximum number of outstanding entries per table.
pub const MAX_PENDING: usize = 4096;

type Waiter<T> = tokio::sync::oneshot::Sender<Result<T, PendingError>>;

struct Entry<T> {
    /// Distinguishes re-registrations of the same key so a stale ticket
    /// drop cannot remove its successor's entry.
    token: u64,
    tx: Waiter<T>,
}

struct TableState<T> {
    entries: HashMap<String, Entry<T>>,
    next_token: u64,
}

/// Bounded map of correlation key → single-use waiter.
pub struct PendingTable<T> {
    name: &'static str,
    state: Arc<Mutex<TableState<T>>>,
}

impl<T> PendingTable<T> {
    /// New empty table. `name` appears in logs and error messages.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(TableState {
                entries: HashMap::new(),
                next_token: 1,
            })),
        }
    }

    /// Insert a waiter for `key`.
    ///
    /// # Errors
    ///
    /// [`PendingError::AlreadyPending`] when a waiter for `key` exists,
    /// [`PendingError::TableFull`] at [`MAX_PENDING`] entries.
    pub fn register(&self, key: impl Into<String>) -> Result<PendingTicket<T>, PendingError> {
        let key = key.into();
        let mut state = self.state.lock().expect("lock poisoned");
        if state.entries.len() >= MAX_PENDING {
            return Err(PendingError::TableFull {
                table: self.name,
                max: MAX_PENDING,
            });
        }
        if state.entries.contains_key(&key) {
            return Err(PendingError::AlreadyPending { key });
        }
        let token = state.next_token;
        state.next_token = state.next_token.wrapping_add(1);
        let (tx, rx) = tokio::sync::oneshot::channel();
        state.entries.insert(key.clone(), Entry { token, tx });
        Ok(PendingTicket {
            key,
            token,
            rx: Some(rx),
            state: Arc::clone(&self.state),
            name: self.name,
        })
    }

    /// Resolve and remove the waiter for `key`.
    ///
    /// Returns `false` when no waiter exists — late completions (the waiter
    /// timed out and dropped its ticket) and completions for keys that were
    /// never registered land here and are dropped by design.
    pub fn complete(&self, key: &str, outcome: Result<T, PendingError>) -> bool {
        let entry = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.entries.remove(key)
        };
        match entry {
            Some(entry) => {
                // The waiter may have been dropped between the map removal
                // and this send; that is the same late-completion no-op.
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                trace!(table = self.name, key, "ignoring completion with no pending entry");
                false
            }
        }
    }

    /// Fail every outstanding waiter with `reason` and empty the table.
    ///
    /// Returns how many waiters were failed.
    pub fn drain(&self, reason: &str) -> usize {
        let drained: Vec<Entry<T>> = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(PendingError::Rejected {
                reason: reason.to_string(),
            }));
        }
        if count > 0 {
            trace!(table = self.name, count, reason, "drained pending entries");
        }
        count
    }

    /// Keys with an outstanding waiter.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock().expect("lock poisoned");
        state.entries.keys().cloned().collect()
    }

    /// Whether `key` has an outstanding waiter.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.entries.contains_key(key)
    }

    /// Number of outstanding waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for PendingTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Waiter half of one pending entry.
///
/// Dropping the ticket (explicitly, or by cancelling a timed-out
/// [`wait`](Self::wait)) deregisters the entry.
pub struct PendingTicket<T> {
    key: String,
    token: u64,
    rx: Option<tokio::sync::oneshot::Receiver<Result<T, PendingError>>>,
    state: Arc<Mutex<TableState<T>>>,
    name: &'static str,
}

impl<T> PendingTicket<T> {
    /// The correlation key this ticket waits on.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the completion.
    ///
    /// # Errors
    ///
    /// Whatever [`PendingError`] the completing side supplied, or
    /// [`PendingError::ChannelClosed`] if the entry vanished without a
    /// completion.
    pub async fn wait(mut self) -> Result<T, PendingError> {
        let Some(rx) = self.rx.take() else {
            return Err(PendingError::ChannelClosed);
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PendingError::ChannelClosed),
        }
    }
}

impl<T> Drop for PendingTicket<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("lock poisoned");
        let stale = state
            .entries
            .get(&self.key)
            .is_some_and(|entry| entry.token == self.token);
        if stale {
            state.entries.remove(&self.key);
            trace!(table = self.name, key = %self.key, "pending entry abandoned");
        }
    }
}

impl<T> std::fmt::Debug for PendingTicket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTicket")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

/// Failure of a pending exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    /// A waiter for the key already exists.
    #[error("a pending request already exists for `{key}`")]
    AlreadyPending {
        /// The contested key.
        key: String,
    },

    /// The table is at capacity.
    #[error("pending table `{table}` is full ({max} entries)")]
    TableFull {
        /// Table name.
        table: &'static str,
        /// Permitted maximum.
        max: usize,
    },

    /// The caller-side deadline elapsed.
    #[error("request timed out after {timeout_ms}ms")]
    TimedOut {
        /// The configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The entry vanished without a completion.
    #[error("channel closed before a response arrived")]
    ChannelClosed,

    /// The completing side reported a failure.
    #[error("{reason}")]
    Rejected {
        /// Failure description.
        reason: String,
    },
}

impl PendingError {
    /// Rejection with the given reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        PendingError::Rejected {
            reason: reason.into(),
        }
    }
}
