//! In-memory worker registry.
//!
//! One entry per worker record, keyed by worker id. The registry is the
//! single source of truth for which ids are live: an id can be reused only
//! after its entry has been removed (termination confirmation or
//! host-known-dead cleanup).
//!
//! Lifecycle state changes are published through a per-entry watch channel
//! so `WorkerHandle::wait_ready` can await them without polling. Dropping
//! the entry drops the sender, which wakes any waiter with a closed-channel
//! result.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;
use warren_core::scoped_fs::ScopedFs;
use warren_core::worker::{WorkerId, WorkerOptions, WorkerRecord, WorkerSnapshot, WorkerState};

/// One registered worker.
struct WorkerEntry {
    record: WorkerRecord,
    /// Scoped filesystem; `None` when provisioning failed and the record
    /// sits in `Error` without ever having had a root.
    fs: Option<ScopedFs>,
    /// Host generation the `worker:create` was (or will be) sent on.
    host_generation: u64,
    state_tx: watch::Sender<WorkerState>,
}

/// Registry of live worker records.
pub struct WorkerRegistry {
    entries: Mutex<HashMap<String, WorkerEntry>>,
}

impl WorkerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a new record.
    ///
    /// Returns the state watch receiver for the entry.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateWorkerId`] while any record (in any state)
    /// still holds the id.
    pub fn insert(
        &self,
        record: WorkerRecord,
        fs: Option<ScopedFs>,
        host_generation: u64,
    ) -> Result<watch::Receiver<WorkerState>, RegistryError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let key = record.id.as_str().to_string();
        if entries.contains_key(&key) {
            return Err(RegistryError::DuplicateWorkerId { id: key });
        }
        let (state_tx, state_rx) = watch::channel(record.state);
        entries.insert(
            key,
            WorkerEntry {
                record,
                fs,
                host_generation,
                state_tx,
            },
        );
        Ok(state_rx)
    }

    /// Remove a record, returning it with its filesystem handle.
    pub fn remove(&self, id: &str) -> Option<(WorkerRecord, Option<ScopedFs>)> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.remove(id).map(|entry| (entry.record, entry.fs))
    }

    /// Whether a record holds the id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .lock()
            .expect("lock poisoned")
            .contains_key(id)
    }

    /// Current lifecycle state of a record.
    #[must_use]
    pub fn state_of(&self, id: &str) -> Option<WorkerState> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(id)
            .map(|entry| entry.record.state)
    }

    /// Immutable options captured at creation.
    #[must_use]
    pub fn options_of(&self, id: &str) -> Option<WorkerOptions> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(id)
            .map(|entry| entry.record.options.clone())
    }

    /// Scoped filesystem handle of a record, if it has one.
    #[must_use]
    pub fn fs_of(&self, id: &str) -> Option<ScopedFs> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(id)
            .and_then(|entry| entry.fs.clone())
    }

    /// Watch receiver for a record's lifecycle state.
    #[must_use]
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<WorkerState>> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(id)
            .map(|entry| entry.state_tx.subscribe())
    }

    /// Move a record `Building -> Ready`.
    ///
    /// Returns `false` (no state change, no notification) when the id is
    /// unknown or the transition is not legal from the current state.
    pub fn mark_ready(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.record.mark_ready() {
            let _ = entry.state_tx.send(entry.record.state);
            true
        } else {
            false
        }
    }

    /// Move a record to `Error` with the given reason.
    ///
    /// The reason is retained as `last_error` even when the record is
    /// already terminal. Returns `false` when the id is unknown.
    pub fn mark_error(&self, id: &str, reason: &str) -> bool {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.record.mark_error(reason) {
            let _ = entry.state_tx.send(entry.record.state);
        } else {
            entry.record.record_error(reason);
        }
        true
    }

    /// Update `last_error` without a state transition.
    ///
    /// Returns `false` when the id is unknown.
    pub fn record_error(&self, id: &str, reason: &str) -> bool {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        entry.record.record_error(reason);
        true
    }

    /// Snapshot one record.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<WorkerSnapshot> {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.get(id).map(entry_snapshot)
    }

    /// Snapshot every record, ordered by creation instant.
    #[must_use]
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let entries = self.entries.lock().expect("lock poisoned");
        let mut ordered: Vec<&WorkerEntry> = entries.values().collect();
        ordered.sort_by_key(|entry| entry.record.created_at);
        ordered.into_iter().map(entry_snapshot).collect()
    }

    /// Ids of every record.
    #[must_use]
    pub fn ids(&self) -> Vec<WorkerId> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .values()
            .map(|entry| entry.record.id.clone())
            .collect()
    }

    /// Ids of every record owned by `parent_id`.
    #[must_use]
    pub fn ids_of_parent(&self, parent_id: &str) -> Vec<WorkerId> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|entry| entry.record.parent_id.as_deref() == Some(parent_id))
            .map(|entry| entry.record.id.clone())
            .collect()
    }

    /// Ids of every record whose `worker:create` rode a host generation at
    /// or below `generation`. Used by crash cleanup so a worker racing onto
    /// a fresh host is not swept with the dead one.
    #[must_use]
    pub fn ids_up_to_generation(&self, generation: u64) -> Vec<WorkerId> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|entry| entry.host_generation <= generation)
            .map(|entry| entry.record.id.clone())
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("lock poisoned").is_empty()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().expect("lock poisoned");
        f.debug_struct("WorkerRegistry")
            .field("len", &entries.len())
            .finish()
    }
}

fn entry_snapshot(entry: &WorkerEntry) -> WorkerSnapshot {
    entry
        .record
        .snapshot(entry.fs.as_ref().map(|fs| fs.root().to_path_buf()))
}

/// Registry failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A record already holds the id.
    #[error("worker id `{id}` is already in use")]
    DuplicateWorkerId {
        /// The contested id.
        id: String,
    },
}
