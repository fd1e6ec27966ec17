use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::partition::parse_utc;

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("Cursor transaction already in progress")]
    AlreadyInTransaction,

    #[error("No cursor transaction in progress")]
    NoTransaction,

    #[error("Cannot mark cursor complete with a pending transaction")]
    MarkCompleteWithPending,

    #[error("Cursor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cursor serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable cursor position, serialized as the on-disk JSON file. The
/// `remote_*` fields record what the object store has acknowledged and
/// always trail the locally confirmed fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CursorState {
    pub migration_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronizer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_confirmed_before: Option<String>,
    #[serde(default)]
    pub confirmed_updates: i64,
    #[serde(default)]
    pub confirmed_events: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_confirmed_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_confirmed_updates: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_confirmed_events: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_updates: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_events: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_transaction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
}

/// Identifies one independent cursor file. Shards of a backfill run
/// get their own files and never contend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorKey {
    pub stream: String,
    pub migration_id: i64,
    pub synchronizer_id: String,
    pub shard_index: u32,
    pub shard_total: u32,
}

impl CursorKey {
    pub fn new(stream: &str, migration_id: i64, synchronizer_id: &str) -> Self {
        Self {
            stream: stream.to_string(),
            migration_id,
            synchronizer_id: synchronizer_id.to_string(),
            shard_index: 0,
            shard_total: 1,
        }
    }

    pub fn with_shard(mut self, index: u32, total: u32) -> Self {
        self.shard_index = index;
        self.shard_total = total;
        self
    }

    pub fn file_name(&self) -> String {
        let sync: String = self
            .synchronizer_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!(
            "cursor_{}_m{}_{}_s{}of{}.json",
            self.stream, self.migration_id, sync, self.shard_index, self.shard_total
        )
    }
}

/// Which way the owning stream walks time. Backfill cursors move the
/// confirmed boundary earlier; the live cursor moves it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Backward,
    Forward,
}

#[derive(Debug, Default)]
struct OpenTransaction {
    pending_updates: i64,
    pending_events: i64,
    pending_before: Option<String>,
}

struct Inner {
    state: CursorState,
    txn: Option<OpenTransaction>,
    commits_since_backup: u32,
}

/// Fields overwritten by `save_atomic`. Unset fields are left alone.
#[derive(Debug, Default, Clone)]
pub struct CursorUpdate {
    pub last_confirmed_before: Option<String>,
    pub confirmed_updates: Option<i64>,
    pub confirmed_events: Option<i64>,
    pub min_time: Option<String>,
    pub max_time: Option<String>,
}

/// Returns the earlier of two timestamps, treating unparseable values
/// lexicographically so a bad input cannot silently win.
fn earlier(a: &str, b: &str) -> bool {
    match (parse_utc(a), parse_utc(b)) {
        (Some(x), Some(y)) => x < y,
        _ => a < b,
    }
}

/// Two-phase durable cursor. Local confirmed state advances on
/// `commit`; the remote checkpoint advances only on `confirm_remote`,
/// after the object store has acknowledged the data. Resume uses the
/// remote checkpoint so a crash between the two phases replays instead
/// of gapping.
pub struct Cursor {
    path: PathBuf,
    backup_path: PathBuf,
    inner: Mutex<Inner>,
    backup_every: u32,
    direction: Direction,
}

impl Cursor {
    /// Load a cursor from disk. Falls back to the `.bak` generation on
    /// a corrupt primary and to a zero-valued state when both are
    /// unreadable; the caller decides whether to rebuild from the
    /// object store.
    pub fn load(dir: &Path, key: &CursorKey) -> Result<Self, CursorError> {
        Self::load_with_direction(dir, key, Direction::Backward)
    }

    pub fn load_with_direction(
        dir: &Path,
        key: &CursorKey,
        direction: Direction,
    ) -> Result<Self, CursorError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(key.file_name());
        let backup_path = path.with_extension("json.bak");

        let mut state = Self::read_state(&path)
            .or_else(|| {
                warn!(path = %path.display(), "Primary cursor file unreadable, trying backup");
                Self::read_state(&backup_path)
            })
            .unwrap_or_else(|| {
                debug!(path = %path.display(), "No readable cursor, starting from zero state");
                CursorState {
                    migration_id: key.migration_id,
                    synchronizer_id: Some(key.synchronizer_id.clone()),
                    ..Default::default()
                }
            });

        // A crash mid-transaction leaves the transient fields behind;
        // the pending work was never confirmed, so they are discarded.
        state.pending_updates = None;
        state.pending_events = None;
        state.in_transaction = None;

        Ok(Self {
            path,
            backup_path,
            inner: Mutex::new(Inner {
                state,
                txn: None,
                commits_since_backup: 0,
            }),
            backup_every: 5,
            direction,
        })
    }

    fn read_state(path: &Path) -> Option<CursorState> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cursor file corrupt");
                None
            }
        }
    }

    fn persist(&self, inner: &mut Inner) -> Result<(), CursorError> {
        let json = serde_json::to_vec_pretty(&inner.state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;

        inner.commits_since_backup += 1;
        if inner.commits_since_backup >= self.backup_every {
            std::fs::write(&self.backup_path, &json)?;
            inner.commits_since_backup = 0;
        }
        Ok(())
    }

    pub async fn begin_transaction(
        &self,
        pending_updates: i64,
        pending_events: i64,
        earliest_time: Option<String>,
    ) -> Result<(), CursorError> {
        let mut inner = self.inner.lock().await;
        if inner.txn.is_some() {
            return Err(CursorError::AlreadyInTransaction);
        }
        inner.txn = Some(OpenTransaction {
            pending_updates,
            pending_events,
            pending_before: earliest_time,
        });
        inner.state.in_transaction = Some(true);
        inner.state.pending_updates = Some(pending_updates);
        inner.state.pending_events = Some(pending_events);
        Ok(())
    }

    /// Accumulate into the open transaction, auto-beginning one when
    /// none is open. The pending boundary only moves in the stream's
    /// direction: earlier for backfill, later for live.
    pub async fn add_pending(
        &self,
        delta_updates: i64,
        delta_events: i64,
        time: Option<&str>,
    ) {
        let mut inner = self.inner.lock().await;
        let txn = inner.txn.get_or_insert_with(OpenTransaction::default);
        txn.pending_updates += delta_updates;
        txn.pending_events += delta_events;
        if let Some(t) = time {
            let advances = match (&txn.pending_before, self.direction) {
                (None, _) => true,
                (Some(current), Direction::Backward) => earlier(t, current),
                (Some(current), Direction::Forward) => earlier(current, t),
            };
            if advances {
                txn.pending_before = Some(t.to_string());
            }
        }
        let (pu, pe) = (txn.pending_updates, txn.pending_events);
        inner.state.in_transaction = Some(true);
        inner.state.pending_updates = Some(pu);
        inner.state.pending_events = Some(pe);
    }

    /// Fold pending into confirmed and write durably.
    pub async fn commit(&self) -> Result<CursorState, CursorError> {
        let mut inner = self.inner.lock().await;
        let txn = inner.txn.take().ok_or(CursorError::NoTransaction)?;
        inner.state.confirmed_updates += txn.pending_updates;
        inner.state.confirmed_events += txn.pending_events;
        if let Some(before) = txn.pending_before {
            inner.state.last_confirmed_before = Some(before);
        }
        inner.state.pending_updates = None;
        inner.state.pending_events = None;
        inner.state.in_transaction = None;
        self.persist(&mut inner)?;
        Ok(inner.state.clone())
    }

    /// Discard pending state. No-op when no transaction is open.
    pub async fn rollback(&self) {
        let mut inner = self.inner.lock().await;
        inner.txn = None;
        inner.state.pending_updates = None;
        inner.state.pending_events = None;
        inner.state.in_transaction = None;
    }

    /// Commit any open transaction, then overwrite the supplied fields
    /// atomically.
    pub async fn save_atomic(&self, update: CursorUpdate) -> Result<(), CursorError> {
        let mut inner = self.inner.lock().await;
        if let Some(txn) = inner.txn.take() {
            inner.state.confirmed_updates += txn.pending_updates;
            inner.state.confirmed_events += txn.pending_events;
            if let Some(before) = txn.pending_before {
                inner.state.last_confirmed_before = Some(before);
            }
            inner.state.pending_updates = None;
            inner.state.pending_events = None;
            inner.state.in_transaction = None;
        }
        if let Some(v) = update.last_confirmed_before {
            inner.state.last_confirmed_before = Some(v);
        }
        if let Some(v) = update.confirmed_updates {
            inner.state.confirmed_updates = v;
        }
        if let Some(v) = update.confirmed_events {
            inner.state.confirmed_events = v;
        }
        if let Some(v) = update.min_time {
            inner.state.min_time = Some(v);
        }
        if let Some(v) = update.max_time {
            inner.state.max_time = Some(v);
        }
        self.persist(&mut inner)
    }

    /// Record the object store's acknowledgement. With no arguments the
    /// remote checkpoint is synchronized to the local confirmed state.
    pub async fn confirm_remote(
        &self,
        time: Option<String>,
        updates: Option<i64>,
        events: Option<i64>,
    ) -> Result<(), CursorError> {
        let mut inner = self.inner.lock().await;
        inner.state.remote_confirmed_before = time.or_else(|| inner.state.last_confirmed_before.clone());
        inner.state.remote_confirmed_updates = updates.or(Some(inner.state.confirmed_updates));
        inner.state.remote_confirmed_events = events.or(Some(inner.state.confirmed_events));
        self.persist(&mut inner)
    }

    /// Crash-safe resume position. `use_local` trades possible replay
    /// for starting from the newer local confirmation.
    pub async fn resume_position(&self, use_local: bool) -> Option<String> {
        let inner = self.inner.lock().await;
        if use_local {
            inner.state.last_confirmed_before.clone()
        } else {
            inner.state.remote_confirmed_before.clone()
        }
    }

    pub async fn mark_complete(&self) -> Result<(), CursorError> {
        let mut inner = self.inner.lock().await;
        if inner.txn.is_some() {
            return Err(CursorError::MarkCompleteWithPending);
        }
        inner.state.complete = Some(true);
        self.persist(&mut inner)
    }

    pub async fn state(&self) -> CursorState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_complete(&self) -> bool {
        self.inner.lock().await.state.complete.unwrap_or(false)
    }
}
