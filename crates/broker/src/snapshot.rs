// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic and on-change persistence of the latest stateful payload per
//! message type (§4.6).
//!
//! The in-memory [`SnapshotRecord`] keeps one entry per `type`, in
//! first-observed order, and is guarded by its own lock that is never held
//! across disk I/O (§5: "copy-out, release, then write"). The broker talks
//! to this module only through [`Snapshotter::record`],
//! [`Snapshotter::state_messages`], [`Snapshotter::flush`], and
//! [`Snapshotter::load`] (§3 ownership rule).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// One entry of a [`SnapshotRecord`]: the latest payload observed for
/// `type_`, stored verbatim (§4.6: "payload bytes are verbatim from the
/// last received frame of that type").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(rename = "type")]
    pub type_: String,
    pub payload: serde_json::Value,
}

/// On-disk file shape: `{saved_at: RFC3339Nano, messages:[{type,payload}]}`
/// (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    saved_at: String,
    messages: Vec<StateMessage>,
}

#[derive(Default)]
struct Record {
    /// First-observed order of `type`s seen so far.
    order: Vec<String>,
    /// Latest payload per `type`. `order` and `by_type` are always
    /// consistent in length since every insertion touches both.
    by_type: HashMap<String, serde_json::Value>,
    dirty: bool,
    last_flush_ms: u64,
}

impl Record {
    fn record(&mut self, type_: &str, payload: serde_json::Value) {
        if !self.by_type.contains_key(type_) {
            self.order.push(type_.to_owned());
        }
        self.by_type.insert(type_.to_owned(), payload);
        self.dirty = true;
    }

    fn messages(&self) -> Vec<StateMessage> {
        self.order
            .iter()
            .filter_map(|t| self.by_type.get(t).map(|p| StateMessage { type_: t.clone(), payload: p.clone() }))
            .collect()
    }

    fn replace_from_file(&mut self, messages: Vec<StateMessage>) {
        self.order.clear();
        self.by_type.clear();
        for msg in messages {
            self.order.push(msg.type_.clone());
            self.by_type.insert(msg.type_, msg.payload);
        }
        self.dirty = false;
    }
}

/// Errors surfaced by [`Snapshotter::load`]. A missing file is not an
/// error — it means "nothing to recover", distinct from a corrupted one
/// (§7: "snapshot file corrupted / unreadable for reasons other than
/// not-found").
#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "snapshot io error: {e}"),
            Self::Parse(e) => write!(f, "snapshot parse error: {e}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Periodic and on-change persistence of the latest stateful payload per
/// message type (§4.6).
pub struct Snapshotter {
    path: PathBuf,
    min_interval: Duration,
    record: Mutex<Record>,
}

impl Snapshotter {
    pub fn new(path: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self { path: path.into(), min_interval, record: Mutex::new(Record::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Record> {
        match self.record.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record the latest payload for `type_`, preserving first-observed
    /// order if this is a new type (§3 SnapshotRecord).
    pub fn record(&self, type_: &str, payload: serde_json::Value) {
        self.lock().record(type_, payload);
    }

    /// Deep copy of the ordered record (§4.6: "exposes `StateMessages()`
    /// returning a deep copy").
    pub fn state_messages(&self) -> Vec<StateMessage> {
        self.lock().messages()
    }

    /// Write the ordered record to disk if at least `min_interval` has
    /// elapsed since the last flush and the record has changed since then.
    /// Called from the periodic flush loop; [`Self::flush`] bypasses both
    /// checks for an explicit flush.
    pub async fn flush_if_due(&self, now_ms: u64) {
        let due = {
            let record = self.lock();
            record.dirty && now_ms.saturating_sub(record.last_flush_ms) >= self.min_interval.as_millis() as u64
        };
        if due {
            self.flush(now_ms).await;
        }
    }

    /// Write the ordered record to disk unconditionally (§4.6: "on explicit
    /// `Flush`"). Copies the record out, releases the lock, then performs
    /// the write (§5: "never held across disk I/O"). `now_ms` comes from the
    /// same injectable clock as [`Self::flush_if_due`]'s caller, so tests
    /// that drive a [`crate::clock::TestClock`] see consistent intervals.
    pub async fn flush(&self, now_ms: u64) {
        let messages = {
            let mut record = self.lock();
            record.dirty = false;
            record.messages()
        };
        let file = SnapshotFile { saved_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true), messages };

        match self.write_atomic(&file).await {
            Ok(()) => {
                let mut record = self.lock();
                record.last_flush_ms = now_ms;
            }
            Err(e) => {
                // §7 snapshot write failure: log and retry on the next interval.
                // Mark dirty again so `flush_if_due` tries next time.
                error!(error = %e, path = %self.path.display(), "snapshot flush failed");
                self.lock().dirty = true;
            }
        }
    }

    async fn write_atomic(&self, file: &SnapshotFile) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(file).map_err(std::io::Error::other)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await?;
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot")
        ));
        tokio::fs::write(&tmp_path, &body).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), bytes = body.len(), "snapshot written");
        Ok(())
    }

    /// Load the snapshot file into memory, replacing the current record
    /// (§4.6: "Loads on startup"). A missing file is treated as an empty
    /// snapshot, not an error.
    pub async fn load(&self) -> Result<(), LoadError> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot file, starting empty");
                return Ok(());
            }
            Err(e) => return Err(LoadError::Io(e)),
        };
        let file: SnapshotFile = serde_json::from_slice(&body).map_err(LoadError::Parse)?;
        let count = file.messages.len();
        self.lock().replace_from_file(file.messages);
        debug!(path = %self.path.display(), types = count, "snapshot loaded");
        Ok(())
    }

    /// Flush one final time and stop accepting further writes. The broker
    /// calls this during shutdown; subsequent `record` calls still update
    /// the in-memory record but nothing further is guaranteed to reach
    /// disk after `Close` returns.
    pub async fn close(&self, now_ms: u64) {
        self.flush(now_ms).await;
        warn!(path = %self.path.display(), "snapshotter closed");
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
