// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observer → relevance tier registry (§2 TierManager).
//!
//! Tracks which clients are observing the world (`observer_state`) and
//! ingests the radar/entity/world snapshot frames those observers publish.
//! The relevance tier itself is whatever the observer's own `observer_state`
//! payload declares (a `tier` field) — this registry's job is bookkeeping
//! (who's watching, what they last reported, how many frames of each kind
//! have come through) rather than computing relevance from scratch, since
//! §4.4 only specifies that these message types route here, not a tiering
//! algorithm.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Snapshot of one registered observer, keyed by `observer_id` (the
/// client's connection ID).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverState {
    pub observer_id: String,
    /// Relevance tier self-reported by the observer's `observer_state`
    /// payload, if any (e.g. `"near"`, `"far"`, `"spectator"`).
    #[serde(default)]
    pub tier: Option<String>,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Ingest counters for the non-consumed stateful types (§4.4: `radar_frame`,
/// `entity_snapshot`, `world_snapshot`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestCounters {
    pub radar_frames: u64,
    pub entity_snapshots: u64,
    pub world_snapshots: u64,
}

/// The kind of frame ingested by [`TierManager::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Radar,
    EntitySnapshot,
    WorldSnapshot,
}

#[derive(Default)]
struct Inner {
    observers: HashMap<String, ObserverState>,
    counters: IngestCounters,
}

/// Registry of connected observers and the relevance-affecting frames they
/// publish (§2, §4.4).
pub struct TierManager {
    inner: Mutex<Inner>,
}

impl Default for TierManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TierManager {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register or refresh an observer's declared state (§4.4:
    /// `observer_state` → `UpdateObserver`, consumed).
    pub fn update_observer(&self, observer_id: &str, tier: Option<String>, updated_at_ms: u64, payload: serde_json::Value) {
        let mut inner = self.lock();
        inner.observers.insert(
            observer_id.to_owned(),
            ObserverState { observer_id: observer_id.to_owned(), tier, updated_at_ms, payload },
        );
    }

    /// Drop an observer's registration (§4.1 teardown:
    /// `TierManager.RemoveObserver(clientID)`).
    pub fn remove_observer(&self, observer_id: &str) {
        self.lock().observers.remove(observer_id);
    }

    /// Record that a radar/entity/world snapshot frame was received, for
    /// stats/health reporting. These types are not consumed by the router
    /// (§4.4) — the broker still re-broadcasts them after this call.
    pub fn ingest(&self, kind: FrameKind) {
        let mut inner = self.lock();
        match kind {
            FrameKind::Radar => inner.counters.radar_frames += 1,
            FrameKind::EntitySnapshot => inner.counters.entity_snapshots += 1,
            FrameKind::WorldSnapshot => inner.counters.world_snapshots += 1,
        }
    }

    /// This observer's declared tier, if registered and reporting one.
    pub fn tier_of(&self, observer_id: &str) -> Option<String> {
        self.lock().observers.get(observer_id).and_then(|o| o.tier.clone())
    }

    /// Number of currently registered observers (for health/stats).
    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Snapshot of ingest counters (for health/stats).
    pub fn counters(&self) -> IngestCounters {
        self.lock().counters.clone()
    }
}

#[cfg(test)]
#[path = "tier_tests.rs"]
mod tests;
