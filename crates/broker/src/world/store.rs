// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authoritative vehicle/projectile/event store and per-tick diff
//! extraction (§3 data model, §4.5).
//!
//! All three keyed collections and their pending change sets live behind a
//! single lock (§5: "WorldStore collections → guarded by a dedicated lock;
//! `ConsumeDiff` is the exclusive draining critical section"). `drain_diff`
//! is the only place the update/removed sets are cleared, and it clears
//! them atomically with building the returned [`TickDiff`] so a given
//! mutation is visible in exactly one tick's diff (§8 invariant 5).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// `{position, velocity, orientation, angular_velocity, speed_mps,
/// throttle_pct, vertical_thrust_pct, boost_pct, boost_active,
/// flight_assist_enabled, energy_remaining_pct, updated_at_ms}` keyed by
/// `vehicle_id` (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub vehicle_id: String,
    pub position: serde_json::Value,
    pub velocity: serde_json::Value,
    pub orientation: serde_json::Value,
    pub angular_velocity: serde_json::Value,
    pub speed_mps: f64,
    pub throttle_pct: f64,
    pub vertical_thrust_pct: f64,
    pub boost_pct: f64,
    pub boost_active: bool,
    pub flight_assist_enabled: bool,
    pub energy_remaining_pct: f64,
    pub updated_at_ms: u64,
}

/// Keyed by `id`; `active: false` triggers removal on upsert (§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projectile {
    pub id: String,
    pub active: bool,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

/// Keyed by `event_id`; append-only within a tick window (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub event_id: String,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

/// `{updated[], removed[]}` for one keyed collection within a [`TickDiff`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet<T> {
    pub updated: Vec<T>,
    pub removed: Vec<String>,
}

impl<T> ChangeSet<T> {
    fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// `{tick, vehicles, projectiles, events}` drained from [`WorldStore`] at
/// each tick boundary (§3, §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickDiff {
    pub tick: u64,
    pub vehicles: ChangeSet<VehicleState>,
    pub projectiles: ChangeSet<Projectile>,
    pub events: Vec<GameEvent>,
}

impl TickDiff {
    /// Whether fan-out should happen for this tick (§4.5 step 3: "if diff
    /// is non-empty").
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty() && self.projectiles.is_empty() && self.events.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    vehicles: HashMap<String, VehicleState>,
    projectiles: HashMap<String, Projectile>,
    pending_events: Vec<GameEvent>,
    updated_vehicles: HashSet<String>,
    removed_vehicles: HashSet<String>,
    updated_projectiles: HashSet<String>,
    removed_projectiles: HashSet<String>,
    tick_counter: u64,
    simulated_elapsed_ns: u64,
}

/// The world's live state: three keyed collections plus the pending
/// change-sets that feed [`WorldStore::advance_tick`] (§4.5).
pub struct WorldStore {
    inner: Mutex<Inner>,
}

impl Default for WorldStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Last-writer-wins upsert, storing a defensive clone (§3).
    pub fn upsert_vehicle(&self, vehicle: VehicleState) {
        let mut inner = self.lock();
        let id = vehicle.vehicle_id.clone();
        inner.removed_vehicles.remove(&id);
        inner.vehicles.insert(id.clone(), vehicle);
        inner.updated_vehicles.insert(id);
    }

    /// `active: false` removes instead of storing (§4.4 router rule).
    pub fn upsert_projectile(&self, projectile: Projectile) {
        let mut inner = self.lock();
        let id = projectile.id.clone();
        if projectile.active {
            inner.removed_projectiles.remove(&id);
            inner.projectiles.insert(id.clone(), projectile);
            inner.updated_projectiles.insert(id);
        } else {
            inner.projectiles.remove(&id);
            inner.updated_projectiles.remove(&id);
            inner.removed_projectiles.insert(id);
        }
    }

    /// Explicit projectile removal, independent of the `active` flag path.
    pub fn remove_projectile(&self, id: &str) {
        let mut inner = self.lock();
        inner.projectiles.remove(id);
        inner.updated_projectiles.remove(id);
        inner.removed_projectiles.insert(id.to_owned());
    }

    /// Append an event to the pending queue for the current tick window (§3).
    pub fn append_event(&self, event: GameEvent) {
        self.lock().pending_events.push(event);
    }

    /// Current vehicle count, for stats/health snapshots.
    pub fn vehicle_count(&self) -> usize {
        self.lock().vehicles.len()
    }

    /// Current projectile count, for stats/health snapshots.
    pub fn projectile_count(&self) -> usize {
        self.lock().projectiles.len()
    }

    /// Advance the tick counter by one, add `dt` to the simulated elapsed
    /// time, and atomically drain the pending change sets into a
    /// [`TickDiff`] (§4.5 steps 1–2). Draining clears all pending sets in
    /// the same critical section that reads them, so no change can leak
    /// into the next tick's diff (§8 invariant 5).
    pub fn advance_tick(&self, dt: std::time::Duration) -> TickDiff {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.tick_counter += 1;
        inner.simulated_elapsed_ns += dt.as_nanos() as u64;
        let tick = inner.tick_counter;

        let updated_vehicles: Vec<VehicleState> = inner
            .updated_vehicles
            .drain()
            .filter_map(|id| inner.vehicles.get(&id).cloned())
            .collect();
        let removed_vehicles: Vec<String> = inner.removed_vehicles.drain().collect();

        let updated_projectiles: Vec<Projectile> = inner
            .updated_projectiles
            .drain()
            .filter_map(|id| inner.projectiles.get(&id).cloned())
            .collect();
        let removed_projectiles: Vec<String> = inner.removed_projectiles.drain().collect();

        let events = std::mem::take(&mut inner.pending_events);

        TickDiff {
            tick,
            vehicles: ChangeSet { updated: updated_vehicles, removed: removed_vehicles },
            projectiles: ChangeSet { updated: updated_projectiles, removed: removed_projectiles },
            events,
        }
    }

    /// Current tick counter, without advancing (for stats/health).
    pub fn tick(&self) -> u64 {
        self.lock().tick_counter
    }

    /// Total simulated time elapsed across all ticks, in nanoseconds.
    pub fn simulated_elapsed_ns(&self) -> u64 {
        self.lock().simulated_elapsed_ns
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
