// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Live world state: the authoritative vehicle/projectile/event store and
//! its per-tick diff extraction (§4.5), plus the two per-client regulators
//! that gate outbound fan-out — bandwidth (§4.5) and relevance tiering
//! (§4.4's `observer_state`/`radar_frame`/`entity_snapshot`/`world_snapshot`
//! handling).

pub mod bandwidth;
pub mod store;
pub mod tier;

pub use bandwidth::BandwidthRegulator;
pub use store::{ChangeSet, GameEvent, Projectile, TickDiff, VehicleState, WorldStore};
pub use tier::{FrameKind, ObserverState, TierManager};
