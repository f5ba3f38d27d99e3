// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The broker: owns the client roster, the world store, the intent
//! pipeline, and the tick loop. Transport handlers (`transport::ws`,
//! `transport::grpc`) drive it; it never touches a socket directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{OriginChecker, TokenVerifier};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::ErrorCode;
use crate::intent::{Controls, Frame, IntentGate, IntentValidator, ValidationReason};
use crate::snapshot::Snapshotter;
use crate::world::{BandwidthRegulator, FrameKind, GameEvent, Projectile, TierManager, VehicleState, WorldStore};

/// Outbound item queued for a client's writer task.
#[derive(Debug, Clone)]
pub enum OutboundItem {
    Text(String),
    Close(u16, String),
}

/// A registered connection. Transport code owns the socket; the broker
/// only holds what it needs to route traffic and tear the client down.
pub struct ClientHandle {
    pub id: String,
    tx: mpsc::Sender<OutboundItem>,
    pub cancel: CancellationToken,
    controllers: Mutex<HashSet<String>>,
}

impl ClientHandle {
    fn track_controller(&self, controller_id: &str) {
        if let Ok(mut set) = self.controllers.lock() {
            set.insert(controller_id.to_owned());
        }
    }
}

#[derive(Default)]
struct Roster {
    clients: HashMap<String, Arc<ClientHandle>>,
    connected: usize,
    pending: usize,
}

/// Stored intent, keyed by controller id, as last accepted by the gate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IntentRecord {
    pub controller_id: String,
    pub sequence_id: u64,
    pub throttle: f64,
    pub brake: f64,
    pub steer: f64,
    #[serde(default)]
    pub handbrake: bool,
    pub gear: i32,
    #[serde(default)]
    pub boost: bool,
    #[serde(default)]
    pub sent_at_ms: Option<u64>,
}

/// Per-key violation bookkeeping, exposed for stats/tests.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ViolationCounters {
    pub by_reason: HashMap<&'static str, u64>,
    pub cooldowns: u64,
    pub disconnects: u64,
}

/// Outcome of routing one `intent` envelope through the validator/gate
/// pipeline, shared between the WebSocket and gRPC entry points.
#[derive(Debug, Clone, Default)]
pub struct IntentOutcome {
    pub accepted: bool,
    pub disconnect: bool,
    pub error: Option<String>,
}

/// One tick's worth of state change, ready to publish to gRPC subscribers.
#[derive(Debug, Clone)]
pub struct DiffEventMsg {
    pub tick: u64,
    pub payload: Vec<u8>,
}

pub enum AdmitError {
    Recovering,
    Capacity,
}

pub struct Broker {
    config: Arc<Config>,
    clock: SharedClock,
    origin: OriginChecker,
    token: Option<TokenVerifier>,
    world: WorldStore,
    validator: IntentValidator,
    gate: IntentGate,
    bandwidth: BandwidthRegulator,
    tier: TierManager,
    snapshot: Arc<Snapshotter>,
    roster: RwLock<Roster>,
    intents: RwLock<HashMap<String, IntentRecord>>,
    violations: Mutex<HashMap<String, ViolationCounters>>,
    grpc_subs: Mutex<HashMap<u64, mpsc::Sender<DiffEventMsg>>>,
    next_sub_id: AtomicU64,
    next_anon_id: AtomicU64,
    recovering: std::sync::atomic::AtomicBool,
    startup_err: RwLock<Option<String>>,
}

impl Broker {
    pub fn new(config: Arc<Config>, clock: SharedClock, snapshot: Arc<Snapshotter>) -> Self {
        let origin = OriginChecker::new(&config.allowed_origins);
        let token = config
            .hmac_secret
            .as_ref()
            .map(|secret| TokenVerifier::new(secret.as_bytes().to_vec()));
        let bandwidth = BandwidthRegulator::new(
            config.bandwidth_budget_bytes,
            config.bandwidth_refill_bps,
            Arc::clone(&clock),
        );
        let validator = IntentValidator::new(config.validator_limits(), Arc::clone(&clock));
        let gate = IntentGate::new(config.intent_min_interval(), config.intent_max_age(), Arc::clone(&clock));

        Self {
            config,
            clock,
            origin,
            token,
            world: WorldStore::new(),
            validator,
            gate,
            bandwidth,
            tier: TierManager::new(),
            snapshot,
            roster: RwLock::new(Roster::default()),
            intents: RwLock::new(HashMap::new()),
            violations: Mutex::new(HashMap::new()),
            grpc_subs: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            next_anon_id: AtomicU64::new(1),
            recovering: std::sync::atomic::AtomicBool::new(true),
            startup_err: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn world(&self) -> &WorldStore {
        &self.world
    }

    // ---- readiness -----------------------------------------------------

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// `Ok(())` if the broker may accept connections/RPCs right now.
    pub fn readiness(&self) -> Result<(), String> {
        if self.recovering.load(Ordering::Acquire) {
            return Err("snapshot recovery in progress".to_owned());
        }
        if let Some(err) = self.startup_err.read().expect("lock poisoned").clone() {
            return Err(format!("recovery failed: {err}"));
        }
        Ok(())
    }

    /// Load the snapshot and flip `recovering` off. Runs once at startup.
    pub async fn finish_recovery(self: &Arc<Self>) {
        match self.snapshot.load().await {
            Ok(()) => {
                *self.startup_err.write().expect("lock poisoned") = None;
                self.recovering.store(false, Ordering::Release);
                let envelope = json!({
                    "type": "system_status",
                    "id": "recovered",
                    "status": "recovered",
                });
                self.snapshot.record("system_status", envelope.clone());
                if let Ok(text) = serde_json::to_string(&envelope) {
                    self.broadcast_raw(&text, None);
                }
            }
            Err(e) => {
                warn!("snapshot recovery failed: {e}");
                *self.startup_err.write().expect("lock poisoned") = Some(e.to_string());
                self.recovering.store(false, Ordering::Release);
            }
        }
    }

    // ---- admission -------------------------------------------------------

    pub fn begin_admission(&self) -> Result<(), AdmitError> {
        if self.readiness().is_err() {
            return Err(AdmitError::Recovering);
        }
        let mut roster = self.roster.write().expect("lock poisoned");
        let max_clients = self.config.max_clients;
        if max_clients > 0 && roster.connected + roster.pending >= max_clients {
            return Err(AdmitError::Capacity);
        }
        roster.pending += 1;
        Ok(())
    }

    pub fn cancel_pending(&self) {
        let mut roster = self.roster.write().expect("lock poisoned");
        roster.pending = roster.pending.saturating_sub(1);
    }

    pub fn check_origin(&self, origin_header: Option<&str>) -> bool {
        self.origin.is_allowed(origin_header)
    }

    /// Resolve the client id: verify the bearer token if auth is configured,
    /// otherwise fall back to a connection-derived identity.
    pub fn resolve_client_id(&self, token: Option<&str>, fallback: impl FnOnce() -> String) -> Result<String, ()> {
        match &self.token {
            Some(verifier) => {
                let token = token.ok_or(())?;
                verifier.verify(token, self.clock.now_ms()).map(|v| v.sub).map_err(|_| ())
            }
            None => Ok(fallback()),
        }
    }

    pub fn next_anonymous_suffix(&self) -> u64 {
        self.next_anon_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Finish admission: move pending -> connected, register the client,
    /// and enqueue recorded snapshot state so replay precedes any live
    /// broadcast the new client could otherwise observe out of order.
    pub fn finish_admission(
        &self,
        client_id: String,
        tx: mpsc::Sender<OutboundItem>,
        cancel: CancellationToken,
    ) -> Arc<ClientHandle> {
        let handle = Arc::new(ClientHandle {
            id: client_id.clone(),
            tx,
            cancel,
            controllers: Mutex::new(HashSet::new()),
        });
        {
            let mut roster = self.roster.write().expect("lock poisoned");
            roster.pending = roster.pending.saturating_sub(1);
            roster.clients.insert(client_id.clone(), Arc::clone(&handle));
            roster.connected += 1;
        }
        for msg in self.snapshot.state_messages() {
            if let Ok(text) = serde_json::to_string(&msg.payload) {
                let _ = handle.tx.try_send(OutboundItem::Text(text));
            }
        }
        debug!(client = %client_id, "client admitted");
        handle
    }

    /// Teardown. Safe to call more than once; only the first call with a
    /// live roster entry does anything.
    pub fn disconnect_client(&self, client_id: &str) {
        let removed = {
            let mut roster = self.roster.write().expect("lock poisoned");
            let removed = roster.clients.remove(client_id);
            if removed.is_some() {
                roster.connected = roster.connected.saturating_sub(1);
            }
            removed
        };
        let Some(handle) = removed else { return };
        handle.cancel.cancel();
        self.tier.remove_observer(client_id);
        self.validator.forget(client_id);
        self.bandwidth.forget(client_id);
        if let Ok(controllers) = handle.controllers.lock() {
            for controller_id in controllers.iter() {
                self.gate.forget(controller_id);
            }
        }
        debug!(client = %client_id, "client disconnected");
    }

    // ---- broadcast -------------------------------------------------------

    /// Send `text` to every client except `exclude`, evicting clients whose
    /// bandwidth budget is exhausted or whose send queue is full/closed.
    pub fn broadcast_raw(&self, text: &str, exclude: Option<&str>) {
        let mut to_evict = Vec::new();
        {
            let roster = self.roster.read().expect("lock poisoned");
            for (id, client) in roster.clients.iter() {
                if Some(id.as_str()) == exclude {
                    continue;
                }
                if !self.bandwidth.allow(id, text.len()) {
                    continue;
                }
                if client.tx.try_send(OutboundItem::Text(text.to_owned())).is_err() {
                    to_evict.push(id.clone());
                }
            }
        }
        for id in to_evict {
            self.disconnect_client(&id);
        }
    }

    fn record_and_broadcast(&self, type_: &str, value: &Value, raw: &str, exclude: &str) {
        self.snapshot.record(type_, value.clone());
        self.broadcast_raw(raw, Some(exclude));
    }

    // ---- inbound envelope routing -----------------------------------------

    fn bump_violation(&self, client_id: &str, controller_id: &str, reason: &'static str) {
        let key = format!("{client_id}|{controller_id}");
        let mut violations = self.violations.lock().expect("lock poisoned");
        *violations.entry(key).or_default().by_reason.entry(reason).or_insert(0) += 1;
    }

    fn bump_cooldown(&self, client_id: &str, controller_id: &str) {
        let key = format!("{client_id}|{controller_id}");
        let mut violations = self.violations.lock().expect("lock poisoned");
        violations.entry(key).or_default().cooldowns += 1;
    }

    fn bump_disconnect(&self, client_id: &str, controller_id: &str) {
        let key = format!("{client_id}|{controller_id}");
        let mut violations = self.violations.lock().expect("lock poisoned");
        violations.entry(key).or_default().disconnects += 1;
    }

    pub fn violation_counters(&self, client_id: &str, controller_id: &str) -> ViolationCounters {
        let key = format!("{client_id}|{controller_id}");
        self.violations.lock().expect("lock poisoned").get(&key).cloned().unwrap_or_default()
    }

    pub fn stored_intent(&self, controller_id: &str) -> Option<IntentRecord> {
        self.intents.read().expect("lock poisoned").get(controller_id).cloned()
    }

    /// Route one `intent` envelope through the validator, then the gate.
    async fn handle_intent(&self, client_id: &str, handle: Option<&Arc<ClientHandle>>, value: Value) -> IntentOutcome {
        let record: IntentRecord = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(_) => return IntentOutcome { accepted: false, disconnect: false, error: Some("malformed intent".into()) },
        };
        let controller_id = record.controller_id.clone();
        if let Some(handle) = handle {
            handle.track_controller(&controller_id);
        }

        let controls = Controls {
            throttle: record.throttle,
            brake: record.brake,
            steer: record.steer,
            gear: record.gear,
            handbrake: record.handbrake,
            boost: record.boost,
        };

        let decision = self.validator.validate(client_id, &controller_id, controls);
        if !decision.accepted {
            if let Some(reason) = decision.reason {
                self.bump_violation(client_id, &controller_id, reason.as_str());
            }
            // `cooldown` is also set on the `cooldown_active` reject path (a frame
            // arriving while a cooldown is already armed), which must not bump the
            // counter again — only a fresh arming (range/delta violation exhausting
            // the burst limit) counts (§8 invariant 4 / scenario S3).
            let newly_armed = decision.cooldown.is_some() && decision.reason != Some(ValidationReason::CooldownActive);
            if newly_armed {
                self.bump_cooldown(client_id, &controller_id);
            }
            if decision.disconnect {
                self.bump_disconnect(client_id, &controller_id);
                return IntentOutcome { accepted: false, disconnect: true, error: Some("cooldown strikes exceeded".into()) };
            }
            return IntentOutcome { accepted: false, disconnect: false, error: decision.reason.map(|r| r.as_str().to_owned()) };
        }
        self.validator.commit(client_id, &controller_id, controls);

        let gate_decision = self.gate.evaluate(
            &controller_id,
            Frame { sequence_id: record.sequence_id, sent_at_ms: record.sent_at_ms.unwrap_or_else(|| self.clock.now_ms()) },
        );
        if !gate_decision.accepted {
            return IntentOutcome { accepted: false, disconnect: false, error: gate_decision.reason.map(|r| r.as_str().to_owned()) };
        }

        self.intents.write().expect("lock poisoned").insert(controller_id, record);
        IntentOutcome { accepted: true, disconnect: false, error: None }
    }

    fn handle_observer_state(&self, client_id: &str, value: Value) {
        #[derive(serde::Deserialize)]
        struct Observed {
            #[serde(default)]
            tier: Option<String>,
        }
        let tier = serde_json::from_value::<Observed>(value.clone()).ok().and_then(|o| o.tier);
        self.tier.update_observer(client_id, tier, self.clock.now_ms(), value);
    }

    /// Dispatch one inbound text frame from `client_id`. Returns a direct
    /// reply to send back to the sender only, if any.
    pub async fn handle_inbound(
        &self,
        client_id: &str,
        handle: Option<&Arc<ClientHandle>>,
        raw: &str,
    ) -> Option<(String, bool)> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return Some((self.error_text(ErrorCode::BadRequest, "invalid json"), false)),
        };
        let Some(type_) = value.get("type").and_then(Value::as_str).filter(|s| !s.is_empty()) else {
            return Some((self.error_text(ErrorCode::BadRequest, "missing type"), false));
        };
        let type_ = type_.to_owned();
        if value.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()).is_none() {
            return Some((self.error_text(ErrorCode::BadRequest, "missing id"), false));
        }

        match type_.as_str() {
            "intent" => {
                let outcome = self.handle_intent(client_id, handle, value).await;
                if outcome.disconnect {
                    return Some(("".to_owned(), true));
                }
                None
            }
            "observer_state" => {
                self.handle_observer_state(client_id, value);
                None
            }
            "vehicle_state" => {
                if let Ok(v) = serde_json::from_value::<VehicleState>(value) {
                    self.world.upsert_vehicle(v);
                }
                None
            }
            "projectile_state" => {
                if let Ok(p) = serde_json::from_value::<Projectile>(value) {
                    self.world.upsert_projectile(p);
                }
                None
            }
            "game_event" => {
                if let Ok(e) = serde_json::from_value::<GameEvent>(value) {
                    self.world.append_event(e);
                }
                None
            }
            "radar_frame" => {
                self.tier.ingest(FrameKind::Radar);
                self.record_and_broadcast(&type_, &value, raw, client_id);
                None
            }
            "entity_snapshot" => {
                self.tier.ingest(FrameKind::EntitySnapshot);
                self.record_and_broadcast(&type_, &value, raw, client_id);
                None
            }
            "world_snapshot" => {
                self.tier.ingest(FrameKind::WorldSnapshot);
                self.record_and_broadcast(&type_, &value, raw, client_id);
                None
            }
            _ => {
                self.record_and_broadcast(&type_, &value, raw, client_id);
                None
            }
        }
    }

    fn error_text(&self, code: ErrorCode, message: &str) -> String {
        serde_json::to_string(&json!({
            "type": "error",
            "id": "error",
            "code": code.as_str(),
            "message": message,
        }))
        .unwrap_or_default()
    }

    /// Used by the gRPC `ProcessIntent` RPC, which has no live socket and so
    /// shares the validator/gate pipeline but returns a structured result.
    pub async fn process_intent_submission(&self, client_id: &str, payload: &[u8]) -> IntentOutcome {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return IntentOutcome { accepted: false, disconnect: false, error: Some("bad_request".into()) },
        };
        self.handle_intent(client_id, None, value).await
    }

    // ---- tick loop ---------------------------------------------------------

    pub async fn run_tick_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.advance_and_publish_tick(),
            }
        }
    }

    fn advance_and_publish_tick(&self) {
        let diff = self.world.advance_tick(self.config.tick_period());
        if diff.is_empty() {
            return;
        }
        let envelope = json!({
            "type": "world_diff",
            "id": format!("tick-{}", diff.tick),
            "tick": diff.tick,
            "vehicles": diff.vehicles,
            "projectiles": diff.projectiles,
            "events": diff.events,
        });
        let Ok(text) = serde_json::to_string(&envelope) else { return };
        self.broadcast_raw(&text, None);
        self.snapshot.record("world_diff", envelope);
        self.publish_diff(diff.tick, text.into_bytes());
    }

    // ---- gRPC diff subscribers ----------------------------------------------

    pub fn subscribe_diffs(&self) -> (u64, mpsc::Receiver<DiffEventMsg>) {
        let (tx, rx) = mpsc::channel(16);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.grpc_subs.lock().expect("lock poisoned").insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe_diffs(&self, id: u64) {
        self.grpc_subs.lock().expect("lock poisoned").remove(&id);
    }

    fn publish_diff(&self, tick: u64, payload: Vec<u8>) {
        let mut subs = self.grpc_subs.lock().expect("lock poisoned");
        subs.retain(|_, tx| tx.try_send(DiffEventMsg { tick, payload: payload.clone() }).is_ok());
    }

    // ---- periodic snapshot flush --------------------------------------------

    pub async fn run_snapshot_flush_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval_ms = self.config.snapshot_interval_ms.max(1);
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.snapshot.flush_if_due(self.clock.now_ms()).await;
                }
            }
        }
        self.snapshot.close(self.clock.now_ms()).await;
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
