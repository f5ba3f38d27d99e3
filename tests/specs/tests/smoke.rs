// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenario tests (§8 S1–S6) plus the admission invariants
//! (capacity, origin, auth) driven over real WebSocket/HTTP connections.

use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use broker_specs::{intent, poll_status, serving, serving_ready, GrpcServer, WsClient, TIMEOUT};
use vxbroker::transport::grpc::proto::broker_client::BrokerClient;
use vxbroker::transport::grpc::proto::{IntentSubmission, SubscribeStateDiffsRequest};

fn sign_token(secret: &str, sub: &str, exp_secs: i64) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = engine.encode(json!({ "sub": sub, "exp": exp_secs, "iat": 0 }).to_string());
    let signing_input = format!("{header}.{payload}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("valid hmac key");
    mac.update(signing_input.as_bytes());
    let sig = engine.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{sig}")
}

// S1: a rejected frame never displaces the last accepted intent, and the
// rejection itself costs the controller nothing but a counter bump.
#[tokio::test]
async fn s1_accept_then_regress_keeps_last_committed_intent() {
    let server = serving_ready(|b| b).await.expect("serve");
    let mut ws = WsClient::connect(&server.ws_url).await.expect("connect");

    ws.send(&intent("i1", "veh-1", 0, 0.2, 0.0, 0.0, 1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let accepted = server.broker.stored_intent("veh-1").expect("intent stored");
    assert_eq!(accepted.sequence_id, 0);
    assert_eq!(accepted.throttle, 0.2);

    // Out-of-range throttle: rejected, but must not clobber the stored record.
    ws.send(&intent("i2", "veh-1", 1, 1.5, 0.0, 0.0, 1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let still = server.broker.stored_intent("veh-1").expect("intent still stored");
    assert_eq!(still.sequence_id, 0, "regressed frame must not overwrite the committed intent");

    let counters = server.broker.violation_counters("ws-1", "veh-1");
    assert_eq!(*counters.by_reason.get("throttle_range").unwrap_or(&0), 1);

    server.shutdown();
}

// S2: throttle's inclusive range boundary (§4.2 defaults: [-1, 1]).
#[tokio::test]
async fn s2_throttle_range_is_inclusive() {
    let server = serving_ready(|b| b).await.expect("serve");
    let mut ws = WsClient::connect(&server.ws_url).await.expect("connect");

    ws.send(&intent("i1", "veh-1", 0, -1.0, 0.0, 0.0, 1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(server.broker.stored_intent("veh-1").expect("stored").sequence_id, 0);

    ws.send(&intent("i2", "veh-1", 1, 1.0, 0.0, 0.0, 1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(server.broker.stored_intent("veh-1").expect("stored").sequence_id, 1);

    // Just past the boundary: rejected.
    ws.send(&intent("i3", "veh-1", 2, 1.0 + 1e-6, 0.0, 0.0, 1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(server.broker.stored_intent("veh-1").expect("stored").sequence_id, 1, "out-of-range frame rejected");

    server.shutdown();
}

// S3: repeated delta-spikes within the burst window arm a cooldown; once
// cooldown strikes reach the configured max, the controller's connection
// is disconnected (§4.2 steps 5–6).
#[tokio::test]
async fn s3_delta_spike_arms_cooldown_then_disconnects() {
    let server = serving_ready(|b| b.intent_cooldown_tuning(2, 10_000, 200, 1)).await.expect("serve");
    let mut ws = WsClient::connect(&server.ws_url).await.expect("connect");

    ws.send(&intent("i0", "veh-1", 0, 0.0, 0.0, 0.0, 1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Two large throttle spikes (delta_max default 0.35) inside the burst window.
    ws.send(&intent("i1", "veh-1", 1, 0.9, 0.0, 0.0, 1)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;
    ws.send(&intent("i2", "veh-1", 2, 0.0, 0.0, 0.0, 1)).await.expect("send");

    let close = ws.wait_closed(TIMEOUT).await.expect("closed");
    assert!(close.is_some(), "connection should be closed once cooldown strikes exceed the max");

    let counters = server.broker.violation_counters("ws-1", "veh-1");
    assert_eq!(counters.cooldowns, 1);
    assert_eq!(counters.disconnects, 1);

    server.shutdown();
}

// S4: a frame larger than max_payload_bytes closes the socket with 1009
// (message too big) instead of being dispatched.
#[tokio::test]
async fn s4_oversized_frame_closes_with_message_too_big() {
    let server = serving_ready(|b| b.max_payload_bytes(64)).await.expect("serve");
    let mut ws = WsClient::connect(&server.ws_url).await.expect("connect");

    let oversized = "x".repeat(200);
    ws.send_raw(&oversized).await.expect("send");

    let close = ws.wait_closed(TIMEOUT).await.expect("closed");
    let frame = close.expect("server must close the connection");
    assert_eq!(u16::from(frame.code), 1009);

    server.shutdown();
}

// S5: connections are refused while recovery is in progress, and a state
// message recorded before a client joins is replayed to it ahead of any
// live traffic (§4.1 admission order, §4.6 replay-on-join).
#[tokio::test]
async fn s5_recovery_gate_then_replay_on_join() {
    let server = serving(|b| b).await.expect("serve");

    // Still recovering: the upgrade handshake itself must fail (503 JSON body,
    // never a 101 Switching Protocols).
    assert!(WsClient::connect(&server.ws_url).await.is_err(), "must reject connections while recovering");

    server.broker.finish_recovery().await;
    poll_status(&server.base_url, "/readyz", 200, TIMEOUT).await.expect("ready");

    let mut first = WsClient::connect(&server.ws_url).await.expect("connect");
    first.send(&json!({ "type": "world_snapshot", "id": "snap-1", "tick": 7, "entities": [] })).await.expect("send");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut second = WsClient::connect(&server.ws_url).await.expect("connect");
    let replayed = second.recv_kind("world_snapshot", TIMEOUT).await.expect("replayed state");
    assert_eq!(replayed.get("tick").and_then(serde_json::Value::as_i64), Some(7));

    server.shutdown();
}

// S6: the tick loop broadcasts a world_diff to every connected client,
// including the one whose update produced it.
#[tokio::test]
async fn s6_tick_loop_broadcasts_world_diff() {
    let server = serving_ready(|b| b.tick_hz(50)).await.expect("serve");
    let mut ws = WsClient::connect(&server.ws_url).await.expect("connect");

    let vehicle = json!({
        "type": "vehicle_state",
        "id": "vs-1",
        "vehicle_id": "veh-9",
        "position": {"x": 0.0, "y": 0.0, "z": 0.0},
        "velocity": {"x": 0.0, "y": 0.0, "z": 0.0},
        "orientation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
        "angular_velocity": {"x": 0.0, "y": 0.0, "z": 0.0},
        "speed_mps": 0.0,
        "throttle_pct": 0.0,
        "vertical_thrust_pct": 0.0,
        "boost_pct": 0.0,
        "boost_active": false,
        "flight_assist_enabled": true,
        "energy_remaining_pct": 100.0,
        "updated_at_ms": 0,
    });
    ws.send(&vehicle).await.expect("send");

    let diff = ws.recv_kind("world_diff", TIMEOUT).await.expect("world_diff");
    let vehicles = diff.get("vehicles").and_then(|v| v.get("updated")).and_then(serde_json::Value::as_array).cloned().unwrap_or_default();
    assert!(vehicles.iter().any(|v| v.get("vehicle_id").and_then(serde_json::Value::as_str) == Some("veh-9")));

    server.shutdown();
}

// Invariant: once `max_clients` connections are admitted, further upgrades
// are rejected rather than queued or dropped silently (§8 invariant 8).
#[tokio::test]
async fn capacity_limit_rejects_excess_connections() {
    let server = serving_ready(|b| b.max_clients(1)).await.expect("serve");

    let _first = WsClient::connect(&server.ws_url).await.expect("first connects");
    let second = WsClient::connect(&server.ws_url).await;
    assert!(second.is_err(), "second connection must be rejected once at capacity");

    server.shutdown();
}

// Invariant: only allow-listed origins may complete the WebSocket handshake
// (§8 invariant 9), independent of auth.
#[tokio::test]
async fn origin_not_allowed_rejects_handshake() {
    let server = serving_ready(|b| b.allowed_origins(vec!["https://pilot.example".to_owned()])).await.expect("serve");

    let mut request = server.ws_url.clone().into_client_request().expect("request");
    request.headers_mut().insert("Origin", "https://evil.example".parse().expect("header value"));
    let result = tokio_tungstenite::connect_async(request).await;
    assert!(result.is_err(), "disallowed origin must be rejected");

    server.shutdown();
}

// Invariant: bearer-token auth, when configured, gates the handshake
// (§8 invariant 10) and the token's `sub` claim becomes the client id.
#[tokio::test]
async fn auth_token_gates_handshake() {
    let server = serving_ready(|b| b.hmac_secret("top-secret")).await.expect("serve");

    let bad = format!("{}?auth_token=not-a-token", server.ws_url);
    assert!(WsClient::connect(&bad).await.is_err(), "malformed token must be rejected");

    let token = sign_token("top-secret", "pilot-42", 9_999_999_999);
    let good = format!("{}?auth_token={token}", server.ws_url);
    let _ws = WsClient::connect(&good).await.expect("valid token admits the connection");

    server.shutdown();
}

// gRPC bridges the same validator/gate pipeline and tick-diff fan-out as
// the WebSocket transport (§6): a vehicle_state update sent over `/ws`
// shows up in a DiffEvent streamed over SubscribeStateDiffs.
#[tokio::test]
async fn grpc_process_intent_and_subscribe_state_diffs() {
    let server = serving_ready(|b| b.tick_hz(50)).await.expect("serve");
    let grpc = GrpcServer::bind(std::sync::Arc::clone(&server.broker)).await.expect("grpc bind");

    let mut client = BrokerClient::connect(grpc.addr.clone()).await.expect("grpc connect");

    let payload = intent("i1", "veh-7", 0, 0.1, 0.0, 0.0, 1).to_string().into_bytes();
    let resp = client
        .process_intent(IntentSubmission { client_id: "grpc-client".to_owned(), payload })
        .await
        .expect("process_intent")
        .into_inner();
    assert!(resp.accepted);

    let mut stream = client
        .subscribe_state_diffs(SubscribeStateDiffsRequest { subscriber_id: "spec-test".to_owned() })
        .await
        .expect("subscribe")
        .into_inner();

    // Produce a non-empty tick by upserting a vehicle over the WebSocket transport.
    let mut ws = WsClient::connect(&server.ws_url).await.expect("connect");
    ws.send(&json!({
        "type": "vehicle_state", "id": "vs-1", "vehicle_id": "veh-grpc",
        "position": {"x": 0.0, "y": 0.0, "z": 0.0}, "velocity": {"x": 0.0, "y": 0.0, "z": 0.0},
        "orientation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0}, "angular_velocity": {"x": 0.0, "y": 0.0, "z": 0.0},
        "speed_mps": 0.0, "throttle_pct": 0.0, "vertical_thrust_pct": 0.0, "boost_pct": 0.0,
        "boost_active": false, "flight_assist_enabled": true, "energy_remaining_pct": 100.0, "updated_at_ms": 0,
    }))
    .await
    .expect("send");

    let event = tokio::time::timeout(TIMEOUT, stream.message())
        .await
        .expect("diff within timeout")
        .expect("stream still open")
        .expect("a DiffEvent");
    assert!(event.tick > 0);
    let diff: serde_json::Value = serde_json::from_slice(&event.payload).expect("diff payload is json");
    let vehicles = diff.get("vehicles").and_then(|v| v.get("updated")).and_then(serde_json::Value::as_array).cloned().unwrap_or_default();
    assert!(vehicles.iter().any(|v| v.get("vehicle_id").and_then(serde_json::Value::as_str) == Some("veh-grpc")));

    grpc.shutdown();
    server.shutdown();
}
