// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport layer: the `/ws` upgrade handler, health/readiness routes, and
//! the gRPC service. Everything here drives the [`crate::broker::Broker`]
//! through its public methods; no transport module touches broker internals
//! directly (module doc in `broker.rs`).

pub mod grpc;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;

/// `GET /healthz` — liveness probe. `200` once recovery has finished
/// successfully or failed; `503` while still recovering (§7 Recovery
/// failure: healthz also reports 503 on a failed recovery).
async fn healthz(State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    match broker.readiness() {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(message) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unavailable", "message": message }))),
    }
}

/// `GET /readyz` — readiness probe (§4.6/§8 invariant 7: 503 with a message
/// containing "recovery" while `recovering=true`).
async fn readyz(State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    match broker.readiness() {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(message) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not_ready", "message": message }))),
    }
}

/// Build the full HTTP/WebSocket router: `/ws` plus the health/readiness
/// routes also served on the primary listener.
pub fn build_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Build the health-only router bound to the optional `--health-port`
/// listener (§6 Environment/config: a separate listen port for probes that
/// should not share fate with the `/ws` listener).
pub fn build_health_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(broker)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
