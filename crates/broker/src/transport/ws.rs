// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket upgrade handler and per-connection event loop (§4.1).
//!
//! The admission sequence — recovery gate, capacity, origin, token — runs
//! synchronously in [`ws_handler`] before the upgrade completes; everything
//! after `on_upgrade` is a single `select!` loop per connection that owns
//! both the read and write deadlines, mirroring the transport's other
//! single-task connection handlers.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::token::extract_token;
use crate::broker::{AdmitError, Broker, OutboundItem};
use crate::error::{close_code, ErrorCode};

/// Query parameters accepted on the `/ws` upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    auth_token: Option<String>,
}

/// `GET /ws` upgrade handler implementing the admission sequence from §4.1:
/// recovery gate, capacity, origin, then auth.
pub async fn ws_handler(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = broker.begin_admission() {
        let code = match err {
            AdmitError::Recovering => ErrorCode::Recovering,
            AdmitError::Capacity => ErrorCode::Capacity,
        };
        return admission_error(code, "broker unavailable");
    }

    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !broker.check_origin(origin) {
        broker.cancel_pending();
        return admission_error(ErrorCode::ForbiddenOrigin, "origin not allowed");
    }

    let header_token = headers.get("x-auth-token").and_then(|v| v.to_str().ok());
    let token = extract_token(query.auth_token.as_deref(), header_token);
    let client_id = match broker.resolve_client_id(token.as_deref(), || format!("ws-{}", broker.next_anonymous_suffix())) {
        Ok(id) => id,
        Err(()) => {
            broker.cancel_pending();
            return admission_error(ErrorCode::Unauthorized, "authentication failed");
        }
    };

    ws.on_upgrade(move |socket| handle_connection(broker, client_id, socket)).into_response()
}

fn admission_error(code: ErrorCode, message: &str) -> Response {
    let status = axum::http::StatusCode::from_u16(code.http_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(code.to_error_body(message))).into_response()
}

/// Per-connection event loop: one task owns both the read deadline (reset on
/// every inbound frame) and the write deadline (bounding every outbound
/// send), combining keepalive pings, the outbound send queue, and inbound
/// dispatch in a single `select!`.
async fn handle_connection(broker: Arc<Broker>, client_id: String, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel(broker.config().send_queue_capacity);
    let cancel = CancellationToken::new();
    let handle = broker.finish_admission(client_id.clone(), tx, cancel.clone());

    let read_deadline = broker.config().read_deadline();
    let write_wait = broker.config().write_wait();
    let max_bytes = broker.config().max_payload_bytes;
    let mut deadline = tokio::time::Instant::now() + read_deadline;

    let mut ping_ticker = tokio::time::interval(broker.config().ping_interval());
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ping_failures = 0u32;

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                debug!(client = %client_id, "read deadline exceeded, evicting");
                break;
            }
            _ = ping_ticker.tick() => {
                match tokio::time::timeout(write_wait, ws_tx.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => ping_failures = 0,
                    _ => {
                        ping_failures += 1;
                        if ping_failures >= 3 {
                            debug!(client = %client_id, "ping failures exceeded, evicting");
                            break;
                        }
                    }
                }
            }
            item = rx.recv() => {
                let Some(item) = item else { break };
                match item {
                    OutboundItem::Text(text) => {
                        if tokio::time::timeout(write_wait, ws_tx.send(Message::Text(text.into()))).await.is_err() {
                            break;
                        }
                    }
                    OutboundItem::Close(code, reason) => {
                        let frame = Message::Close(Some(CloseFrame { code, reason: reason.into() }));
                        let _ = tokio::time::timeout(write_wait, ws_tx.send(frame)).await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                deadline = tokio::time::Instant::now() + read_deadline;
                match msg {
                    Message::Text(text) => {
                        if text.len() > max_bytes {
                            let frame = Message::Close(Some(CloseFrame { code: close_code::MESSAGE_TOO_BIG, reason: "message too big".into() }));
                            let _ = tokio::time::timeout(write_wait, ws_tx.send(frame)).await;
                            break;
                        }
                        match broker.handle_inbound(&client_id, Some(&handle), &text).await {
                            Some((reply, true)) => {
                                if !reply.is_empty() {
                                    let _ = tokio::time::timeout(write_wait, ws_tx.send(Message::Text(reply.into()))).await;
                                }
                                let frame = Message::Close(Some(CloseFrame { code: close_code::NORMAL, reason: "disconnected".into() }));
                                let _ = tokio::time::timeout(write_wait, ws_tx.send(frame)).await;
                                break;
                            }
                            Some((reply, false)) => {
                                if !reply.is_empty() && tokio::time::timeout(write_wait, ws_tx.send(Message::Text(reply.into()))).await.is_err() {
                                    break;
                                }
                            }
                            None => {}
                        }
                    }
                    Message::Binary(data) => {
                        if data.len() > max_bytes {
                            let frame = Message::Close(Some(CloseFrame { code: close_code::MESSAGE_TOO_BIG, reason: "message too big".into() }));
                            let _ = tokio::time::timeout(write_wait, ws_tx.send(frame)).await;
                            break;
                        }
                        // Non-text frames are protocol violations (§7): dropped, not dispatched.
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    cancel.cancel();
    broker.disconnect_client(&client_id);
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
