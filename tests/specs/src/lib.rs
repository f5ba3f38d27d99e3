// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end scenario tests (§8 S1–S6).
//!
//! Each test binds a real [`vxbroker::broker::Broker`] to a loopback socket
//! via [`ServingBroker`] and drives it over genuine WebSocket and HTTP
//! connections, the same way a pilot client or a diagnostics probe would.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use vxbroker::broker::Broker;
use vxbroker::transport::grpc::BrokerGrpc;
pub use vxbroker::test_support::{BrokerBuilder, ServingBroker};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A connected `/ws` client, wrapping the raw tungstenite stream with
/// scenario-shaped helpers (send an envelope, read the next one back).
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (stream, _resp) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self { stream })
    }

    /// Send a JSON envelope as a single text frame.
    pub async fn send(&mut self, envelope: &Value) -> anyhow::Result<()> {
        self.stream.send(Message::Text(envelope.to_string().into())).await?;
        Ok(())
    }

    /// Send a raw (possibly malformed, possibly oversized) text payload.
    pub async fn send_raw(&mut self, text: &str) -> anyhow::Result<()> {
        self.stream.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Wait for the next inbound text frame, parsed as JSON. `None` if the
    /// connection closed before a frame arrived within `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<Value>> {
        loop {
            let next = tokio::time::timeout(timeout, self.stream.next()).await?;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(serde_json::from_str(&text)?)),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => anyhow::bail!("ws error: {e}"),
            }
        }
    }

    /// Keep reading frames until one whose `"type"` matches `kind`, or time out.
    pub async fn recv_kind(&mut self, kind: &str, timeout: Duration) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            anyhow::ensure!(remaining > Duration::ZERO, "never saw a {kind} frame within {timeout:?}");
            match self.recv(remaining).await? {
                Some(frame) if frame.get("type").and_then(Value::as_str) == Some(kind) => return Ok(frame),
                Some(_) => continue,
                None => anyhow::bail!("connection closed before a {kind} frame arrived"),
            }
        }
    }

    /// Wait for the socket to close (server-initiated or otherwise),
    /// returning the close frame if one was sent.
    pub async fn wait_closed(&mut self, timeout: Duration) -> anyhow::Result<Option<CloseFrame>> {
        loop {
            let next = tokio::time::timeout(timeout, self.stream.next()).await?;
            match next {
                Some(Ok(Message::Close(frame))) => return Ok(frame),
                Some(Ok(_)) => continue,
                None => return Ok(None),
                Some(Err(_)) => return Ok(None),
            }
        }
    }
}

/// Build a minimal valid `intent` envelope.
pub fn intent(id: &str, controller_id: &str, sequence_id: u64, throttle: f64, brake: f64, steer: f64, gear: i64) -> Value {
    json!({
        "type": "intent",
        "id": id,
        "schema_version": "0.1.0",
        "controller_id": controller_id,
        "sequence_id": sequence_id,
        "throttle": throttle,
        "brake": brake,
        "steer": steer,
        "handbrake": false,
        "gear": gear,
        "boost": false,
    })
}

/// Bind a broker built by `build` to a loopback socket, ready for `/ws`
/// and HTTP probes. Recovery is **not** started; call `.broker.finish_recovery()`
/// (directly, or after a delay) once the test wants to admit connections.
pub async fn serving(build: impl FnOnce(BrokerBuilder) -> BrokerBuilder) -> anyhow::Result<ServingBroker> {
    let ctx = build(BrokerBuilder::new()).build();
    ServingBroker::bind(ctx).await
}

/// Bind a broker and immediately finish recovery (no snapshot file, no
/// artificial delay), for scenarios that don't care about the recovery gate.
pub async fn serving_ready(build: impl FnOnce(BrokerBuilder) -> BrokerBuilder) -> anyhow::Result<ServingBroker> {
    let server = serving(build).await?;
    server.broker.finish_recovery().await;
    Ok(server)
}

/// Poll `GET {base_url}{path}` until it returns `want_status`, or time out.
pub async fn poll_status(base_url: &str, path: &str, want_status: u16, timeout: Duration) -> anyhow::Result<Value> {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let resp = client.get(format!("{base_url}{path}")).send().await?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status == want_status {
            return Ok(body);
        }
        anyhow::ensure!(tokio::time::Instant::now() <= deadline, "{path} never reached status {want_status}, last saw {status} ({body})");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A [`BrokerGrpc`] service bound to a loopback socket, sharing the same
/// [`Broker`] a [`ServingBroker`] drives over WebSocket — lets a test mutate
/// world state over one transport and observe it over the other.
pub struct GrpcServer {
    pub addr: String,
    shutdown: CancellationToken,
}

impl GrpcServer {
    pub async fn bind(broker: Arc<Broker>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let incoming = TcpListenerStream::new(listener);
        let shutdown = CancellationToken::new();
        let sd = shutdown.clone();
        let router = BrokerGrpc::new(broker).into_router();

        tokio::spawn(async move {
            let _ = router.serve_with_incoming_shutdown(incoming, sd.cancelled_owned()).await;
        });

        Ok(Self { addr: format!("http://{addr}"), shutdown })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
