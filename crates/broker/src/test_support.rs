// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: a builder for a fully wired [`Broker`] backed
//! by a temp-dir snapshot path and a settable [`TestClock`], so unit and
//! router-level tests never touch real time or a shared filesystem path.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::clock::{SharedClock, TestClock};
use crate::config::Config;
use crate::snapshot::Snapshotter;
use crate::transport::build_router;

/// Bundle returned by [`BrokerBuilder::build`]: the broker plus the handles
/// a test needs to drive time and clean up the backing temp directory.
pub struct BrokerCtx {
    pub broker: Arc<Broker>,
    pub clock: Arc<TestClock>,
    pub dir: tempfile::TempDir,
}

/// Builder for a [`Broker`] wired with sensible test defaults: no client
/// cap, a single allowed origin, token auth disabled.
pub struct BrokerBuilder {
    max_clients: usize,
    allowed_origins: Vec<String>,
    hmac_secret: Option<String>,
    grpc_shared_secret: Option<String>,
    intent_burst_limit: u32,
    intent_burst_window_ms: u64,
    intent_cooldown_ms: u64,
    intent_max_cooldown_strikes: u32,
    max_payload_bytes: usize,
    tick_hz: u32,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self {
            max_clients: 0,
            allowed_origins: vec!["https://pilot.example".to_owned()],
            hmac_secret: None,
            grpc_shared_secret: None,
            intent_burst_limit: 5,
            intent_burst_window_ms: 1000,
            intent_cooldown_ms: 500,
            intent_max_cooldown_strikes: 3,
            max_payload_bytes: 65536,
            tick_hz: 60,
        }
    }

    pub fn max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn tick_hz(mut self, hz: u32) -> Self {
        self.tick_hz = hz;
        self
    }

    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn hmac_secret(mut self, secret: impl Into<String>) -> Self {
        self.hmac_secret = Some(secret.into());
        self
    }

    pub fn grpc_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.grpc_shared_secret = Some(secret.into());
        self
    }

    /// Tune the cooldown escalation knobs, for scenarios driving §8's S3
    /// (delta spike → cooldown) with tight, test-friendly thresholds.
    pub fn intent_cooldown_tuning(mut self, burst_limit: u32, burst_window_ms: u64, cooldown_ms: u64, max_strikes: u32) -> Self {
        self.intent_burst_limit = burst_limit;
        self.intent_burst_window_ms = burst_window_ms;
        self.intent_cooldown_ms = cooldown_ms;
        self.intent_max_cooldown_strikes = max_strikes;
        self
    }

    pub fn build(self) -> BrokerCtx {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(Config {
            port: 0,
            host: "127.0.0.1".to_owned(),
            grpc_port: 0,
            health_port: None,
            tls_cert: None,
            tls_key: None,
            allowed_origins: self.allowed_origins,
            max_payload_bytes: self.max_payload_bytes,
            max_clients: self.max_clients,
            ping_interval_ms: 15000,
            pong_multiplier: 3,
            write_wait_ms: 5000,
            send_queue_capacity: 256,
            snapshot_path: dir.path().join("snapshot.json"),
            snapshot_interval_ms: 5000,
            hmac_secret: self.hmac_secret,
            grpc_shared_secret: self.grpc_shared_secret,
            grpc_client_ca: None,
            admin_token: None,
            tick_hz: self.tick_hz,
            intent_min_interval_ms: 0,
            intent_max_age_ms: 2000,
            bandwidth_budget_bytes: 262_144,
            bandwidth_refill_bps: 131_072,
            intent_burst_window_ms: self.intent_burst_window_ms,
            intent_burst_limit: self.intent_burst_limit,
            intent_cooldown_ms: self.intent_cooldown_ms,
            intent_max_cooldown_strikes: self.intent_max_cooldown_strikes,
            intent_throttle_delta_max: 0.35,
            intent_brake_delta_max: 0.50,
            intent_steer_delta_max: 0.45,
            intent_gear_delta_max: 1.0,
            replay_dump_window_ms: 60000,
            replay_dump_burst: 5,
            log_format: "text".to_owned(),
            log_level: "warn".to_owned(),
        });
        let clock = Arc::new(TestClock::new(1_000_000));
        let shared_clock: SharedClock = Arc::clone(&clock);
        let snapshot = Arc::new(Snapshotter::new(config.snapshot_path.clone(), Duration::from_millis(config.snapshot_interval_ms)));
        let broker = Arc::new(Broker::new(config, shared_clock, snapshot));
        BrokerCtx { broker, clock, dir }
    }
}

/// A [`Broker`] bound to a real loopback socket, serving `/ws` plus health
/// routes, with the tick loop running. Used by out-of-crate integration
/// tests that need a genuine WebSocket/HTTP client roundtrip rather than
/// driving [`Broker`]'s methods directly (§8 S1–S6).
pub struct ServingBroker {
    pub broker: Arc<Broker>,
    pub clock: Arc<TestClock>,
    pub base_url: String,
    pub ws_url: String,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl ServingBroker {
    /// Bind `ctx`'s broker to an ephemeral loopback port and start serving.
    /// Does **not** spawn recovery — call [`Broker::finish_recovery`] on
    /// `.broker` (directly, or after a delay) once the test is ready to
    /// admit connections, matching §4.6's async-recovery design.
    pub async fn bind(ctx: BrokerCtx) -> anyhow::Result<Self> {
        let BrokerCtx { broker, clock, dir } = ctx;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(Arc::clone(&broker));
        let shutdown = CancellationToken::new();

        let sd = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
        });

        let tick_broker = Arc::clone(&broker);
        let tick_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tick_broker.run_tick_loop(tick_shutdown).await;
        });

        Ok(Self {
            broker,
            clock,
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/ws"),
            shutdown,
            _dir: dir,
        })
    }

    /// Signal the HTTP/WS listener and tick loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Collapses any `Display`-able error into `anyhow::Error`, for tests that
/// want `?` against libraries (like `axum_test`) with their own error type.
pub trait AnyhowExt<T> {
    fn anyhow(self) -> anyhow::Result<T>;
}

impl<T, E: std::fmt::Display> AnyhowExt<T> for Result<T, E> {
    fn anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{e}"))
    }
}
