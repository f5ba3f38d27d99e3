// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level bootstrap — shared by `main` and integration tests: builds the
//! [`Broker`], starts the HTTP/WebSocket, gRPC, and optional health-only
//! listeners, runs the tick and snapshot-flush loops, and drives graceful
//! shutdown on SIGTERM/SIGINT.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::broker::Broker;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::snapshot::Snapshotter;
use crate::transport::grpc::BrokerGrpc;
use crate::transport::{build_health_router, build_router};

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / VXBROKER_LOG_LEVEL > RUST_LOG > default.
    let filter = if std::env::var("VXBROKER_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the broker to completion: bootstrap, serve, and block until shutdown.
///
/// This is the full production codepath invoked by `main`. Tests that need
/// a running broker without a real process should prefer
/// [`crate::test_support::BrokerBuilder`] instead of this function.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let clock: SharedClock = Arc::new(SystemClock);
    let snapshot = Arc::new(Snapshotter::new(
        config.snapshot_path.clone(),
        Duration::from_millis(config.snapshot_interval_ms),
    ));
    let broker = Arc::new(Broker::new(Arc::clone(&config), clock, snapshot));

    // Recovery replays the snapshot (if any) before any client is admitted;
    // readyz/healthz report unavailable until this completes.
    {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker.finish_recovery().await;
        });
    }

    // HTTP/WebSocket listener.
    {
        let router = build_router(Arc::clone(&broker));
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("HTTP/WebSocket listening on {}", listener.local_addr()?);
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        });
    }

    // gRPC listener.
    {
        let grpc = BrokerGrpc::new(Arc::clone(&broker));
        let addr = format!("{}:{}", config.host, config.grpc_port).parse()?;
        info!("gRPC listening on {addr}");
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result = grpc.into_router().serve_with_shutdown(addr, sd.cancelled_owned()).await;
            if let Err(e) = result {
                error!("gRPC server error: {e}");
            }
        });
    }

    // Optional health-only listener, isolated from the `/ws` listener's fate.
    if let Some(health_port) = config.health_port {
        let router = build_health_router(Arc::clone(&broker));
        let addr = format!("{}:{}", config.host, health_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("health probe listening on {addr}");
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
            if let Err(e) = result {
                error!("health server error: {e}");
            }
        });
    }

    // Simulation tick loop: advances world state and publishes diffs to
    // gRPC stream subscribers at the configured rate.
    {
        let broker = Arc::clone(&broker);
        let sd = shutdown.clone();
        tokio::spawn(async move {
            broker.run_tick_loop(sd).await;
        });
    }

    // Periodic snapshot flush loop.
    {
        let broker = Arc::clone(&broker);
        let sd = shutdown.clone();
        tokio::spawn(async move {
            broker.run_snapshot_flush_loop(sd).await;
        });
    }

    wait_for_shutdown_signal(shutdown).await;
    info!("shutdown complete");
    Ok(())
}

/// Block until SIGTERM/SIGINT, then cancel `shutdown`. A second signal
/// forces an immediate exit, in case a listener or loop is wedged.
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

    tokio::select! {
        _ = async {
            if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
        } => {
            info!("received SIGTERM");
        }
        _ = async {
            if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
        } => {
            info!("received SIGINT");
        }
    }
    shutdown.cancel();

    tokio::select! {
        _ = async {
            if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
        } => {
            info!("received SIGTERM again, forcing exit");
            std::process::exit(130);
        }
        _ = async {
            if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
        } => {
            info!("received SIGINT again, forcing exit");
            std::process::exit(130);
        }
        _ = tokio::time::sleep(Duration::from_secs(10)) => {
            info!("graceful shutdown window elapsed");
        }
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
