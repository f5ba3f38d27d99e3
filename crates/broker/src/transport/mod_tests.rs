// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::test_support::{AnyhowExt, BrokerBuilder};
use crate::transport::{build_health_router, build_router};

#[tokio::test]
async fn healthz_reports_unavailable_while_recovering() -> anyhow::Result<()> {
    let ctx = BrokerBuilder::new().build();
    let app = build_router(ctx.broker);
    let server = axum_test::TestServer::new(app).anyhow()?;

    let resp = server.get("/healthz").await;
    resp.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_str(&resp.text())?;
    assert_eq!(body["status"], "unavailable");
    Ok(())
}

#[tokio::test]
async fn healthz_reports_ok_once_recovery_finishes() -> anyhow::Result<()> {
    let ctx = BrokerBuilder::new().build();
    ctx.broker.finish_recovery().await;
    let app = build_router(ctx.broker);
    let server = axum_test::TestServer::new(app).anyhow()?;

    let resp = server.get("/healthz").await;
    resp.assert_status_ok();
    let body: serde_json::Value = serde_json::from_str(&resp.text())?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn readyz_message_mentions_recovery_while_unready() -> anyhow::Result<()> {
    let ctx = BrokerBuilder::new().build();
    let app = build_router(ctx.broker);
    let server = axum_test::TestServer::new(app).anyhow()?;

    let resp = server.get("/readyz").await;
    resp.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_str(&resp.text())?;
    assert_eq!(body["status"], "not_ready");
    assert!(body["message"].as_str().unwrap_or_default().contains("recovery"));
    Ok(())
}

#[tokio::test]
async fn health_only_router_does_not_serve_ws() -> anyhow::Result<()> {
    let ctx = BrokerBuilder::new().build();
    ctx.broker.finish_recovery().await;
    let app = build_health_router(ctx.broker);
    let server = axum_test::TestServer::new(app).anyhow()?;

    server.get("/healthz").await.assert_status_ok();
    server.get("/ws").await.assert_status_not_found();
    Ok(())
}
