// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gRPC transport implementing the `broker.v1.Broker` service (§6): a
//! streaming subscription to per-tick world diffs and a unary intent
//! submission path that shares the WebSocket reader's validator/gate
//! pipeline.

mod service;

use std::sync::Arc;

use tonic::{Request, Status};

use crate::auth::constant_time_eq;
use crate::broker::Broker;

/// Generated protobuf types for the `broker.v1` package.
pub mod proto {
    tonic::include_proto!("broker.v1");
}

/// gRPC implementation of the `broker.v1.Broker` service.
pub struct BrokerGrpc {
    state: Arc<Broker>,
}

impl BrokerGrpc {
    /// Create a new gRPC service backed by the given broker.
    pub fn new(state: Arc<Broker>) -> Self {
        Self { state }
    }

    /// Build a [`tonic`] router for this service.
    ///
    /// When a shared secret is configured, an interceptor checks it against
    /// either the `x-broker-shared-secret` metadata entry or a Bearer
    /// `authorization` header, constant-time compared (§6). Actual mTLS
    /// handshake/certificate verification is performed by the TLS-terminating
    /// layer in front of this server (§1: TLS/mTLS material loading is an
    /// external collaborator) — a CA path configured via
    /// `--grpc-client-ca` only documents that the deployment expects mTLS at
    /// that layer; this service does not itself parse certificates.
    pub fn into_router(self) -> tonic::transport::server::Router {
        let shared_secret = self.state.config().grpc_shared_secret.clone();
        let mut server = tonic::transport::Server::builder();
        if let Some(secret) = shared_secret {
            let interceptor = GrpcAuthInterceptor { secret };
            server.add_service(proto::broker_server::BrokerServer::with_interceptor(self, interceptor))
        } else {
            server.add_service(proto::broker_server::BrokerServer::new(self))
        }
    }
}

/// gRPC interceptor enforcing shared-secret auth on every RPC (§6).
#[derive(Clone)]
struct GrpcAuthInterceptor {
    secret: String,
}

impl tonic::service::Interceptor for GrpcAuthInterceptor {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        if let Some(value) = req.metadata().get("x-broker-shared-secret").and_then(|v| v.to_str().ok()) {
            if constant_time_eq(value.as_bytes(), self.secret.as_bytes()) {
                return Ok(req);
            }
        }

        if let Some(header) = req.metadata().get("authorization").and_then(|v| v.to_str().ok()) {
            if let Some(bearer) = header.strip_prefix("Bearer ") {
                if constant_time_eq(bearer.as_bytes(), self.secret.as_bytes()) {
                    return Ok(req);
                }
            }
        }

        Err(Status::unauthenticated("invalid or missing shared secret"))
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
