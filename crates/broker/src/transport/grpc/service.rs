// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Broker` trait implementation — the two gRPC bridge operations (§6).

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use super::{proto, BrokerGrpc};
use crate::broker::Broker;

type GrpcStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl proto::broker_server::Broker for BrokerGrpc {
    type SubscribeStateDiffsStream = GrpcStream<proto::DiffEvent>;

    /// Streams one [`proto::DiffEvent`] per non-empty tick, in tick order,
    /// for the lifetime of the call. The subscriber slot is released and the
    /// channel closed exactly once, whether the call is cancelled by the
    /// client (outbound send fails) or the broker stops publishing (inbound
    /// channel closes) — §4.5, §5.
    async fn subscribe_state_diffs(
        &self,
        _request: Request<proto::SubscribeStateDiffsRequest>,
    ) -> Result<Response<Self::SubscribeStateDiffsStream>, Status> {
        let (sub_id, mut diffs) = self.state.subscribe_diffs();
        let broker: Arc<Broker> = Arc::clone(&self.state);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(event) = diffs.recv().await {
                let item = proto::DiffEvent { tick: event.tick, payload: event.payload };
                if tx.send(Ok(item)).await.is_err() {
                    break;
                }
            }
            broker.unsubscribe_diffs(sub_id);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    /// Submits a single intent frame on behalf of a controller, running it
    /// through the same `IntentValidator` → `IntentGate` pipeline the
    /// WebSocket reader uses (§4.4, §6).
    async fn process_intent(
        &self,
        request: Request<proto::IntentSubmission>,
    ) -> Result<Response<proto::IntentResult>, Status> {
        let req = request.into_inner();
        let outcome = self.state.process_intent_submission(&req.client_id, &req.payload).await;
        Ok(Response::new(proto::IntentResult {
            accepted: outcome.accepted,
            disconnect: outcome.disconnect,
            error: outcome.error.unwrap_or_default(),
        }))
    }
}
