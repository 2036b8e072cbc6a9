//! Fabric Gateway client over gRPC.
//!
//! Every message leaving this module is signed through the session's [`Signer`], the
//! private key never reaches the gateway process. Channels come from the shared
//! [`ConnectionCache`].

mod proposal;
pub mod protos;

use std::sync::Arc;

use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
use http::uri::PathAndQuery;
use prost::Message;
use tonic::{client::Grpc, codec::ProstCodec, transport::Channel};

use super::{
    BlockEvent, ChaincodeEvent, EventStream, Identity, LedgerClient, LedgerConnector,
    LedgerError, Signer, TargetNode, TransactionCall,
};
use crate::transport::{ChannelKey, ConnectionCache, GrpcChannelFactory};

const EVALUATE: &str = "/gateway.Gateway/Evaluate";
const ENDORSE: &str = "/gateway.Gateway/Endorse";
const SUBMIT: &str = "/gateway.Gateway/Submit";
const COMMIT_STATUS: &str = "/gateway.Gateway/CommitStatus";
const CHAINCODE_EVENTS: &str = "/gateway.Gateway/ChaincodeEvents";
const DELIVER: &str = "/protos.Deliver/Deliver";

/// Builds [`FabricClient`]s on top of pooled gRPC channels.
pub struct FabricConnector {
    cache: Arc<ConnectionCache<GrpcChannelFactory>>,
}

impl FabricConnector {
    pub fn new(cache: Arc<ConnectionCache<GrpcChannelFactory>>) -> Self {
        Self { cache }
    }
}

impl LedgerConnector for FabricConnector {
    fn connect<'a>(
        &'a self,
        identity: Identity,
        signer: Arc<dyn Signer>,
        target: &'a TargetNode,
    ) -> BoxFuture<'a, Result<Box<dyn LedgerClient>, LedgerError>> {
        async move {
            let key = ChannelKey {
                endpoint: target.address.clone(),
                name: target.name.clone(),
                trust_anchor: target.tls_root_cert.clone(),
            };
            let channel = self.cache.acquire(&key).await?;
            Ok(Box::new(FabricClient {
                channel,
                identity,
                signer,
            }) as Box<dyn LedgerClient>)
        }
        .boxed()
    }
}

pub struct FabricClient {
    channel: Channel,
    identity: Identity,
    signer: Arc<dyn Signer>,
}

impl FabricClient {
    async fn grpc(&self) -> Result<Grpc<Channel>, LedgerError> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|err| tonic::Status::unavailable(format!("gateway not ready: {err}")))?;
        Ok(grpc)
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let digest = proposal::digest(message);
        Ok(self.signer.sign(&digest).await?)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, LedgerError>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc().await?;
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                ProstCodec::default(),
            )
            .await?;
        Ok(response.into_inner())
    }

    async fn signed_proposal(
        &self,
        call: &TransactionCall,
    ) -> Result<(String, protos::SignedProposal), LedgerError> {
        let prepared = proposal::chaincode_proposal(&self.identity, call);
        let signature = self.sign(&prepared.bytes).await?;
        Ok((
            prepared.tx_id,
            protos::SignedProposal {
                proposal_bytes: prepared.bytes,
                signature,
            },
        ))
    }

    /// Endorses and submits, returning the transaction id and the endorsed envelope.
    async fn endorse_and_submit(
        &self,
        call: &TransactionCall,
    ) -> Result<(String, protos::Envelope), LedgerError> {
        let (tx_id, signed) = self.signed_proposal(call).await?;
        let endorsed: protos::EndorseResponse = self
            .unary(
                ENDORSE,
                protos::EndorseRequest {
                    transaction_id: tx_id.clone(),
                    channel_id: call.channel.clone(),
                    proposed_transaction: Some(signed),
                },
            )
            .await?;
        let envelope = self.sign_prepared(endorsed).await?;

        let _: protos::SubmitResponse = self
            .unary(
                SUBMIT,
                protos::SubmitRequest {
                    transaction_id: tx_id.clone(),
                    channel_id: call.channel.clone(),
                    prepared_transaction: Some(envelope.clone()),
                },
            )
            .await?;
        tracing::debug!(%tx_id, channel = %call.channel, "transaction submitted");
        Ok((tx_id, envelope))
    }

    async fn wait_for_commit(&self, channel: &str, tx_id: &str) -> Result<(), LedgerError> {
        let request = protos::CommitStatusRequest {
            transaction_id: tx_id.to_owned(),
            channel_id: channel.to_owned(),
            identity: proposal::creator(&self.identity),
        }
        .encode_to_vec();
        let signature = self.sign(&request).await?;
        let status: protos::CommitStatusResponse = self
            .unary(
                COMMIT_STATUS,
                protos::SignedCommitStatusRequest { request, signature },
            )
            .await?;
        commit_outcome(tx_id, &status)?;
        tracing::debug!(%tx_id, block = status.block_number, "transaction committed");
        Ok(())
    }

    /// Signs the transaction returned by the endorsement, ready for ordering.
    async fn sign_prepared(
        &self,
        endorsed: protos::EndorseResponse,
    ) -> Result<protos::Envelope, LedgerError> {
        let mut envelope = endorsed.prepared_transaction.ok_or_else(|| {
            LedgerError::InvalidResponse("endorsement returned no transaction".into())
        })?;
        envelope.signature = self.sign(&envelope.payload).await?;
        Ok(envelope)
    }
}

fn commit_outcome(tx_id: &str, status: &protos::CommitStatusResponse) -> Result<(), LedgerError> {
    if status.result == protos::TX_VALIDATION_VALID {
        Ok(())
    } else {
        Err(LedgerError::Commit {
            tx_id: tx_id.to_owned(),
            code: status.result,
        })
    }
}

fn chaincode_events_of(
    item: Result<protos::ChaincodeEventsResponse, tonic::Status>,
) -> Vec<Result<ChaincodeEvent, LedgerError>> {
    match item {
        Ok(response) => {
            let block_number = response.block_number;
            response
                .events
                .into_iter()
                .map(|event| {
                    Ok(ChaincodeEvent {
                        chaincode_name: event.chaincode_id,
                        block_number,
                        transaction_id: event.tx_id,
                        event_name: event.event_name,
                        payload: event.payload,
                    })
                })
                .collect()
        }
        Err(status) => vec![Err(LedgerError::Rpc(status))],
    }
}

/// Blocks pass through, a status message ends the delivery with an error.
fn block_of(
    item: Result<protos::DeliverResponse, tonic::Status>,
) -> Option<Result<BlockEvent, LedgerError>> {
    match item {
        Ok(protos::DeliverResponse {
            r#type: Some(protos::deliver_response::Type::Block(block)),
        }) => Some(Ok(BlockEvent {
            block_number: block.header.as_ref().map_or(0, |h| h.number),
            payload: block.encode_to_vec(),
        })),
        Ok(protos::DeliverResponse {
            r#type: Some(protos::deliver_response::Type::Status(status)),
        }) => Some(Err(LedgerError::InvalidResponse(format!(
            "block delivery ended with status {status}"
        )))),
        Ok(protos::DeliverResponse { r#type: None }) => None,
        Err(status) => Some(Err(LedgerError::Rpc(status))),
    }
}

impl LedgerClient for FabricClient {
    fn evaluate<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>> {
        async move {
            let (tx_id, signed) = self.signed_proposal(call).await?;
            let response: protos::EvaluateResponse = self
                .unary(
                    EVALUATE,
                    protos::EvaluateRequest {
                        transaction_id: tx_id,
                        channel_id: call.channel.clone(),
                        proposed_transaction: Some(signed),
                    },
                )
                .await?;
            Ok(response
                .result
                .map(|result| result.payload)
                .unwrap_or_default())
        }
        .boxed()
    }

    fn submit<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>> {
        async move {
            let (tx_id, envelope) = self.endorse_and_submit(call).await?;
            let result = proposal::endorsed_result(&envelope)?;
            self.wait_for_commit(&call.channel, &tx_id).await?;
            Ok(result)
        }
        .boxed()
    }

    fn submit_async<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<String, LedgerError>> {
        async move {
            let (tx_id, _) = self.endorse_and_submit(call).await?;
            Ok(tx_id)
        }
        .boxed()
    }

    fn chaincode_events<'a>(
        &'a self,
        channel: &'a str,
        chaincode: &'a str,
        start_block: Option<u64>,
    ) -> BoxFuture<'a, Result<EventStream<ChaincodeEvent>, LedgerError>> {
        async move {
            let request = protos::ChaincodeEventsRequest {
                channel_id: channel.to_owned(),
                chaincode_id: chaincode.to_owned(),
                identity: proposal::creator(&self.identity),
                start_position: Some(start_block.map_or_else(
                    protos::SeekPosition::next_commit,
                    protos::SeekPosition::specified,
                )),
            }
            .encode_to_vec();
            let signature = self.sign(&request).await?;

            let mut grpc = self.grpc().await?;
            let responses = grpc
                .server_streaming(
                    tonic::Request::new(protos::SignedChaincodeEventsRequest { request, signature }),
                    PathAndQuery::from_static(CHAINCODE_EVENTS),
                    ProstCodec::<_, protos::ChaincodeEventsResponse>::default(),
                )
                .await?
                .into_inner();

            let events = responses
                .flat_map(|item| stream::iter(chaincode_events_of(item)))
                .boxed();
            Ok(events)
        }
        .boxed()
    }

    fn block_events<'a>(
        &'a self,
        channel: &'a str,
        start_block: Option<u64>,
    ) -> BoxFuture<'a, Result<EventStream<BlockEvent>, LedgerError>> {
        async move {
            let payload = proposal::seek_payload(&self.identity, channel, start_block);
            let signature = self.sign(&payload).await?;
            let envelope = protos::Envelope { payload, signature };
            // the deliver service ends the stream when the request side closes
            let requests = stream::once(async move { envelope }).chain(stream::pending());

            let mut grpc = self.grpc().await?;
            let responses = grpc
                .streaming(
                    tonic::Request::new(requests),
                    PathAndQuery::from_static(DELIVER),
                    ProstCodec::<_, protos::DeliverResponse>::default(),
                )
                .await?
                .into_inner();

            let blocks = responses
                .filter_map(|item| futures::future::ready(block_of(item)))
                .boxed();
            Ok(blocks)
        }
        .boxed()
    }
}
