//! Ledger sessions: the seam between the protocol layer and the ledger-gateway client.
//!
//! A [`LedgerSession`] binds one identity, one signer and one pooled connection. It
//! exposes evaluate/submit/event-stream operations and decodes their payloads for the
//! protocol layer. The actual ledger client is behind the [`LedgerClient`] trait; a
//! [`LedgerConnector`] builds clients for a target node. The gRPC implementation lives
//! in [`fabric`].

pub mod fabric;

use std::{fmt::Display, sync::Arc, time::Duration};

use futures::{future::BoxFuture, stream::BoxStream};
use serde_json::Value;
use thiserror::Error;

use crate::transport::ConnectError;

/// Stream of ledger events. Infinite until dropped or the underlying connection fails.
pub type EventStream<T> = BoxStream<'static, Result<T, LedgerError>>;

/// Identity a call is executed as. Never cached, passed along with every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub msp_id: String,
    /// PEM encoded X.509 certificate.
    pub certificate: String,
}

/// Chaincode to invoke, optionally narrowed to one contract inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaincodeRef {
    Simple(String),
    WithContract { name: String, contract: String },
}

impl ChaincodeRef {
    pub fn name(&self) -> &str {
        match self {
            ChaincodeRef::Simple(name) => name,
            ChaincodeRef::WithContract { name, .. } => name,
        }
    }

    /// Function name as the chaincode expects it, `contract:function` when a contract
    /// was given.
    pub fn qualified_function(&self, function: &str) -> String {
        match self {
            ChaincodeRef::Simple(_) => function.to_owned(),
            ChaincodeRef::WithContract { contract, .. } => format!("{contract}:{function}"),
        }
    }
}

impl Display for ChaincodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChaincodeRef::Simple(name) => write!(f, "{name}"),
            ChaincodeRef::WithContract { name, contract } => write!(f, "{name}/{contract}"),
        }
    }
}

/// Endorsing node a session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetNode {
    /// Node name, also used as the TLS server name override.
    pub name: String,
    /// `host:port` of the node.
    pub address: String,
    /// PEM trust anchor. Plaintext connection when absent.
    pub tls_root_cert: Option<String>,
}

/// One chaincode invocation. Arguments stay ordered for every submission mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCall {
    pub channel: String,
    pub chaincode: ChaincodeRef,
    pub function: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeEvent {
    pub chaincode_name: String,
    pub block_number: u64,
    pub transaction_id: String,
    pub event_name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub block_number: u64,
    /// Encoded block exactly as delivered by the node.
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("connection closed before a signature was received")]
    ConnectionClosed,
    #[error("no signature received within {0:?}")]
    Timeout(Duration),
    #[error("client rejected the signing request: {0}")]
    Rejected(String),
    #[error("malformed signature reply: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("signing failed")]
    Signing(#[from] SigningError),
    #[error("gateway call failed")]
    Rpc(#[from] tonic::Status),
    #[error("transaction {tx_id} failed to commit with validation code {code}")]
    Commit { tx_id: String, code: i32 },
    #[error("invalid response from gateway: {0}")]
    InvalidResponse(String),
}

/// Signs message digests on behalf of one identity.
pub trait Signer: Send + Sync {
    fn sign<'a>(&'a self, digest: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, SigningError>>;
}

/// Ledger-gateway client bound to one identity, signer and connection.
pub trait LedgerClient: Send + Sync {
    fn evaluate<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>>;

    /// Submits and waits for the transaction to be committed.
    fn submit<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<Vec<u8>, LedgerError>>;

    /// Submits without waiting for commit, returning the transaction id.
    fn submit_async<'a>(
        &'a self,
        call: &'a TransactionCall,
    ) -> BoxFuture<'a, Result<String, LedgerError>>;

    fn chaincode_events<'a>(
        &'a self,
        channel: &'a str,
        chaincode: &'a str,
        start_block: Option<u64>,
    ) -> BoxFuture<'a, Result<EventStream<ChaincodeEvent>, LedgerError>>;

    fn block_events<'a>(
        &'a self,
        channel: &'a str,
        start_block: Option<u64>,
    ) -> BoxFuture<'a, Result<EventStream<BlockEvent>, LedgerError>>;
}

/// Builds ledger clients for a target node, reusing transport connections as it sees fit.
pub trait LedgerConnector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        identity: Identity,
        signer: Arc<dyn Signer>,
        target: &'a TargetNode,
    ) -> BoxFuture<'a, Result<Box<dyn LedgerClient>, LedgerError>>;
}

pub struct LedgerSession {
    client: Box<dyn LedgerClient>,
    target: String,
}

impl LedgerSession {
    pub async fn open(
        connector: &dyn LedgerConnector,
        identity: Identity,
        signer: Arc<dyn Signer>,
        target: &TargetNode,
    ) -> Result<Self, LedgerError> {
        tracing::debug!(msp_id = %identity.msp_id, target = %target.name, "opening ledger session");
        let client = connector.connect(identity, signer, target).await?;
        Ok(Self {
            client,
            target: target.name.clone(),
        })
    }

    pub async fn evaluate(&self, call: &TransactionCall) -> Result<Value, LedgerError> {
        tracing::debug!(channel = %call.channel, chaincode = %call.chaincode, function = %call.function, "evaluating transaction");
        let payload = self.client.evaluate(call).await?;
        Ok(decode_result(&payload))
    }

    pub async fn submit_sync(&self, call: &TransactionCall) -> Result<Value, LedgerError> {
        tracing::debug!(channel = %call.channel, chaincode = %call.chaincode, function = %call.function, "submitting transaction");
        let payload = self.client.submit(call).await?;
        Ok(decode_result(&payload))
    }

    pub async fn submit_async(&self, call: &TransactionCall) -> Result<String, LedgerError> {
        tracing::debug!(channel = %call.channel, chaincode = %call.chaincode, function = %call.function, "submitting transaction without waiting for commit");
        self.client.submit_async(call).await
    }

    pub async fn open_chaincode_event_stream(
        &self,
        channel: &str,
        chaincode: &str,
        start_block: Option<u64>,
    ) -> Result<EventStream<ChaincodeEvent>, LedgerError> {
        self.client
            .chaincode_events(channel, chaincode, start_block)
            .await
    }

    pub async fn open_block_event_stream(
        &self,
        channel: &str,
        start_block: Option<u64>,
    ) -> Result<EventStream<BlockEvent>, LedgerError> {
        self.client.block_events(channel, start_block).await
    }

    /// Releases the session. The pooled connection behind it stays with its owner.
    pub fn close(self) {
        tracing::trace!(target = %self.target, "closing ledger session");
        drop(self.client);
    }
}

/// Result payloads are returned as JSON when they parse as such, raw text otherwise.
pub fn decode_result(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
