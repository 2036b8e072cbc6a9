use std::{sync::Arc, time::Duration};

use serde_json::Value;

use super::{
    jsonrpc::{self, ErrorObject},
    signer::SignatureCorrelator,
    subscriptions::SubscriptionRegistry,
    ConnectionId, OutboundSender,
};
use crate::{
    config::OperationMode,
    ledger::{Identity, LedgerConnector, LedgerError, LedgerSession, TargetNode},
};

/// Upper bound for closing every subscription of a connection that went away.
pub(crate) const SUBSCRIPTION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings derived from the gateway configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub mode: OperationMode,
    pub sign_timeout: Duration,
}

/// State of one client connection. Lives exactly as long as the connection.
pub(crate) struct Session {
    id: ConnectionId,
    outbound: OutboundSender,
    registry: Arc<SubscriptionRegistry>,
    correlator: Arc<SignatureCorrelator>,
    connector: Arc<dyn LedgerConnector>,
    mode: OperationMode,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        outbound: OutboundSender,
        connector: Arc<dyn LedgerConnector>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id,
            registry: Arc::new(SubscriptionRegistry::new(id)),
            correlator: Arc::new(SignatureCorrelator::new(
                outbound.clone(),
                settings.sign_timeout,
            )),
            outbound,
            connector,
            mode: settings.mode,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn outbound(&self) -> &OutboundSender {
        &self.outbound
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &SignatureCorrelator {
        &self.correlator
    }

    /// Queues a frame for the writer. Fails only once the connection is gone.
    pub fn send(&self, frame: String) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Replies to a call. Notifications (no id) get nothing.
    pub fn reply(&self, id: Option<&Value>, result: Result<Value, ErrorObject>) {
        let Some(id) = id else {
            return;
        };
        let frame = match result {
            Ok(result) => jsonrpc::response(id, result),
            Err(error) => jsonrpc::error_response(id, &error),
        };
        if !self.send(frame) {
            tracing::debug!(conn = %self.id, "connection gone before reply could be sent");
        }
    }

    /// Opens a ledger session for `identity` whose signatures are requested from this
    /// connection's client.
    pub async fn open_ledger(
        &self,
        identity: Identity,
        target: &TargetNode,
    ) -> Result<LedgerSession, LedgerError> {
        let signer = Arc::new(self.correlator.signer_for(identity.certificate.clone()));
        LedgerSession::open(self.connector.as_ref(), identity, signer, target).await
    }

    /// Connection teardown: fails pending signatures and closes every subscription,
    /// bounded by [`SUBSCRIPTION_CLOSE_TIMEOUT`].
    pub async fn close(&self) {
        self.correlator.fail_all();
        if tokio::time::timeout(SUBSCRIPTION_CLOSE_TIMEOUT, self.registry.close_all())
            .await
            .is_err()
        {
            tracing::warn!(conn = %self.id, "timed out closing subscriptions");
        }
    }
}
