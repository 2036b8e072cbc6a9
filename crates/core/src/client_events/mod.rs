//! Client connections: JSON-RPC 2.0 sessions over WebSocket.
//!
//! Every connection gets a [`session::Session`] owning its subscription registry and
//! signature correlator. Inbound frames go through the [`dispatch::ProtocolDispatcher`];
//! everything leaving the gateway goes through the connection's single writer task.

pub(crate) mod dispatch;
pub(crate) mod jsonrpc;
mod params;
pub(crate) mod session;
pub(crate) mod signer;
pub(crate) mod subscriptions;
pub(crate) mod websocket;

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::UnboundedSender;

/// Outbound half of a connection. Carries whole, already serialized frames.
pub(crate) type OutboundSender = UnboundedSender<String>;

static CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ConnectionId(usize);

impl ConnectionId {
    #[cfg(test)]
    pub(crate) const fn new(id: usize) -> ConnectionId {
        Self(id)
    }

    pub fn next() -> Self {
        ConnectionId(CONNECTION_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
