//! Per-connection server-push subscriptions.
//!
//! Each subscription is served by one forwarding task that owns the event stream and
//! the ledger session behind it. The registry only keeps a stop signal and a state
//! observer, so closing is idempotent: whoever removes the entry first (unsubscribe,
//! connection close, or the forwarder itself on stream failure) triggers the teardown,
//! later triggers find nothing to do.
//!
//! State transitions: `Active -> Closing -> Closed`.

use std::{collections::HashMap, fmt::Display, sync::Arc};

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use super::{
    jsonrpc::{self, ErrorCode, ErrorObject},
    ConnectionId, OutboundSender,
};
use crate::{
    ledger::{EventStream, LedgerSession},
    util::error_chain,
};

pub(crate) const SUBSCRIPTION_NOTIFICATION: &str = "fabric_subscription";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Closing,
    Closed,
}

impl Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionState::Active => write!(f, "active"),
            SubscriptionState::Closing => write!(f, "closing"),
            SubscriptionState::Closed => write!(f, "closed"),
        }
    }
}

struct SubscriptionHandle {
    stop: oneshot::Sender<()>,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    /// Signals the forwarder and waits until it reports `Closed`.
    async fn close(self) {
        let SubscriptionHandle { stop, mut state } = self;
        // an already finished forwarder dropped its receiver
        let _ = stop.send(());
        // a dropped sender means the forwarder is gone, which is as closed as it gets
        let _ = state
            .wait_for(|state| *state == SubscriptionState::Closed)
            .await;
    }
}

#[derive(Default)]
struct RegistryTable {
    entries: HashMap<String, SubscriptionHandle>,
    closed: bool,
}

/// Forwarder side of a freshly registered subscription.
pub(crate) struct Registration {
    pub id: String,
    stop: oneshot::Receiver<()>,
    state: watch::Sender<SubscriptionState>,
}

pub(crate) struct SubscriptionRegistry {
    conn: ConnectionId,
    table: Mutex<RegistryTable>,
}

impl SubscriptionRegistry {
    pub fn new(conn: ConnectionId) -> Self {
        Self {
            conn,
            table: Mutex::new(RegistryTable::default()),
        }
    }

    /// Adds a new `Active` subscription. `None` once the registry was closed.
    pub fn register(&self) -> Option<Registration> {
        let mut table = self.table.lock();
        if table.closed {
            return None;
        }
        let id = ulid::Ulid::new().to_string();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Active);
        table.entries.insert(
            id.clone(),
            SubscriptionHandle {
                stop: stop_tx,
                state: state_rx,
            },
        );
        tracing::debug!(conn = %self.conn, subscription = %id, "subscription registered");
        Some(Registration {
            id,
            stop: stop_rx,
            state: state_tx,
        })
    }

    /// Closes one subscription and waits for its forwarder to finish. Returns `false`
    /// when the id is unknown or closing already began.
    pub async fn close(&self, id: &str) -> bool {
        let Some(handle) = self.table.lock().entries.remove(id) else {
            return false;
        };
        tracing::debug!(conn = %self.conn, subscription = %id, "closing subscription");
        handle.close().await;
        true
    }

    /// Closes every subscription and refuses new ones.
    pub async fn close_all(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.entries.drain().map(|(_, handle)| handle).collect()
        };
        if !handles.is_empty() {
            tracing::debug!(conn = %self.conn, subscriptions = handles.len(), "closing all subscriptions");
        }
        futures::future::join_all(handles.into_iter().map(SubscriptionHandle::close)).await;
    }

    /// Drops the entry without waiting, used by a forwarder ending on its own.
    fn remove(&self, id: &str) {
        self.table.lock().entries.remove(id);
    }

    #[cfg(test)]
    pub fn state(&self, id: &str) -> Option<SubscriptionState> {
        self.table
            .lock()
            .entries
            .get(id)
            .map(|handle| *handle.state.borrow())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }
}

/// Spawns the task forwarding `events` as `fabric_subscription` notifications.
///
/// The task owns `session` and closes it once the stream is stopped.
pub(crate) fn spawn_forwarder<T, F>(
    registry: Arc<SubscriptionRegistry>,
    registration: Registration,
    outbound: OutboundSender,
    session: LedgerSession,
    mut events: EventStream<T>,
    encode: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Value + Send + 'static,
{
    let Registration {
        id,
        mut stop,
        state,
    } = registration;
    tokio::spawn(async move {
        loop {
            tokio::select! { biased;
                _ = &mut stop => {
                    tracing::debug!(subscription = %id, "stop requested");
                    break;
                }
                next = events.next() => {
                    match next {
                        Some(Ok(event)) => {
                            let frame = jsonrpc::notification(
                                SUBSCRIPTION_NOTIFICATION,
                                json!({ "subscription": id, "result": encode(event) }),
                            );
                            if outbound.send(frame).is_err() {
                                tracing::debug!(subscription = %id, "connection gone, stopping subscription");
                                registry.remove(&id);
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(subscription = %id, error = %err, "event stream failed");
                            let error = ErrorObject::new(ErrorCode::SubscriptionFailed, error_chain(&err));
                            let _ = outbound.send(jsonrpc::notification(
                                SUBSCRIPTION_NOTIFICATION,
                                json!({ "subscription": id, "error": error }),
                            ));
                            registry.remove(&id);
                            break;
                        }
                        None => {
                            tracing::debug!(subscription = %id, "event stream ended");
                            registry.remove(&id);
                            break;
                        }
                    }
                }
            }
        }
        state.send_replace(SubscriptionState::Closing);
        drop(events);
        session.close();
        state.send_replace(SubscriptionState::Closed);
        tracing::debug!(subscription = %id, "subscription closed");
    })
}
