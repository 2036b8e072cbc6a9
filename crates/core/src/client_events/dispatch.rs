//! Routing of inbound frames to handlers.
//!
//! Framing problems are answered right away. Replies go to the signature correlator.
//! Calls become futures the connection loop runs as separate tasks, so a slow ledger
//! call never holds up reading the next frame.

use std::{error::Error as StdError, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use serde_json::{json, Value};
use thiserror::Error;

use super::{
    jsonrpc::{self, Call, ErrorCode, ErrorObject, Inbound},
    params::{self, EventKind, ParamsError},
    session::Session,
    subscriptions::spawn_forwarder,
};
use crate::{
    config::OperationMode,
    ledger::{BlockEvent, ChaincodeEvent, LedgerError},
    util::{encode_base64, error_chain},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Evaluate,
    Submit,
    SubmitAsync,
    Subscribe,
    Unsubscribe,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "fabric_evaluate" => Some(Method::Evaluate),
            "fabric_submit" => Some(Method::Submit),
            "fabric_submitAsync" => Some(Method::SubmitAsync),
            "fabric_subscribe" => Some(Method::Subscribe),
            "fabric_unsubscribe" => Some(Method::Unsubscribe),
            _ => None,
        }
    }
}

/// Failure of one call, converted to an error reply at the handler boundary.
#[derive(Debug, Error)]
pub(crate) enum CallError {
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(#[from] ParamsError),
    #[error("invalid params: unknown subscription {0}")]
    UnknownSubscription(String),
    #[error("connection is closing")]
    ConnectionClosing,
    #[error("failed to open ledger session")]
    Session(#[source] LedgerError),
    #[error("evaluation failed")]
    Evaluate(#[source] LedgerError),
    #[error("submission failed")]
    Submit(#[source] LedgerError),
    #[error("subscription failed")]
    Subscribe(#[source] LedgerError),
}

impl CallError {
    fn code(&self) -> ErrorCode {
        match self {
            CallError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            CallError::InvalidParams(_) | CallError::UnknownSubscription(_) => {
                ErrorCode::InvalidParams
            }
            CallError::ConnectionClosing | CallError::Session(_) => ErrorCode::SessionFailed,
            CallError::Evaluate(_) => ErrorCode::EvaluationFailed,
            CallError::Submit(_) => ErrorCode::SubmissionFailed,
            CallError::Subscribe(_) => ErrorCode::SubscriptionFailed,
        }
    }

    /// Error object for the reply. The cause chain is only exposed in development mode.
    pub fn to_error_object(&self, mode: OperationMode) -> ErrorObject {
        let error = ErrorObject::new(self.code(), self.to_string());
        match (mode, self.source()) {
            (OperationMode::Development, Some(source)) => error.with_cause(error_chain(source)),
            _ => error,
        }
    }
}

pub(crate) struct ProtocolDispatcher {
    session: Arc<Session>,
}

impl ProtocolDispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Handles one inbound text frame. Returns the call to run when the frame is one.
    pub fn dispatch(&self, text: &str) -> Option<BoxFuture<'static, ()>> {
        match jsonrpc::classify(text) {
            Ok(Inbound::Call(call)) => {
                tracing::debug!(conn = %self.session.id(), method = %call.method, id = ?call.id, "call received");
                Some(run_call(self.session.clone(), call).boxed())
            }
            Ok(Inbound::Reply(reply)) => {
                self.session.correlator().resolve(&reply.id, reply.outcome);
                None
            }
            Err(rejection) => {
                tracing::debug!(conn = %self.session.id(), code = rejection.error.code, "rejected frame");
                self.session
                    .send(jsonrpc::error_response(&rejection.id, &rejection.error));
                None
            }
        }
    }
}

async fn run_call(session: Arc<Session>, call: Call) {
    let Call { id, method, params } = call;
    let outcome = match Method::from_name(&method) {
        Some(Method::Evaluate) => evaluate(&session, params).await.map(Some),
        Some(Method::Submit) => submit(&session, params).await.map(Some),
        Some(Method::SubmitAsync) => submit_async(&session, params).await.map(Some),
        Some(Method::Subscribe) => subscribe(&session, id.as_ref(), params)
            .await
            .map(|()| None),
        Some(Method::Unsubscribe) => unsubscribe(&session, params).await.map(Some),
        None => Err(CallError::MethodNotFound(method.clone())),
    };
    match outcome {
        // subscribe replies on its own
        Ok(None) => {}
        Ok(Some(result)) => session.reply(id.as_ref(), Ok(result)),
        Err(err) => {
            tracing::debug!(conn = %session.id(), %method, error = %err, cause = ?err.source().map(ToString::to_string), "call failed");
            session.reply(id.as_ref(), Err(err.to_error_object(session.mode())));
        }
    }
}

async fn evaluate(session: &Session, params: Value) -> Result<Value, CallError> {
    let params = params::transaction_params(params)?;
    let ledger = session
        .open_ledger(params.identity, &params.target)
        .await
        .map_err(CallError::Session)?;
    let result = ledger.evaluate(&params.call).await;
    ledger.close();
    result.map_err(CallError::Evaluate)
}

async fn submit(session: &Session, params: Value) -> Result<Value, CallError> {
    let params = params::transaction_params(params)?;
    let ledger = session
        .open_ledger(params.identity, &params.target)
        .await
        .map_err(CallError::Session)?;
    let result = ledger.submit_sync(&params.call).await;
    ledger.close();
    result.map_err(CallError::Submit)
}

async fn submit_async(session: &Session, params: Value) -> Result<Value, CallError> {
    let params = params::transaction_params(params)?;
    let ledger = session
        .open_ledger(params.identity, &params.target)
        .await
        .map_err(CallError::Session)?;
    let result = ledger.submit_async(&params.call).await;
    ledger.close();
    result.map(Value::String).map_err(CallError::Submit)
}

/// Opens the event stream, replies with the subscription id and only then starts
/// forwarding, so the reply always precedes the first notification.
async fn subscribe(session: &Session, id: Option<&Value>, params: Value) -> Result<(), CallError> {
    let params = params::subscribe_params(params)?;
    let ledger = session
        .open_ledger(params.identity, &params.target)
        .await
        .map_err(CallError::Session)?;

    match params.events {
        EventKind::Chaincode(chaincode) => {
            let events = match ledger
                .open_chaincode_event_stream(&params.channel, &chaincode, params.start_block)
                .await
            {
                Ok(events) => events,
                Err(err) => {
                    ledger.close();
                    return Err(CallError::Subscribe(err));
                }
            };
            let Some(registration) = session.registry().register() else {
                ledger.close();
                return Err(CallError::ConnectionClosing);
            };
            tracing::info!(conn = %session.id(), subscription = %registration.id, channel = %params.channel, %chaincode, "chaincode event subscription started");
            session.reply(id, Ok(json!(registration.id)));
            spawn_forwarder(
                session.registry().clone(),
                registration,
                session.outbound().clone(),
                ledger,
                events,
                chaincode_event_json,
            );
        }
        EventKind::Block => {
            let events = match ledger
                .open_block_event_stream(&params.channel, params.start_block)
                .await
            {
                Ok(events) => events,
                Err(err) => {
                    ledger.close();
                    return Err(CallError::Subscribe(err));
                }
            };
            let Some(registration) = session.registry().register() else {
                ledger.close();
                return Err(CallError::ConnectionClosing);
            };
            tracing::info!(conn = %session.id(), subscription = %registration.id, channel = %params.channel, "block event subscription started");
            session.reply(id, Ok(json!(registration.id)));
            spawn_forwarder(
                session.registry().clone(),
                registration,
                session.outbound().clone(),
                ledger,
                events,
                block_event_json,
            );
        }
    }
    Ok(())
}

async fn unsubscribe(session: &Session, params: Value) -> Result<Value, CallError> {
    let subscription = params::unsubscribe_params(params)?;
    if session.registry().close(&subscription).await {
        tracing::info!(conn = %session.id(), %subscription, "subscription closed by client");
        Ok(Value::Bool(true))
    } else {
        Err(CallError::UnknownSubscription(subscription))
    }
}

fn chaincode_event_json(event: ChaincodeEvent) -> Value {
    json!({
        "chaincodeName": event.chaincode_name,
        "blockNumber": event.block_number,
        "transactionId": event.transaction_id,
        "eventName": event.event_name,
        "payload": encode_base64(&event.payload),
    })
}

fn block_event_json(event: BlockEvent) -> Value {
    json!({
        "blockNumber": event.block_number,
        "block": encode_base64(&event.payload),
    })
}
