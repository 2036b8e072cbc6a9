use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Extension, Router,
};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinSet};

use super::{
    dispatch::ProtocolDispatcher,
    jsonrpc::{self, ErrorCode, ErrorObject},
    session::{Session, SessionSettings},
    ConnectionId,
};
use crate::ledger::LedgerConnector;

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Shared by every connection accepted by one server.
pub(crate) struct WebSocketState {
    pub connector: Arc<dyn LedgerConnector>,
    pub settings: SessionSettings,
}

/// Mounts the JSON-RPC WebSocket endpoint at `/`.
pub(crate) fn router(state: Arc<WebSocketState>) -> Router {
    Router::new()
        .route("/", get(websocket_commands))
        .layer(Extension(state))
}

async fn websocket_commands(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<WebSocketState>>,
) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |ws: WebSocket| async move {
            let conn = ConnectionId::next();
            tracing::debug!(%conn, "websocket connection established");
            if let Err(error) = websocket_interface(conn, state, ws).await {
                tracing::warn!(%conn, %error, "websocket connection ended with error");
            }
        })
}

async fn websocket_interface(
    conn: ConnectionId,
    state: Arc<WebSocketState>,
    ws: WebSocket,
) -> anyhow::Result<()> {
    let (mut server_sink, mut client_stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    // single writer, every frame of this connection goes through here
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(err) = server_sink.send(Message::Text(frame.into())).await {
                tracing::debug!(%conn, %err, "error sending message to client");
                break;
            }
        }
        let _ = server_sink.close().await;
    });

    let session = Arc::new(Session::new(
        conn,
        outbound,
        state.connector.clone(),
        state.settings,
    ));
    let dispatcher = ProtocolDispatcher::new(session.clone());
    let mut calls = JoinSet::new();

    let result = loop {
        tokio::select! {
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        tracing::error!(%conn, %err, "call task panicked");
                    }
                }
            }
            msg = client_stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            let error = ErrorObject::new(ErrorCode::ParseError, "parse error: frame is not UTF-8");
                            session.send(jsonrpc::error_response(&serde_json::Value::Null, &error));
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Err(err)) => break Err(anyhow::Error::new(err)),
                };
                if let Some(call) = dispatcher.dispatch(&text) {
                    calls.spawn(call);
                }
            }
        }
    };

    tracing::debug!(%conn, "client disconnected, closing session");
    session.correlator().fail_all();
    calls.shutdown().await;
    session.close().await;
    drop(dispatcher);
    drop(session);
    writer.abort();
    result
}
