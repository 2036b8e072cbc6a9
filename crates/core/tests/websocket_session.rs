//! End-to-end tests of the JSON-RPC WebSocket endpoint against an in-memory ledger.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use fabric_ws_gateway::{
    config::{Config, WebsocketApiConfig},
    ledger::BlockEvent,
    serve_gateway_with,
    test_utils::MockConnector,
    GatewayHandle, OperationMode,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use testresult::TestResult;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(mode: OperationMode, sign_timeout: Duration) -> Config {
    Config {
        mode,
        ws_api: WebsocketApiConfig {
            address: Ipv4Addr::LOCALHOST.into(),
            port: 0,
        },
        sign_timeout,
        ..Default::default()
    }
}

async fn start(connector: &MockConnector, mode: OperationMode) -> anyhow::Result<GatewayHandle> {
    serve_gateway_with(
        test_config(mode, Duration::from_secs(5)),
        Arc::new(connector.clone()),
    )
    .await
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await?;
        Ok(Self { ws })
    }

    async fn send_raw(&mut self, text: &str) -> anyhow::Result<()> {
        self.ws.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    async fn send(&mut self, frame: Value) -> anyhow::Result<()> {
        self.send_raw(&frame.to_string()).await
    }

    async fn next(&mut self) -> anyhow::Result<Value> {
        loop {
            let msg = tokio::time::timeout(FRAME_TIMEOUT, self.ws.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            match msg {
                Message::Text(_) | Message::Binary(_) => {
                    return Ok(serde_json::from_str(msg.to_text()?)?)
                }
                Message::Close(_) => anyhow::bail!("connection closed"),
                _ => continue,
            }
        }
    }

    async fn call(&mut self, id: u64, method: &str, params: Value) -> anyhow::Result<Value> {
        self.send(request(id, method, params)).await?;
        self.next().await
    }
}

fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

fn params() -> Value {
    json!({
        "identity": {"mspId": "Org1MSP", "certificate": "CERT"},
        "target": {"name": "peer0.org1.example.com", "address": "localhost:7051"},
        "channel": "mychannel",
        "chaincode": "basic",
        "function": "CreateAsset",
        "args": ["asset7", "blue"],
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn evaluate_returns_decoded_result() -> TestResult {
    let connector = MockConnector::default();
    connector.set_evaluate_payload(br#"{"ID":"asset7","Color":"blue"}"#.to_vec());
    let gateway = start(&connector, OperationMode::Production).await?;
    let mut client = Client::connect(gateway.addr).await?;

    let reply = client.call(1, "fabric_evaluate", params()).await?;

    assert_eq!(
        reply,
        json!({"jsonrpc": "2.0", "id": 1, "result": {"ID": "asset7", "Color": "blue"}})
    );
    let call = connector.last_call().ok_or("no call recorded")?;
    assert_eq!(call.function, "CreateAsset");
    assert_eq!(call.args, vec!["asset7", "blue"]);
    Ok(())
}

#[tokio::test]
async fn submit_waits_for_client_signature() -> TestResult {
    let connector = MockConnector::default();
    connector.set_submit_payload(b"created".to_vec());
    let gateway = start(&connector, OperationMode::Production).await?;
    let mut client = Client::connect(gateway.addr).await?;

    client.send(request(2, "fabric_submit", params())).await?;
    let sign_request = client.next().await?;
    assert_eq!(sign_request["method"], "signDigest");
    assert_eq!(sign_request["params"]["certificate"], "CERT");
    assert!(sign_request["params"]["digest"].is_string());

    client
        .send(json!({
            "jsonrpc": "2.0",
            "id": sign_request["id"],
            "result": {"signature": "c2lnbmF0dXJl"},
        }))
        .await?;

    let reply = client.next().await?;
    assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 2, "result": "created"}));
    Ok(())
}

#[tokio::test]
async fn unanswered_signature_times_out() -> TestResult {
    let connector = MockConnector::default();
    let gateway = serve_gateway_with(
        test_config(OperationMode::Development, Duration::from_millis(100)),
        Arc::new(connector.clone()),
    )
    .await?;
    let mut client = Client::connect(gateway.addr).await?;

    client.send(request(3, "fabric_submit", params())).await?;
    let sign_request = client.next().await?;
    assert_eq!(sign_request["method"], "signDigest");

    let reply = client.next().await?;
    assert_eq!(reply["id"], 3);
    assert_eq!(reply["error"]["code"], -32002);
    assert!(reply["error"]["data"]["cause"].is_string());
    Ok(())
}

#[tokio::test]
async fn invalid_frames_are_answered() -> TestResult {
    let connector = MockConnector::default();
    let gateway = start(&connector, OperationMode::Production).await?;
    let mut client = Client::connect(gateway.addr).await?;

    client.send_raw("{not json").await?;
    let reply = client.next().await?;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["error"]["code"], -32700);

    let mut subscribe = params();
    subscribe["eventType"] = json!("chaincode");
    subscribe
        .as_object_mut()
        .ok_or("params not an object")?
        .remove("chaincode");
    let reply = client.call(4, "fabric_subscribe", subscribe).await?;
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["error"]["code"], -32602);
    assert_eq!(connector.connects(), 0);
    Ok(())
}

#[tokio::test]
async fn block_subscription_lifecycle() -> TestResult {
    let connector = MockConnector::default();
    connector.set_evaluate_payload(b"7".to_vec());
    let gateway = start(&connector, OperationMode::Production).await?;
    let mut client = Client::connect(gateway.addr).await?;

    let mut subscribe = params();
    subscribe["eventType"] = json!("block");
    subscribe["startBlock"] = json!(10);
    let reply = client.call(5, "fabric_subscribe", subscribe).await?;
    let subscription = reply["result"]
        .as_str()
        .ok_or("subscription id missing")?
        .to_owned();

    let feed = connector.block_feed(0).await;
    for block_number in [10, 11] {
        feed.unbounded_send(Ok(BlockEvent {
            block_number,
            payload: vec![block_number as u8],
        }))?;
    }
    for expected in [10, 11] {
        let notification = client.next().await?;
        assert_eq!(notification["method"], "fabric_subscription");
        assert!(notification.get("id").is_none());
        assert_eq!(notification["params"]["subscription"], subscription.as_str());
        assert_eq!(notification["params"]["result"]["blockNumber"], expected);
    }

    let reply = client
        .call(6, "fabric_unsubscribe", json!({"subscriptionId": subscription}))
        .await?;
    assert_eq!(reply["result"], true);
    assert_eq!(connector.closed_clients(), 1);

    let _ = feed.unbounded_send(Ok(BlockEvent {
        block_number: 12,
        payload: vec![12],
    }));
    // the next frame must be the evaluate reply, not a late notification
    let reply = client.call(7, "fabric_evaluate", params()).await?;
    assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 7, "result": 7}));

    let reply = client
        .call(8, "fabric_unsubscribe", json!([subscription]))
        .await?;
    assert_eq!(reply["id"], 8);
    assert_eq!(reply["error"]["code"], -32602);
    Ok(())
}

#[tokio::test]
async fn disconnect_releases_subscriptions() -> TestResult {
    let connector = MockConnector::default();
    let gateway = start(&connector, OperationMode::Production).await?;
    let mut client = Client::connect(gateway.addr).await?;

    let mut subscribe = params();
    subscribe["eventType"] = json!("block");
    let reply = client.call(9, "fabric_subscribe", subscribe).await?;
    assert!(reply["result"].is_string());
    assert_eq!(connector.closed_clients(), 0);

    client.ws.close(None).await?;
    drop(client);

    assert!(
        wait_until(|| connector.closed_clients() == 1).await,
        "subscription was not closed after disconnect"
    );
    Ok(())
}

#[tokio::test]
async fn health_endpoint_and_shutdown() -> TestResult {
    let connector = MockConnector::default();
    let gateway = start(&connector, OperationMode::Production).await?;

    let mut stream = TcpStream::connect(gateway.addr).await?;
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("OK"), "{response}");

    tokio::time::timeout(FRAME_TIMEOUT, gateway.shutdown()).await??;
    Ok(())
}
